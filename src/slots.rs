//! The upload slot manager: running/extra counters, reservations and the
//! waiting list.
//!
//! Admission grants a full slot if the user already owns one, or is
//! reserved/favorite/autoslot/free, else a mini-slot if the transfer
//! qualifies and the peer supports mini-slots; auto-slot promotion is
//! throttled to one grant per 30 seconds.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::conf::SlotConf;
use crate::Cid;

/// What kind of transfer is requesting a slot "tree/full-list/
/// partial-list or the file is <= mini-slot bytes".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferKind {
    File { size: u64 },
    Tree,
    FullList,
    PartialList,
}

impl TransferKind {
    fn is_mini_slot_eligible(&self, mini_slot_bytes: u64) -> bool {
        match self {
            TransferKind::Tree | TransferKind::FullList | TransferKind::PartialList => true,
            TransferKind::File { size } => *size <= mini_slot_bytes,
        }
    }
}

/// What a slot request needs to know about the requesting peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlotRequest {
    /// The user already holds a running upload slot (e.g. requesting the
    /// tree for a file whose file transfer already has a slot) "the
    /// user already owns a slot".
    pub owns_slot: bool,
    pub is_reserved: bool,
    pub is_favorite: bool,
    pub supports_mini_slots: bool,
    pub is_op: bool,
    pub is_connecting: bool,
}

/// Outcome of a slot admission check.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotGrant {
    Full,
    Mini,
    /// Denied; caller should enqueue the requester.
    Denied,
}

/// The upload slot manager.
pub struct Slots {
    conf: SlotConf,
    running: usize,
    extra: usize,
    reserved: HashSet<Cid>,
    /// Users already waiting, in FIFO order, each with the set of filenames
    /// they're waiting on "their per-request filename is added
    /// to a set".
    waiting: Vec<(Cid, HashSet<String>)>,
    connecting: std::collections::HashMap<Cid, Instant>,
    last_grant: Option<Instant>,
    last_speed_sample: u64,
}

impl Slots {
    pub fn new(conf: SlotConf) -> Self {
        Self {
            conf,
            running: 0,
            extra: 0,
            reserved: HashSet::new(),
            waiting: Vec::new(),
            connecting: std::collections::HashMap::new(),
            last_grant: None,
            last_speed_sample: 0,
        }
    }

    pub fn free_slots(&self) -> usize {
        self.conf.slots.saturating_sub(self.running)
    }

    pub fn free_extra_slots(&self) -> usize {
        self.conf.extra_slots.saturating_sub(self.extra)
    }

    pub fn reserve(&mut self, user: Cid) {
        self.reserved.insert(user);
    }

    pub fn set_connecting(&mut self, user: Cid) {
        self.connecting.insert(user, Instant::now());
    }

    pub fn clear_connecting(&mut self, user: &Cid) {
        self.connecting.remove(user);
    }

    pub fn is_connecting(&self, user: &Cid) -> bool {
        self.connecting.contains_key(user)
    }

    /// Current measured aggregate upload speed, bytes/sec. The caller
    /// (the engine's throughput sampler) is responsible for keeping this
    /// current; `getAutoSlot` only reads it.
    pub fn set_speed_sample(&mut self, bytes_per_sec: u64) {
        self.last_speed_sample = bytes_per_sec;
    }

    /// `UploadManager::getAutoSlot`: one promotion per `auto_slot_grant_interval`,
    /// only while measured throughput is below `min_upload_speed`.
    fn auto_slot_available(&self) -> bool {
        if self.conf.min_upload_speed == 0 {
            return false;
        }
        if let Some(last) = self.last_grant {
            if last.elapsed() < self.conf.auto_slot_grant_interval {
                return false;
            }
        }
        self.last_speed_sample < self.conf.min_upload_speed
    }

    /// Decides whether `user` requesting `kind` gets a slot right now
    ///. Does not mutate counters — call [`Slots::grant_full`]/
    /// [`Slots::grant_mini`] once the caller commits to honoring the grant.
    pub fn admit(&self, user: &Cid, kind: TransferKind, req: SlotRequest) -> SlotGrant {
        let has_free_slot = self.free_slots() > 0
            && (self.waiting.is_empty() && self.connecting.is_empty() || req.is_connecting);

        if req.owns_slot
            || req.is_reserved
            || req.is_favorite
            || self.auto_slot_available()
            || has_free_slot
        {
            return SlotGrant::Full;
        }

        let mini_eligible = kind.is_mini_slot_eligible(self.conf.mini_slot_bytes);
        let allowed_mini = req.is_op || self.free_extra_slots() > 0;
        if mini_eligible && req.supports_mini_slots && allowed_mini {
            return SlotGrant::Mini;
        }

        let _ = user;
        SlotGrant::Denied
    }

    pub fn grant_full(&mut self) {
        self.running += 1;
        self.last_grant = Some(Instant::now());
    }

    pub fn grant_mini(&mut self) {
        self.extra += 1;
    }

    pub fn release_full(&mut self) {
        self.running = self.running.saturating_sub(1);
    }

    pub fn release_mini(&mut self) {
        self.extra = self.extra.saturating_sub(1);
    }

    /// Enqueues a denied requester, returning their 1-based queue position
    /// "respond with the queue position".
    pub fn enqueue_waiting(&mut self, user: Cid, filename: String) -> usize {
        if let Some(pos) = self.waiting.iter().position(|(u, _)| *u == user) {
            self.waiting[pos].1.insert(filename);
            return pos + 1;
        }
        let mut files = HashSet::new();
        files.insert(filename);
        self.waiting.push((user, files));
        self.waiting.len()
    }

    pub fn dequeue_waiting(&mut self, user: &Cid) {
        self.waiting.retain(|(u, _)| u != user);
    }

    /// Grants free slots to waiting users in FIFO order as slots open up,
    /// returning the users promoted (`UploadManager::notifyQueuedUsers`).
    pub fn notify_queued_users(&mut self) -> Vec<Cid> {
        let mut promoted = Vec::new();
        while self.free_slots() > 0 && !self.waiting.is_empty() {
            let (user, _) = self.waiting.remove(0);
            self.grant_full();
            promoted.push(user);
        }
        promoted
    }

    /// Drops connecting entries older than the fixed 90-second timeout,
    /// called from the minute timer "A minute timer drops
    /// connecting entries older than 90s".
    pub fn expire_connecting(&mut self, now: Instant) {
        self.connecting
            .retain(|_, entered_at| now.duration_since(*entered_at) < CONNECTING_TIMEOUT);
    }
}

pub(crate) const CONNECTING_TIMEOUT: Duration = Duration::from_secs(90);

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(slots: usize, extra: usize) -> SlotConf {
        let mut c = SlotConf::new();
        c.slots = slots;
        c.extra_slots = extra;
        c.mini_slot_bytes = 64 * 1024;
        c
    }

    #[test]
    fn single_slot_second_user_denied_without_mini_eligibility() {
        // Property 14 setup: slots=1, one active download already running.
        let mut slots = Slots::new(conf(1, 3));
        slots.grant_full();
        let user = Cid([1; 24]);
        let grant = slots.admit(
            &user,
            TransferKind::File { size: 10 * 1024 * 1024 },
            SlotRequest::default(),
        );
        assert_eq!(grant, SlotGrant::Denied);
    }

    #[test]
    fn single_slot_second_user_admitted_for_tree_with_extra_available() {
        // Property 14: with slots=1 and one active download, a HIGHEST
        // request is admitted if extra<3 and it is a tree/full-list.
        let mut slots = Slots::new(conf(1, 3));
        slots.grant_full();
        let user = Cid([2; 24]);
        let req = SlotRequest {
            supports_mini_slots: true,
            ..Default::default()
        };
        let grant = slots.admit(&user, TransferKind::Tree, req);
        assert_eq!(grant, SlotGrant::Mini);
    }

    #[test]
    fn a_user_who_already_owns_a_slot_is_granted_a_second_full_slot() {
        // spec.md §4.6's first grant condition: "the user already owns a
        // slot" — e.g. requesting the tree for a file whose main transfer
        // already holds the only running slot.
        let mut slots = Slots::new(conf(1, 0));
        slots.grant_full();
        let user = Cid([9; 24]);
        let grant = slots.admit(
            &user,
            TransferKind::Tree,
            SlotRequest { owns_slot: true, ..Default::default() },
        );
        assert_eq!(grant, SlotGrant::Full);
    }

    #[test]
    fn reserved_user_always_gets_a_full_slot() {
        let mut slots = Slots::new(conf(1, 0));
        slots.grant_full();
        let user = Cid([3; 24]);
        let grant = slots.admit(
            &user,
            TransferKind::File { size: 1 },
            SlotRequest { is_reserved: true, ..Default::default() },
        );
        assert_eq!(grant, SlotGrant::Full);
    }

    #[test]
    fn waiting_queue_position_is_one_based_and_stable() {
        let mut slots = Slots::new(conf(0, 0));
        let a = Cid([4; 24]);
        let b = Cid([5; 24]);
        assert_eq!(slots.enqueue_waiting(a, "a.txt".into()), 1);
        assert_eq!(slots.enqueue_waiting(b, "b.txt".into()), 2);
        assert_eq!(slots.enqueue_waiting(a, "a2.txt".into()), 1);
    }

    #[test]
    fn notify_queued_users_promotes_in_fifo_order() {
        let mut slots = Slots::new(conf(2, 0));
        let a = Cid([6; 24]);
        let b = Cid([7; 24]);
        slots.enqueue_waiting(a, "a".into());
        slots.enqueue_waiting(b, "b".into());
        let promoted = slots.notify_queued_users();
        assert_eq!(promoted, vec![a, b]);
    }

    #[test]
    fn connecting_entries_expire_after_ninety_seconds() {
        let mut slots = Slots::new(conf(1, 0));
        let user = Cid([8; 24]);
        slots.set_connecting(user);
        assert!(slots.is_connecting(&user));
        slots.expire_connecting(Instant::now() + CONNECTING_TIMEOUT + Duration::from_secs(1));
        assert!(!slots.is_connecting(&user));
    }
}
