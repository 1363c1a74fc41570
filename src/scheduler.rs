//! The download scheduler: per-second CQI arbitration and per-minute
//! cleanup.
//!
//! The queue itself ([`crate::queue::Queue`]) only answers "what's next
//! for this user"; this module owns the CQI per-(user,kind) state machine
//! that decides *when* to act on that answer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ids::Cid;
use crate::peer::ConnectionKind;
use crate::queue::Priority;

/// A connection queue item's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CqiState {
    Waiting,
    Connecting,
    Active,
    NoDownloadSlots,
}

/// One scheduler-tracked request for a peer connection: the user, token,
/// connection kind, lifecycle state, last-attempt timestamp, and a signed
/// error counter.
#[derive(Clone, Debug)]
pub struct Cqi {
    pub user: Cid,
    pub hub_url: String,
    pub token: String,
    pub kind: ConnectionKind,
    pub state: CqiState,
    pub last_attempt: Option<Instant>,
    /// Negative on a hard protocol error (retried only on explicit force);
    /// positive is a soft-failure count driving the backoff delay.
    pub errors: i32,
    pub entered_connecting_at: Option<Instant>,
}

impl Cqi {
    pub fn new(user: Cid, hub_url: impl Into<String>, token: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            user,
            hub_url: hub_url.into(),
            token: token.into(),
            kind,
            state: CqiState::Waiting,
            last_attempt: None,
            errors: 0,
            entered_connecting_at: None,
        }
    }

    /// Spec §7 "Recoverable": "backoff per CQI (60 s * max(1, errors))".
    fn backoff(&self) -> Duration {
        Duration::from_secs(60 * self.errors.max(1) as u64)
    }

    /// Property 13: a CQI that just failed with `errors = 2` is not
    /// retried for at least 120 s.
    fn is_due(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.duration_since(last) >= self.backoff(),
        }
    }
}

/// Gates whether a download may start this tick: true unless active
/// downloads are at the configured cap or the throughput ceiling is hit,
/// in which case `HIGHEST` priority still gets through up to `cap + 3`
/// "ask the upload-slot logic `startDownload(prio)` - true
/// unless slots are at max or throughput ceiling is hit".
pub struct DownloadAdmission {
    pub max_concurrent: usize,
    pub active: usize,
    pub throughput_bps: u64,
    pub throughput_ceiling_bps: u64,
}

impl DownloadAdmission {
    /// Builds admission limits from [`crate::conf::QueueConf`] plus the
    /// caller's live counters (active downloads, measured throughput).
    pub fn from_conf(conf: &crate::conf::QueueConf, active: usize, throughput_bps: u64) -> Self {
        Self {
            max_concurrent: conf.download_slots,
            active,
            throughput_bps,
            throughput_ceiling_bps: conf.max_download_speed,
        }
    }

    pub fn start_download(&self, priority: Priority) -> bool {
        let at_cap = self.active >= self.max_concurrent;
        let over_ceiling = self.throughput_ceiling_bps > 0 && self.throughput_bps >= self.throughput_ceiling_bps;
        if !at_cap && !over_ceiling {
            return true;
        }
        if priority == Priority::Highest {
            return self.active < self.max_concurrent + 3;
        }
        false
    }
}

/// What the scheduler wants the caller to do, emitted from a tick instead
/// of performed directly (the scheduler has no socket/hub access of its
/// own).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Drop `user`'s source on every item they're queued for (offline, or
    /// mutually-passive with no way to connect).
    DropUser { user: Cid },
    /// Request a peer connection from the hub at `hub_url` for `user`,
    /// carrying `token`.
    RequestConnection {
        user: Cid,
        hub_url: String,
        token: String,
    },
    /// A CQI's state changed; surfaced for the listener channel.
    StatusChanged { user: Cid, state: CqiState },
}

const CONNECTING_STALL: Duration = Duration::from_secs(50);
const CONNECTING_STALE_MINUTE: Duration = Duration::from_secs(90);
const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Owns every live CQI, keyed by `(user, kind)` "the
/// scheduler's per-(user,type) record".
#[derive(Default)]
pub struct Scheduler {
    cqis: HashMap<(Cid, ConnectionKind), Cqi>,
    attempted_this_tick: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cqis: HashMap::new(),
            attempted_this_tick: false,
        }
    }

    pub fn insert(&mut self, cqi: Cqi) {
        self.cqis.insert((cqi.user, cqi.kind), cqi);
    }

    pub fn get(&self, user: &Cid, kind: ConnectionKind) -> Option<&Cqi> {
        self.cqis.get(&(*user, kind))
    }

    pub fn len(&self) -> usize {
        self.cqis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cqis.is_empty()
    }

    /// Records a hard protocol failure: `errors` goes negative, meaning
    /// "only retry on an explicit force".
    pub fn mark_protocol_error(&mut self, user: &Cid, kind: ConnectionKind) {
        if let Some(cqi) = self.cqis.get_mut(&(*user, kind)) {
            cqi.errors = -(cqi.errors.abs() + 1);
            cqi.state = CqiState::Waiting;
        }
    }

    /// Records a recoverable failure, bumping the backoff counter (spec
    /// §7 "Recoverable").
    pub fn mark_recoverable_error(&mut self, user: &Cid, kind: ConnectionKind, now: Instant) {
        if let Some(cqi) = self.cqis.get_mut(&(*user, kind)) {
            cqi.errors = cqi.errors.abs() + 1;
            cqi.last_attempt = Some(now);
            cqi.state = CqiState::Waiting;
        }
    }

    pub fn mark_active(&mut self, user: &Cid, kind: ConnectionKind) {
        if let Some(cqi) = self.cqis.get_mut(&(*user, kind)) {
            cqi.state = CqiState::Active;
        }
    }

    /// One second-timer tick. `is_offline`
    /// and `is_passive` resolve per-user state the scheduler doesn't own;
    /// `we_are_passive` is our own connectivity mode; `priority_of` maps a
    /// CQI's user to the priority of the item driving this request.
    pub fn tick_second(
        &mut self,
        now: Instant,
        is_offline: impl Fn(&Cid) -> bool,
        is_passive: impl Fn(&Cid) -> bool,
        we_are_passive: bool,
        admission: &DownloadAdmission,
        priority_of: impl Fn(&Cid) -> Priority,
    ) -> Vec<Action> {
        self.attempted_this_tick = false;
        let mut actions = Vec::new();
        let mut to_drop = Vec::new();

        // Stalled CONNECTING CQIs revert first, independent of the rest of
        // the tick's single-attempt rule.
        for cqi in self.cqis.values_mut() {
            if cqi.state == CqiState::Connecting {
                if let Some(entered) = cqi.entered_connecting_at {
                    if now.duration_since(entered) >= CONNECTING_STALL {
                        cqi.errors = cqi.errors.abs() + 1;
                        cqi.state = CqiState::Waiting;
                        cqi.entered_connecting_at = None;
                        actions.push(Action::StatusChanged {
                            user: cqi.user,
                            state: cqi.state,
                        });
                    }
                }
            }
        }

        for ((user, kind), cqi) in self.cqis.iter_mut() {
            if cqi.state == CqiState::Active {
                continue;
            }
            if is_offline(user) {
                to_drop.push(*user);
                continue;
            }
            if *kind == ConnectionKind::Download && we_are_passive && is_passive(user) {
                to_drop.push(*user);
                continue;
            }
            if cqi.errors < 0 {
                // Only an explicit force clears a hard protocol error;
                // the scheduler never auto-retries it.
                continue;
            }
            if self.attempted_this_tick {
                continue;
            }
            if !cqi.is_due(now) {
                continue;
            }

            let priority = priority_of(user);
            if *kind == ConnectionKind::Download && !admission.start_download(priority) {
                cqi.state = CqiState::NoDownloadSlots;
                continue;
            }

            cqi.state = CqiState::Connecting;
            cqi.last_attempt = Some(now);
            cqi.entered_connecting_at = Some(now);
            self.attempted_this_tick = true;
            actions.push(Action::RequestConnection {
                user: *user,
                hub_url: cqi.hub_url.clone(),
                token: cqi.token.clone(),
            });
            actions.push(Action::StatusChanged {
                user: *user,
                state: CqiState::Connecting,
            });
        }

        for user in to_drop {
            self.cqis.retain(|(u, _), _| *u != user);
            actions.push(Action::DropUser { user });
        }

        actions
    }

    /// The minute timer: drops CQIs whose user has gone offline and
    /// reports transfer sockets idle longer than 180 s that aren't PM
    /// connections as due for disconnection.
    pub fn tick_minute(&mut self, now: Instant, is_offline: impl Fn(&Cid) -> bool) -> Vec<Action> {
        let mut actions = Vec::new();
        let stale: Vec<Cid> = self
            .cqis
            .iter()
            .filter(|(_, cqi)| {
                is_offline(&cqi.user)
                    || (cqi.state == CqiState::Connecting
                        && cqi
                            .entered_connecting_at
                            .map(|t| now.duration_since(t) >= CONNECTING_STALE_MINUTE)
                            .unwrap_or(false))
            })
            .map(|(_, cqi)| cqi.user)
            .collect();
        for user in stale {
            self.cqis.retain(|(u, _), _| *u != user);
            actions.push(Action::DropUser { user });
        }
        actions
    }
}

/// Whether a transfer socket idle for `idle_for` should be disconnected
/// by the minute timer "disconnects any transfer socket whose
/// last activity is older than 180 s and is not a PM connection".
pub fn should_disconnect_idle_transfer(idle_for: Duration, kind: ConnectionKind) -> bool {
    kind != ConnectionKind::Pm && idle_for >= TRANSFER_IDLE_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u8) -> Cid {
        Cid([n; 24])
    }

    #[test]
    fn property_13_backoff_of_120s_after_two_errors() {
        let mut cqi = Cqi::new(cid(1), "adc://x", "1", ConnectionKind::Download);
        cqi.errors = 2;
        cqi.last_attempt = Some(Instant::now());
        assert!(!cqi.is_due(Instant::now()));
        assert_eq!(cqi.backoff(), Duration::from_secs(120));
    }

    #[test]
    fn offline_user_is_dropped_on_tick() {
        let mut scheduler = Scheduler::new();
        scheduler.insert(Cqi::new(cid(1), "adc://x", "1", ConnectionKind::Download));
        let admission = DownloadAdmission {
            max_concurrent: 4,
            active: 0,
            throughput_bps: 0,
            throughput_ceiling_bps: 0,
        };
        let actions = scheduler.tick_second(
            Instant::now(),
            |_| true,
            |_| false,
            false,
            &admission,
            |_| Priority::Normal,
        );
        assert!(actions.contains(&Action::DropUser { user: cid(1) }));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn only_one_cqi_is_attempted_per_tick() {
        let mut scheduler = Scheduler::new();
        scheduler.insert(Cqi::new(cid(1), "adc://x", "1", ConnectionKind::Download));
        scheduler.insert(Cqi::new(cid(2), "adc://x", "2", ConnectionKind::Download));
        let admission = DownloadAdmission {
            max_concurrent: 4,
            active: 0,
            throughput_bps: 0,
            throughput_ceiling_bps: 0,
        };
        let actions = scheduler.tick_second(
            Instant::now(),
            |_| false,
            |_| false,
            false,
            &admission,
            |_| Priority::Normal,
        );
        let attempts = actions
            .iter()
            .filter(|a| matches!(a, Action::RequestConnection { .. }))
            .count();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn mutually_passive_download_is_dropped() {
        let mut scheduler = Scheduler::new();
        scheduler.insert(Cqi::new(cid(1), "adc://x", "1", ConnectionKind::Download));
        let admission = DownloadAdmission {
            max_concurrent: 4,
            active: 0,
            throughput_bps: 0,
            throughput_ceiling_bps: 0,
        };
        let actions = scheduler.tick_second(
            Instant::now(),
            |_| false,
            |_| true,
            true,
            &admission,
            |_| Priority::Normal,
        );
        assert!(actions.contains(&Action::DropUser { user: cid(1) }));
    }

    #[test]
    fn connecting_cqi_reverts_to_waiting_after_fifty_seconds() {
        let mut scheduler = Scheduler::new();
        let mut cqi = Cqi::new(cid(1), "adc://x", "1", ConnectionKind::Download);
        cqi.state = CqiState::Connecting;
        cqi.entered_connecting_at = Some(Instant::now() - Duration::from_secs(51));
        scheduler.insert(cqi);
        let admission = DownloadAdmission {
            max_concurrent: 4,
            active: 0,
            throughput_bps: 0,
            throughput_ceiling_bps: 0,
        };
        let actions = scheduler.tick_second(
            Instant::now(),
            |_| false,
            |_| false,
            false,
            &admission,
            |_| Priority::Normal,
        );
        assert_eq!(scheduler.get(&cid(1), ConnectionKind::Download).unwrap().state, CqiState::Waiting);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StatusChanged { state: CqiState::Waiting, .. })));
    }

    #[test]
    fn highest_priority_still_admitted_three_over_cap() {
        let admission = DownloadAdmission {
            max_concurrent: 2,
            active: 4,
            throughput_bps: 0,
            throughput_ceiling_bps: 0,
        };
        assert!(admission.start_download(Priority::Highest));
        assert!(!admission.start_download(Priority::Normal));
    }

    #[test]
    fn admission_from_conf_uses_download_slots_and_speed_ceiling() {
        let conf = crate::conf::QueueConf::new(std::env::temp_dir());
        let admission = DownloadAdmission::from_conf(&conf, conf.download_slots, 0);
        assert!(!admission.start_download(Priority::Normal));
        assert!(admission.start_download(Priority::Highest));
    }

    #[test]
    fn idle_transfer_past_180s_is_disconnected_unless_pm() {
        assert!(should_disconnect_idle_transfer(Duration::from_secs(181), ConnectionKind::Download));
        assert!(!should_disconnect_idle_transfer(Duration::from_secs(181), ConnectionKind::Pm));
        assert!(!should_disconnect_idle_transfer(Duration::from_secs(10), ConnectionKind::Download));
    }
}
