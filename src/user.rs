//! The user identity model: [`User`], per-hub [`Identity`] and
//! [`OnlineUser`].
//!
//! A user is born lazily on first sighting and shared across every hub it
//! appears on via a refcounted handle; an `OnlineUser` is a per-hub view
//! layered on top holding the hub-local `Identity`. [`OnlineUser`] carries
//! the owning hub's URL rather than a reference to the `Hub` value itself,
//! avoiding a `User` <-> `Hub` reference cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::ids::{Cid, Sid};

bitflags! {
    /// Flags on [`User`].
    pub struct UserFlags: u32 {
        const ONLINE          = 0b0000_0001;
        const PASSIVE         = 0b0000_0010;
        const TLS             = 0b0000_0100;
        const NMDC            = 0b0000_1000;
        const NO_ADC_1_0      = 0b0001_0000;
        const NO_ADCS_0_10    = 0b0010_0000;
        const OLD_CLIENT      = 0b0100_0000;
    }
}

bitflags! {
    /// Client-type bits carried on an [`Identity`].
    pub struct ClientType: u32 {
        const BOT        = 0b0001;
        const OP         = 0b0010;
        const HUB        = 0b0100;
        const HIDDEN     = 0b1000;
        const REGISTERED = 0b0001_0000;
    }
}

bitflags! {
    /// Per-identity flags.
    pub struct IdentityFlags: u32 {
        const SELF_ID     = 0b01;
        const IGNORE_CHAT = 0b10;
    }
}

/// Identity anchor keyed by CID, shared across every hub a user appears on
///.
#[derive(Debug)]
pub struct User {
    pub cid: Cid,
    pub flags: UserFlags,
}

impl User {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            flags: UserFlags::empty(),
        }
    }
}

/// A refcounted handle to a [`User`]; the same handle is shared by every
/// hub and queue source that references this CID.
pub type UserHandle = Arc<Mutex<User>>;

/// A hub-local view of a user: their 2-letter field map, SID, client-type
/// bits and per-identity flags.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    pub sid: Sid,
    fields: BTreeMap<String, String>,
    pub client_type: ClientType,
    pub flags: IdentityFlags,
}

impl Identity {
    pub fn new(sid: Sid) -> Self {
        Self {
            sid,
            fields: BTreeMap::new(),
            client_type: ClientType::empty(),
            flags: IdentityFlags::empty(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn nick(&self) -> Option<&str> {
        self.get("NI")
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Diffs this identity's field map against a previously-sent snapshot,
    /// returning changed-or-added keys plus removed keys, the way
    /// `hub::adc`'s `INF` sender only transmits what changed "Subsequent INFs are diffed against the last-sent map:
    /// only changed or removed keys are transmitted".
    pub fn diff(&self, last_sent: &BTreeMap<String, String>) -> (BTreeMap<String, String>, Vec<String>) {
        let mut changed = BTreeMap::new();
        for (key, value) in &self.fields {
            if last_sent.get(key) != Some(value) {
                changed.insert(key.clone(), value.clone());
            }
        }
        let removed: Vec<String> = last_sent
            .keys()
            .filter(|key| !self.fields.contains_key(*key))
            .cloned()
            .collect();
        (changed, removed)
    }
}

/// Identity plus a reference to the owning hub, removed on `QUI` or hub
/// disconnect. The hub is referenced by URL rather
/// than by value to avoid the User <-> Hub ownership cycle.
#[derive(Clone)]
pub struct OnlineUser {
    pub user: UserHandle,
    pub identity: Identity,
    pub hub_url: String,
}

impl OnlineUser {
    pub fn new(user: UserHandle, identity: Identity, hub_url: impl Into<String>) -> Self {
        Self {
            user,
            identity,
            hub_url: hub_url.into(),
        }
    }

    pub fn cid(&self) -> Cid {
        self.user.lock().cid
    }
}

/// The process-wide CID -> User table: users
/// are born lazily on first sighting and garbage-collected on a minute
/// timer, removing only entries with refcount 1 (i.e. held solely by this
/// table).
#[derive(Default)]
pub struct UserRegistry {
    users: std::collections::HashMap<Cid, UserHandle>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            users: std::collections::HashMap::new(),
        }
    }

    /// Returns the existing handle for `cid`, creating one if this is the
    /// first sighting.
    pub fn get_or_create(&mut self, cid: Cid) -> UserHandle {
        self.users
            .entry(cid)
            .or_insert_with(|| Arc::new(Mutex::new(User::new(cid))))
            .clone()
    }

    pub fn get(&self, cid: &Cid) -> Option<UserHandle> {
        self.users.get(cid).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Drops every user whose only remaining reference is this table's own
    /// `Arc` "garbage-collected on a minute timer, removing only
    /// entries with refcount 1".
    pub fn collect_garbage(&mut self) {
        self.users.retain(|_, handle| Arc::strong_count(handle) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_the_same_handle_for_repeated_sightings() {
        let mut registry = UserRegistry::new();
        let cid = Cid([1; 24]);
        let a = registry.get_or_create(cid);
        let b = registry.get_or_create(cid);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn garbage_collection_drops_only_unreferenced_users() {
        let mut registry = UserRegistry::new();
        let kept_cid = Cid([2; 24]);
        let dropped_cid = Cid([3; 24]);
        let kept = registry.get_or_create(kept_cid);
        registry.get_or_create(dropped_cid);

        registry.collect_garbage();

        assert!(registry.get(&kept_cid).is_some());
        assert!(registry.get(&dropped_cid).is_none());
        drop(kept);
    }

    #[test]
    fn identity_diff_reports_changed_and_removed_keys() {
        let mut identity = Identity::new(Sid::from_str("ABCD").unwrap());
        identity.set("NI", "alice");
        identity.set("SL", "3");

        let mut last_sent = BTreeMap::new();
        last_sent.insert("NI".to_string(), "alice".to_string());
        last_sent.insert("DE".to_string(), "old description".to_string());

        let (changed, removed) = identity.diff(&last_sent);
        assert_eq!(changed.get("SL").map(String::as_str), Some("3"));
        assert!(!changed.contains_key("NI"));
        assert_eq!(removed, vec!["DE".to_string()]);
    }
}
