//! Hub session state machine, shared skeleton for both dialects.
//!
//! A hub is a single-session state machine (`CONNECTING -> PROTOCOL ->
//! IDENTIFY -> VERIFY -> NORMAL`), carrying the SID->OnlineUser map, the
//! last-sent `INF` cache used for diffing, and the per-hub search-flood
//! tracker. Dialect-specific command building/parsing lives in
//! [`adc`]/[`nmdc`]; this module holds what both share.

pub mod adc;
pub mod error;
pub mod nmdc;
pub mod url;

pub use error::Error;
pub use self::url::HubUrl;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::conf::HubConf;
use crate::ids::{Cid, Sid};
use crate::user::OnlineUser;

/// Hub session state: `INF` may only be sent in state `>=
/// Identify`; chat, search and CTM/RCM only in `Normal`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum State {
    Connecting,
    Protocol,
    Identify,
    Verify,
    Normal,
    Disconnected,
}

/// Which protocol dialect this session speaks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dialect {
    Adc,
    Nmdc,
}

impl Dialect {
    /// `\n` for dialect A, `|` for dialect B.
    pub fn separator(&self) -> u8 {
        match self {
            Dialect::Adc => b'\n',
            Dialect::Nmdc => b'|',
        }
    }
}

/// One hub session.
pub struct Hub {
    pub url: String,
    pub dialect: Dialect,
    pub tls: bool,
    pub state: State,
    pub own_sid: Sid,
    pub own_nick: String,
    pub salt: Option<Vec<u8>>,
    pub supports: HashSet<String>,
    users: HashMap<Sid, OnlineUser>,
    cid_to_sid: HashMap<Cid, Sid>,
    /// The field map of the last `INF` we actually sent, for diffing
    /// "a last-advertised-INF cache".
    pub last_sent_inf: BTreeMap<String, String>,
    /// Commands the hub has told us (`STA ERROR_COMMAND_ACCESS`) we may not
    /// send.
    pub forbidden_commands: HashSet<String>,
    pub auto_reconnect: bool,
    connected_at: Instant,
    last_activity: Instant,
    seekers: HashMap<Cid, VecDeque<Instant>>,
    penalized: HashMap<Cid, Instant>,
}

impl Hub {
    pub fn new(url: impl Into<String>, dialect: Dialect, tls: bool) -> Self {
        let now = Instant::now();
        Self {
            url: url.into(),
            dialect,
            tls,
            state: State::Connecting,
            own_sid: Sid::ZERO,
            own_nick: String::new(),
            salt: None,
            supports: HashSet::new(),
            users: HashMap::new(),
            cid_to_sid: HashMap::new(),
            last_sent_inf: BTreeMap::new(),
            forbidden_commands: HashSet::new(),
            auto_reconnect: true,
            connected_at: now,
            last_activity: now,
            penalized: HashMap::new(),
            seekers: HashMap::new(),
        }
    }

    /// Resets session-scoped state for a fresh TCP connection "a new connection resets the INF cache and SID to 0".
    pub fn on_connected(&mut self) {
        self.state = State::Protocol;
        self.own_sid = Sid::ZERO;
        self.last_sent_inf.clear();
        self.users.clear();
        self.cid_to_sid.clear();
        self.connected_at = Instant::now();
        self.last_activity = Instant::now();
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// `INF` may only be sent once we're at least `Identify`.
    pub fn can_send_inf(&self) -> bool {
        self.state >= State::Identify
    }

    /// Chat, search and CTM/RCM require full `Normal` state.
    pub fn can_chat_search_ctm(&self) -> bool {
        self.state == State::Normal
    }

    /// Property 10: before `SID` arrives, any attempt to send `INF` is a
    /// no-op. Callers check this before building/sending an `INF` frame.
    pub fn guard_send_inf(&self) -> Result<(), Error> {
        if self.can_send_inf() {
            Ok(())
        } else {
            Err(Error::NotPermittedInState)
        }
    }

    /// Spec §4.3: "after 120s in any pre-NORMAL state, force-disconnect
    /// with a LoginTimeout event."
    pub fn check_login_timeout(&self, timeout: Duration) -> Result<(), Error> {
        if self.state != State::Normal && self.connected_at.elapsed() >= timeout {
            return Err(Error::LoginTimeout(timeout));
        }
        Ok(())
    }

    /// Spec §4.3: "In NORMAL, every 120s of idle, send a keepalive."
    pub fn needs_keepalive(&self, interval: Duration) -> bool {
        self.state == State::Normal && self.last_activity.elapsed() >= interval
    }

    /// Registers `online_user` under `sid`, enforcing the `(CID, SID)`
    /// uniqueness invariant: a second SID
    /// for a known CID is dropped, not replacing the existing occurrence.
    pub fn register_user(&mut self, sid: Sid, online_user: OnlineUser) -> Result<(), Error> {
        let cid = online_user.cid();
        if let Some(&existing_sid) = self.cid_to_sid.get(&cid) {
            if existing_sid != sid {
                log::warn!(
                    "hub {}: second SID {} for known CID {} (existing {}), dropping",
                    self.url,
                    sid,
                    cid,
                    existing_sid
                );
                return Err(Error::DuplicateSidForCid);
            }
        }
        self.cid_to_sid.insert(cid, sid);
        self.users.insert(sid, online_user);
        Ok(())
    }

    /// Removes a user on `QUI` or disconnect.
    pub fn remove_user(&mut self, sid: &Sid) -> Option<OnlineUser> {
        let removed = self.users.remove(sid);
        if let Some(user) = &removed {
            self.cid_to_sid.remove(&user.cid());
        }
        removed
    }

    pub fn user(&self, sid: &Sid) -> Option<&OnlineUser> {
        self.users.get(sid)
    }

    pub fn user_mut(&mut self, sid: &Sid) -> Option<&mut OnlineUser> {
        self.users.get_mut(sid)
    }

    pub fn users(&self) -> impl Iterator<Item = &OnlineUser> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Disconnects, clearing all per-hub state the way a `QUI` addressed to
    /// ourselves or a transport error would.
    pub fn disconnect(&mut self) {
        self.state = State::Disconnected;
        self.users.clear();
        self.cid_to_sid.clear();
    }

    /// Search-flood protection: tracks the last 5s of searches
    /// per seeker; a seeker exceeding the configured limit in that window
    /// is penalized for `conf.search_flood_penalty` and silently dropped.
    /// Returns `true` if this search should be dropped.
    pub fn check_search_flood(&mut self, seeker: Cid, conf: &HubConf) -> bool {
        let now = Instant::now();
        if let Some(until) = self.penalized.get(&seeker) {
            if *until > now {
                return true;
            }
            self.penalized.remove(&seeker);
        }

        let window = self.seekers.entry(seeker).or_default();
        while let Some(&front) = window.front() {
            if now.duration_since(front) > conf.search_flood_window {
                window.pop_front();
            } else {
                break;
            }
        }
        window.push_back(now);

        if window.len() > conf.search_flood_limit {
            self.penalized.insert(seeker, now + conf.search_flood_penalty);
            log::warn!("hub {}: seeker {} tripped the search-flood limit", self.url, seeker);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{Identity, User, UserHandle};
    use std::sync::Arc;

    fn online_user(cid: Cid, sid: Sid) -> OnlineUser {
        let handle: UserHandle = Arc::new(parking_lot::Mutex::new(User::new(cid)));
        OnlineUser::new(handle, Identity::new(sid), "adc://example.test")
    }

    #[test]
    fn inf_is_a_no_op_before_sid_is_assigned() {
        // Property 10.
        let mut hub = Hub::new("adc://x", Dialect::Adc, false);
        hub.on_connected();
        assert_eq!(hub.state, State::Protocol);
        assert!(hub.guard_send_inf().is_err());
    }

    #[test]
    fn duplicate_sid_for_known_cid_is_rejected_and_count_unchanged() {
        // Property 12.
        let mut hub = Hub::new("adc://x", Dialect::Adc, false);
        let cid = Cid([9; 24]);
        hub.register_user(Sid::from_str("AAAA").unwrap(), online_user(cid, Sid::from_str("AAAA").unwrap()))
            .unwrap();
        assert_eq!(hub.user_count(), 1);

        let result = hub.register_user(
            Sid::from_str("BBBB").unwrap(),
            online_user(cid, Sid::from_str("BBBB").unwrap()),
        );
        assert!(matches!(result, Err(Error::DuplicateSidForCid)));
        assert_eq!(hub.user_count(), 1);
    }

    #[test]
    fn login_timeout_trips_after_the_configured_duration_while_not_normal() {
        let mut hub = Hub::new("adc://x", Dialect::Adc, false);
        hub.on_connected();
        assert!(hub.check_login_timeout(Duration::from_secs(0)).is_err());
        hub.state = State::Normal;
        assert!(hub.check_login_timeout(Duration::from_secs(0)).is_ok());
    }

    #[test]
    fn search_flood_penalizes_after_the_configured_limit() {
        let mut hub = Hub::new("adc://x", Dialect::Adc, false);
        let conf = HubConf::new();
        let seeker = Cid([1; 24]);
        let mut tripped = false;
        for _ in 0..(conf.search_flood_limit + 1) {
            tripped = hub.check_search_flood(seeker, &conf);
        }
        assert!(tripped);
    }
}
