//! Peer connection state machine, for both dialects.
//!
//! One TCP (optionally TLS) socket per connection, walking through
//! `CONNECT -> SUPNICK -> INF | (LOCK -> DIRECTION -> KEY) -> IDLE | SND ->
//! RUNNING`. Framing and the segment-size feedback loop live in
//! [`transfer`]; the token side table used to match an inbound socket
//! back to a pending request lives here as [`TokenTable`].

pub mod error;
pub mod transfer;

pub use error::Error;

use std::collections::HashMap;

use crate::hub::Dialect;
use crate::ids::{Cid, Sid};

/// Walks through the handshake states for a peer-to-peer connection; `Idle`
/// is where ADCGET/`$Get` requests are accepted, `Snd`/`Running` is the data
/// phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Connect,
    SupNick,
    Inf,
    Lock,
    Direction,
    Key,
    Idle,
    Snd,
    Running,
    Disconnected,
}

/// What a connection is carrying, matched against the CQI table on INF/the
/// nick lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Download,
    Upload,
    Pm,
}

/// Which side won the NMDC `Direction` tiebreak "both sides
/// pick a random 4-digit number; the higher number wins the download
/// slot; ties disconnect".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionWinner {
    Us,
    Them,
}

/// Resolves an NMDC `Direction` exchange. A tie is a protocol error; the
/// connection must be torn down and retried.
pub fn resolve_direction(our_number: u16, their_number: u16) -> Result<DirectionWinner, Error> {
    use std::cmp::Ordering;
    match our_number.cmp(&their_number) {
        Ordering::Greater => Ok(DirectionWinner::Us),
        Ordering::Less => Ok(DirectionWinner::Them),
        Ordering::Equal => Err(Error::DirectionTie),
    }
}

/// The process-wide `token -> (CID, kind)` side table. Opaque, base-10
/// tokens unique across all live connection requests let an accepted
/// incoming socket resolve back to the request that expects it. Also used
/// for the NMDC nick-based equivalent, keyed by nick instead of token.
#[derive(Default)]
pub struct TokenTable {
    by_token: HashMap<String, (Cid, ConnectionKind)>,
    by_nick: HashMap<String, (Cid, ConnectionKind)>,
    next_token: u64,
}

impl TokenTable {
    pub fn new() -> Self {
        Self {
            by_token: HashMap::new(),
            by_nick: HashMap::new(),
            next_token: 1,
        }
    }

    /// Mints a fresh opaque token and registers it against `(cid, kind)`,
    /// returning the token for inclusion in the outgoing `CTM`/`TO` field.
    pub fn issue(&mut self, cid: Cid, kind: ConnectionKind) -> String {
        let token = self.next_token.to_string();
        self.next_token += 1;
        self.by_token.insert(token.clone(), (cid, kind));
        token
    }

    /// Registers an outgoing `$ConnectToMe` so the expected nick can be
    /// matched against an incoming connection that doesn't carry a token.
    pub fn expect_nick(&mut self, nick: impl Into<String>, cid: Cid, kind: ConnectionKind) {
        self.by_nick.insert(nick.into(), (cid, kind));
    }

    pub fn resolve_token(&self, token: &str) -> Result<(Cid, ConnectionKind), Error> {
        self.by_token
            .get(token)
            .copied()
            .ok_or_else(|| Error::UnmatchedToken(token.to_string()))
    }

    pub fn resolve_nick(&self, nick: &str) -> Result<(Cid, ConnectionKind), Error> {
        self.by_nick
            .get(nick)
            .copied()
            .ok_or_else(|| Error::UnmatchedToken(nick.to_string()))
    }

    pub fn retire_token(&mut self, token: &str) {
        self.by_token.remove(token);
    }

    pub fn retire_nick(&mut self, nick: &str) {
        self.by_nick.remove(nick);
    }

    #[cfg(test)]
    pub(crate) fn insert_token_for_test(&mut self, token: &str, cid: Cid, kind: ConnectionKind) {
        self.by_token.insert(token.to_string(), (cid, kind));
    }
}

/// The inbound `INF` of a dialect-A peer handshake: just the fields
/// [`validate_peer_inf`] cares about.
#[derive(Clone, Debug)]
pub struct PeerInf {
    pub cid: Cid,
    pub token: String,
    pub is_pm: bool,
    pub keyprint: Option<String>,
    pub tls: bool,
}

/// Validates an inbound dialect-A peer `INF` against our local policy and
/// the CQI token table: required TLS, a known CID, a pinned keyprint match,
/// token resolution, and PM connections requiring TLS. Returns the
/// resolved `(CID, kind)` on success.
pub fn validate_peer_inf(
    inf: &PeerInf,
    socket_is_tls: bool,
    require_tls: bool,
    known_cids: impl Fn(&Cid) -> bool,
    pinned_keyprint: Option<&str>,
    keyprint_verifies: impl FnOnce(&str) -> bool,
    tokens: &TokenTable,
) -> Result<(Cid, ConnectionKind), Error> {
    if require_tls && !socket_is_tls {
        return Err(Error::RequireTlsViolation);
    }
    if !known_cids(&inf.cid) {
        return Err(Error::UnknownCid);
    }
    if let Some(pinned) = pinned_keyprint {
        if !keyprint_verifies(pinned) {
            return Err(Error::KeyprintMismatch);
        }
    }
    let (cid, kind) = tokens.resolve_token(&inf.token)?;
    if cid != inf.cid {
        return Err(Error::UnknownCid);
    }
    if kind == ConnectionKind::Pm && !inf.tls {
        return Err(Error::PmRequiresTls);
    }
    Ok((cid, kind))
}

/// Builds the dialect-A peer handshake's `SUP`/`INF` pair, mirroring the
/// hub handshake: `SUP`, then `INF` carrying `ID`, `TO` (token), and
/// optionally `PM`.
pub fn build_peer_sup(extra: &[&str]) -> String {
    crate::hub::adc::build_sup(extra)
}

pub fn build_peer_inf(own_cid: Cid, token: &str, is_pm: bool) -> String {
    let mut line = format!("CINF ID{} TO{}", own_cid.to_base32(), token);
    if is_pm {
        line.push_str(" PM1");
    }
    line
}

pub fn parse_peer_inf(line: &str) -> Result<PeerInf, Error> {
    let cmd = crate::wire::adc::Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    let fields = cmd.as_field_map();
    let cid = fields
        .get("ID")
        .and_then(|s| Cid::from_base32(s))
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    let token = fields
        .get("TO")
        .cloned()
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    Ok(PeerInf {
        cid,
        token,
        is_pm: fields.get("PM").map(|v| v == "1").unwrap_or(false),
        keyprint: fields.get("KP").cloned(),
        tls: fields.get("TL").map(|v| v == "1").unwrap_or(false),
    })
}

/// A live peer connection's session state, shared skeleton for both
/// dialects. The actual socket I/O lives in the engine's connection
/// manager; this struct is the state-machine core, driven by the frames it
/// receives.
pub struct PeerSession {
    pub dialect: Dialect,
    pub state: State,
    pub remote_cid: Option<Cid>,
    pub remote_sid: Option<Sid>,
    pub kind: Option<ConnectionKind>,
    pub token: Option<String>,
    pub is_outbound: bool,
    pub tls: bool,
}

impl PeerSession {
    pub fn outbound(dialect: Dialect, tls: bool) -> Self {
        Self {
            dialect,
            state: State::Connect,
            remote_cid: None,
            remote_sid: None,
            kind: None,
            token: None,
            is_outbound: true,
            tls,
        }
    }

    pub fn inbound(dialect: Dialect, tls: bool) -> Self {
        Self {
            dialect,
            state: State::Connect,
            remote_cid: None,
            remote_sid: None,
            kind: None,
            token: None,
            is_outbound: false,
            tls,
        }
    }

    /// Transitions on a successfully validated dialect-A `INF`.
    pub fn on_adc_inf_validated(&mut self, cid: Cid, kind: ConnectionKind, token: String) {
        self.remote_cid = Some(cid);
        self.kind = Some(kind);
        self.token = Some(token);
        self.state = State::Idle;
    }

    /// Transitions on a resolved NMDC `Key`, the end of the Lock/Direction/
    /// Key sequence.
    pub fn on_nmdc_key_resolved(&mut self, cid: Cid) {
        self.remote_cid = Some(cid);
        self.state = State::Idle;
    }

    pub fn begin_transfer(&mut self) {
        self.state = State::Snd;
    }

    pub fn finish_handshake_into_running(&mut self) {
        self.state = State::Running;
    }

    pub fn disconnect(&mut self) {
        self.state = State::Disconnected;
    }
}
