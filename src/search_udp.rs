//! The auxiliary UDP search listener: SUDP decryption and legacy `$SR`
//! parsing.
//!
//! Listens on a v4 and a v6 socket and decrypts each datagram via
//! [`crate::crypto`]'s AES-128-CBC envelope. The key table here is the
//! searcher's side of the exchange: every outbound active search mints a
//! key via [`crate::crypto::SudpKey::generate`], and any datagram that
//! arrives within its 5-minute lifetime is tried against it.

use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::crypto::{sudp_decrypt, SudpKey};
use crate::wire::adc::Command;

const SUDP_KEY_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Ephemeral SUDP keys, one per outstanding active search, pruned once
/// they outlive [`SUDP_KEY_LIFETIME`].
#[derive(Default)]
pub struct SudpKeyTable {
    keys: Vec<(SudpKey, Instant)>,
}

impl SudpKeyTable {
    pub fn new() -> Self {
        Self { keys: Vec::new() }
    }

    /// Mints a key for a new outbound active search, for inclusion in the
    /// `SCH`'s `KY` field.
    pub fn generate(&mut self, now: Instant) -> SudpKey {
        let key = SudpKey::generate();
        self.keys.push((key, now));
        key
    }

    pub fn prune(&mut self, now: Instant) {
        self.keys
            .retain(|(_, minted_at)| now.duration_since(*minted_at) < SUDP_KEY_LIFETIME);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Tries every live key against `ciphertext`, returning the first
    /// successful decrypt "first tried for SUDP decryption
    /// against any key generated in the last 5 minutes".
    pub fn try_decrypt(&self, now: Instant, ciphertext: &[u8]) -> Option<Vec<u8>> {
        self.keys
            .iter()
            .filter(|(_, minted_at)| now.duration_since(*minted_at) < SUDP_KEY_LIFETIME)
            .find_map(|(key, _)| sudp_decrypt(key, ciphertext).ok())
    }
}

/// One parsed UDP search-reply payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UdpMessage {
    AdcRes(Command),
    LegacySr(String),
}

/// Parses a decrypted (or plaintext) UDP datagram body. The payload must
/// be newline-terminated UTF-8; a dialect-A line dispatches as `RES`, a
/// `$`-prefixed line dispatches as legacy `$SR`, anything else is ignored
///.
pub fn parse_udp_payload(raw: &[u8]) -> Option<UdpMessage> {
    let text = std::str::from_utf8(raw).ok()?;
    let line = text.strip_suffix('\n').unwrap_or(text).trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }
    if let Some(legacy) = line.strip_prefix('$') {
        if legacy.starts_with("SR ") {
            return Some(UdpMessage::LegacySr(line.to_string()));
        }
        return None;
    }
    let cmd = Command::parse(line)?;
    if cmd.header.ends_with("RES") {
        Some(UdpMessage::AdcRes(cmd))
    } else {
        None
    }
}

/// An incoming datagram, already demultiplexed from whichever of the v4/v6
/// sockets received it.
#[derive(Clone, Debug)]
pub struct InboundDatagram {
    pub from: std::net::SocketAddr,
    pub payload: Vec<u8>,
}

/// Owns the v4 and v6 listening sockets and forwards parsed messages to
/// `sink`.
pub struct SudpListener {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl SudpListener {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let v4 = UdpSocket::bind(("0.0.0.0", port)).await.ok();
        let v6 = UdpSocket::bind(("::", port)).await.ok();
        Ok(Self { v4, v6 })
    }

    /// Runs both read loops until the process shuts down, decrypting each
    /// datagram against `keys` (falling back to plaintext if decryption
    /// fails, since a peer may reply unencrypted) and forwarding anything
    /// that parses to `sink`.
    pub async fn run(self, keys: std::sync::Arc<parking_lot::Mutex<SudpKeyTable>>, sink: mpsc::UnboundedSender<UdpMessage>) {
        let Self { v4, v6 } = self;
        let mut tasks = Vec::new();
        if let Some(socket) = v4 {
            tasks.push(tokio::spawn(read_loop(socket, keys.clone(), sink.clone())));
        }
        if let Some(socket) = v6 {
            tasks.push(tokio::spawn(read_loop(socket, keys, sink)));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn read_loop(
    socket: UdpSocket,
    keys: std::sync::Arc<parking_lot::Mutex<SudpKeyTable>>,
    sink: mpsc::UnboundedSender<UdpMessage>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, _from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                log::warn!("sudp read error: {}", err);
                continue;
            }
        };
        let datagram = &buf[..len];
        let now = Instant::now();
        let decrypted = keys.lock().try_decrypt(now, datagram);
        let body = decrypted.unwrap_or_else(|| datagram.to_vec());
        if let Some(message) = parse_udp_payload(&body) {
            if sink.send(message).is_err() {
                return;
            }
        }
    }
}
