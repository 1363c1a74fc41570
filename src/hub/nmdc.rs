//! Dialect B (NMDC) hub command building and parsing.
//!
//! Covers `$Lock`/`$Key`, `$MyINFO`, `$ConnectToMe`/`$RevConnectToMe`, and
//! the protected-hub hostname guard against weaponized `ConnectToMe`
//! redirection. The `$Lock`->`$Key` transform itself lives in
//! [`crate::crypto::nmdc_make_key`]; pipe-splitting and the `MyINFO` tag
//! shape live in [`crate::wire::nmdc`].

use bitflags::bitflags;

use super::Error;
use crate::crypto::nmdc_make_key;
use crate::share::search::SearchQuery;
use crate::wire::nmdc::{build_myinfo_tag, split_command};
use crate::TthValue;

/// A handful of hostnames that have historically been used to redirect
/// clients into attacking a third party via `ConnectToMe`.
/// Refreshed daily by an out-of-scope external collaborator; this
/// is the in-memory set that collaborator populates.
#[derive(Default)]
pub struct ProtectedHosts {
    hosts: std::collections::HashSet<String>,
}

impl ProtectedHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, hosts: impl IntoIterator<Item = String>) {
        self.hosts = hosts.into_iter().map(|h| h.to_lowercase()).collect();
    }

    pub fn is_protected(&self, host: &str) -> bool {
        self.hosts.contains(&host.to_lowercase())
    }
}

/// Validates a `ConnectToMe`/`RevConnectToMe` target host against the
/// protected-hub set, refusing to connect if it matches.
pub fn validate_ctm_target(protected: &ProtectedHosts, host: &str) -> Result<(), Error> {
    if protected.is_protected(host) {
        Err(Error::ProtectedCtmTarget(host.to_string()))
    } else {
        Ok(())
    }
}

/// A parsed `$Lock <lock> Pk=<pk>` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockChallenge {
    pub lock: String,
    pub pk: Option<String>,
}

pub fn parse_lock(raw: &str) -> Option<LockChallenge> {
    let (cmd, rest) = split_command(raw);
    if cmd != Some("Lock") {
        return None;
    }
    let mut parts = rest.splitn(2, ' ');
    let lock = parts.next()?.to_string();
    let pk = parts
        .next()
        .and_then(|s| s.strip_prefix("Pk="))
        .map(|s| s.to_string());
    Some(LockChallenge { lock, pk })
}

/// Builds the initial handshake frames sent after receiving `$Lock`: `$Key`
/// derived via [`nmdc_make_key`], then `$ValidateNick` "Send
/// `Supports`, `Key <key>`, `ValidateNick`, then `Version`, `GetNickList`,
/// `MyINFO`".
pub fn build_handshake_frames(lock: &str, nick: &str, supports: &[&str]) -> Vec<String> {
    let key = nmdc_make_key(lock.as_bytes());
    vec![
        format!("$Supports {}", supports.join(" ")),
        format!("$Key {}", String::from_utf8_lossy(&key)),
        format!("$ValidateNick {}", nick),
    ]
}

pub fn build_version(version: &str) -> String {
    format!("$Version {}", version)
}

pub fn build_get_nick_list() -> String {
    "$GetNickList".to_string()
}

bitflags! {
    /// `MyINFO` status bits "status bits encode away, server,
    /// fireball, TLS".
    pub struct MyInfoStatus: u8 {
        const NORMAL   = 0x01;
        const AWAY     = 0x02;
        const SERVER   = 0x04;
        const FIREBALL = 0x08;
        const TLS      = 0x10;
    }
}

/// Builds a `$MyINFO` frame: nick, description+tag, connection speed
/// descriptor, status byte, email and share size "`MyINFO`
/// payloads include a tag describing mode ... status bits encode away,
/// server, fireball, TLS".
#[allow(clippy::too_many_arguments)]
pub fn build_myinfo(
    nick: &str,
    description: &str,
    client_tag: &str,
    version: &str,
    mode: char,
    hubs: (u32, u32, u32),
    slots: u32,
    min_upload_speed: &str,
    status: MyInfoStatus,
    email: &str,
    share_bytes: u64,
) -> String {
    let tag = build_myinfo_tag(client_tag, version, mode, hubs.0, hubs.1, hubs.2, slots);
    format!(
        "$MyINFO $ALL {} {}{}$ ${}{}${}${}$",
        nick,
        description,
        tag,
        min_upload_speed,
        status.bits() as char,
        email,
        share_bytes
    )
}

/// A parsed `$MyINFO`, extracting the pieces the core cares about (nick,
/// share size, status); the description+tag blob is passed through
/// unparsed since the core doesn't interpret it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MyInfo {
    pub nick: String,
    pub description_and_tag: String,
    pub share_bytes: u64,
    pub status: MyInfoStatus,
}

pub fn parse_myinfo(raw: &str) -> Option<MyInfo> {
    let (cmd, rest) = split_command(raw);
    if cmd != Some("MyINFO") {
        return None;
    }
    let rest = rest.strip_prefix("$ALL ")?;
    let (nick, rest) = rest.split_once(' ')?;
    let mut segments = rest.splitn(2, "$ $");
    let description_and_tag = segments.next()?.trim_end_matches('$').to_string();
    let remainder = segments.next()?;
    let mut parts = remainder.split('$');
    let speed_and_status = parts.next()?;
    let _email = parts.next().unwrap_or("");
    let share_bytes: u64 = parts.next().unwrap_or("0").parse().ok()?;
    let status_byte = speed_and_status.as_bytes().last().copied().unwrap_or(1);
    Some(MyInfo {
        nick: nick.to_string(),
        description_and_tag,
        share_bytes,
        status: MyInfoStatus::from_bits_truncate(status_byte),
    })
}

/// `$ConnectToMe <targetNick> <ip>:<port>`.
pub fn build_connect_to_me(target_nick: &str, ip: &str, port: u16) -> String {
    format!("$ConnectToMe {} {}:{}", target_nick, ip, port)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectToMe {
    pub target_nick: String,
    pub ip: String,
    pub port: u16,
}

pub fn parse_connect_to_me(raw: &str) -> Option<ConnectToMe> {
    let (cmd, rest) = split_command(raw);
    if cmd != Some("ConnectToMe") {
        return None;
    }
    let (target_nick, addr) = rest.split_once(' ')?;
    let (ip, port) = addr.rsplit_once(':')?;
    Some(ConnectToMe {
        target_nick: target_nick.to_string(),
        ip: ip.to_string(),
        port: port.parse().ok()?,
    })
}

/// `$RevConnectToMe <fromNick> <toNick>`.
pub fn build_rev_connect_to_me(from_nick: &str, to_nick: &str) -> String {
    format!("$RevConnectToMe {} {}", from_nick, to_nick)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevConnectToMe {
    pub from_nick: String,
    pub to_nick: String,
}

pub fn parse_rev_connect_to_me(raw: &str) -> Option<RevConnectToMe> {
    let (cmd, rest) = split_command(raw);
    if cmd != Some("RevConnectToMe") {
        return None;
    }
    let (from_nick, to_nick) = rest.split_once(' ')?;
    Some(RevConnectToMe {
        from_nick: from_nick.to_string(),
        to_nick: to_nick.to_string(),
    })
}

/// `$UserIP <nick> <ip>$$` entries, one per online user advertising a
/// reachable address.
pub fn parse_user_ip(raw: &str) -> Vec<(String, String)> {
    let (cmd, rest) = split_command(raw);
    if cmd != Some("UserIP") {
        return Vec::new();
    }
    rest.split("$$")
        .filter_map(|entry| {
            let (nick, ip) = entry.split_once(' ')?;
            Some((nick.to_string(), ip.to_string()))
        })
        .collect()
}

/// Legacy `$Search <ip:port|Hub> <sizeRestrict>?<sizeType>?<fileType>?<pattern>`
/// and the `$SA`/`$SP` TTH-search extensions "TTH-search
/// extensions (`$SA`, `$SP`)". `$SA` carries a TTH directly; `$SP` is the
/// passive variant routed back through the hub rather than direct UDP.
pub fn parse_search(raw: &str) -> Option<(String, SearchQuery)> {
    let (cmd, rest) = split_command(raw);
    match cmd {
        Some("Search") => {
            let (reply_to, query_part) = rest.split_once(' ')?;
            Some((reply_to.to_string(), parse_legacy_query(query_part)))
        }
        Some("SA") | Some("SP") => {
            let (reply_to, tth_part) = rest.split_once(' ')?;
            let tth = TthValue::from_base32(tth_part)?;
            Some((
                reply_to.to_string(),
                SearchQuery {
                    root: Some(tth),
                    ..Default::default()
                },
            ))
        }
        _ => None,
    }
}

fn parse_legacy_query(raw: &str) -> SearchQuery {
    // `sizeRestrict?sizeType?fileType?searchPattern`, `?`-delimited.
    let mut parts = raw.splitn(4, '?');
    let size_restrict = parts.next().unwrap_or("F");
    let size_type = parts.next().unwrap_or("1");
    let _file_type = parts.next().unwrap_or("1");
    let pattern = parts.next().unwrap_or("");

    let include: Vec<String> = pattern.split('$').map(|s| s.replace('$', " ")).collect();
    let mut query = SearchQuery {
        include,
        ..Default::default()
    };
    if size_restrict != "F" {
        let size: u64 = size_type.parse().unwrap_or(0);
        if size_restrict == "1" {
            query.size_min = size;
        } else if size_restrict == "2" {
            query.size_max = size;
        }
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_to_key_handshake_uses_the_crypto_transform() {
        let frames = build_handshake_frames("EXTENDEDPROTOCOLABCABCABCABCABCABC", "nick", &["UserCommand"]);
        assert_eq!(frames[0], "$Supports UserCommand");
        assert!(frames[1].starts_with("$Key "));
        assert_eq!(frames[2], "$ValidateNick nick");
    }

    #[test]
    fn myinfo_round_trips_nick_and_share_size() {
        let frame = build_myinfo(
            "alice",
            "a description",
            "dctp",
            "1.0",
            'A',
            (1, 0, 0),
            3,
            "100",
            MyInfoStatus::NORMAL,
            "",
            123456,
        );
        let parsed = parse_myinfo(&frame).unwrap();
        assert_eq!(parsed.nick, "alice");
        assert_eq!(parsed.share_bytes, 123456);
        assert!(parsed.status.contains(MyInfoStatus::NORMAL));
    }

    #[test]
    fn connect_to_me_round_trips() {
        let frame = build_connect_to_me("bob", "10.0.0.1", 4120);
        let parsed = parse_connect_to_me(&frame).unwrap();
        assert_eq!(parsed.target_nick, "bob");
        assert_eq!(parsed.ip, "10.0.0.1");
        assert_eq!(parsed.port, 4120);
    }

    #[test]
    fn protected_hub_hostnames_are_refused_as_ctm_targets() {
        let mut protected = ProtectedHosts::new();
        protected.replace(vec!["evil.example.test".to_string()]);
        assert!(validate_ctm_target(&protected, "evil.example.test").is_err());
        assert!(validate_ctm_target(&protected, "friendly.example.test").is_ok());
    }

    #[test]
    fn sa_search_extension_carries_a_tth_query() {
        let tth = TthValue([4; 24]);
        let frame = format!("$SA 10.0.0.1:412 {}", tth.to_base32());
        let (reply_to, query) = parse_search(&frame).unwrap();
        assert_eq!(reply_to, "10.0.0.1:412");
        assert_eq!(query.root, Some(tth));
    }
}
