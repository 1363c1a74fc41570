//! Dialect A (ADC) hub command building and parsing.
//!
//! Covers the `SUP`/`SID`/`INF`/`GPA`/`PAS`/`QUI`/`CTM`/`RCM`/`NAT`/`RNT`/
//! `SCH` handlers. The 2-letter key/value parsing itself lives in
//! `wire::adc`; this module adds the dialect's specific command shapes and
//! the hub-session semantics layered on top (salted login, diffed `INF`,
//! SID bookkeeping via [`super::Hub`]).

use std::collections::{BTreeMap, HashSet};

use digest::Digest;

use super::{Error, Hub, State};
use crate::crypto::{sudp_key_to_base32, SudpKey};
use crate::ids::{encode_base32, Cid, Pid, Sid};
use crate::wire::adc::Command;

/// The base feature set we always advertise "send `SUP ADBAS0
/// ADBASE ADTIGR ADZLIF [ADBLO0] [ADUCM0]`".
pub const BASE_SUPPORTS: &[&str] = &["ADBAS0", "ADBASE", "ADTIGR", "ADZLIF"];

/// Builds our outbound `SUP`, appending any optional extra feature tokens
/// (`ADBLO0`, `ADUCM0`) the caller has enabled.
pub fn build_sup(extra: &[&str]) -> String {
    let mut parts = vec!["HSUP".to_string()];
    parts.extend(BASE_SUPPORTS.iter().map(|s| s.to_string()));
    parts.extend(extra.iter().map(|s| s.to_string()));
    parts.join(" ")
}

/// Parses the hub's `ISUP` reply, failing fatally if `ADBASE` is absent
/// "missing ADBASE is a fatal handshake failure".
pub fn parse_hub_sup(line: &str) -> Result<HashSet<String>, Error> {
    let cmd = Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    if cmd.header != "ISUP" {
        return Err(Error::Malformed(line.to_string()));
    }
    let set: HashSet<String> = cmd.params.iter().cloned().collect();
    if !set.contains("ADBASE") {
        return Err(Error::MissingBaseProtocol);
    }
    Ok(set)
}

/// Parses the hub's `ISID` assignment.
pub fn parse_sid(line: &str) -> Result<Sid, Error> {
    let cmd = Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    if cmd.header != "ISID" {
        return Err(Error::Malformed(line.to_string()));
    }
    let sid_str = cmd
        .params
        .get(0)
        .ok_or_else(|| Error::MalformedSid(line.to_string()))?;
    Sid::from_str(sid_str).ok_or_else(|| Error::MalformedSid(sid_str.clone()))
}

/// Applies a freshly-assigned `SID`, transitioning `Protocol -> Identify`
/// "`CONNECTING -> PROTOCOL -> IDENTIFY -> NORMAL`".
pub fn apply_sid(hub: &mut Hub, sid: Sid) {
    hub.own_sid = sid;
    hub.state = State::Identify;
}

/// The fields of our own `INF`, in a fixed order: id/pid first, then
/// capacity, then descriptive/version fields, connectivity last.
#[derive(Clone, Debug, Default)]
pub struct InfFields {
    pub cid: Option<Cid>,
    pub pid: Option<Pid>,
    pub nick: String,
    pub description: String,
    pub slots: u32,
    pub free_slots: u32,
    pub share_bytes: u64,
    pub file_count: u32,
    pub email: String,
    pub hubs_normal: u32,
    pub hubs_registered: u32,
    pub hubs_op: u32,
    pub tag: String,
    pub version: String,
    pub country: String,
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
    pub ipv4: String,
    pub ipv6: String,
    pub udp4: String,
    pub udp6: String,
    pub keyprint: String,
    /// The `SU` connectivity list.
    pub supports: Vec<String>,
}

/// Renders `fields` as a full `BINF` line (our own SID as the sole
/// address), used for the very first `INF` sent after `SID`.
pub fn build_inf(own_sid: Sid, fields: &InfFields) -> String {
    let mut out = format!("BINF {}", own_sid);
    if let Some(cid) = fields.cid {
        out.push_str(&format!(" ID{}", cid.to_base32()));
    }
    if let Some(pid) = fields.pid {
        out.push_str(&format!(" PD{}", pid.to_base32()));
    }
    if !fields.nick.is_empty() {
        out.push_str(&format!(" NI{}", fields.nick));
    }
    if !fields.description.is_empty() {
        out.push_str(&format!(" DE{}", fields.description));
    }
    out.push_str(&format!(" SL{}", fields.slots));
    out.push_str(&format!(" FS{}", fields.free_slots));
    out.push_str(&format!(" SS{}", fields.share_bytes));
    out.push_str(&format!(" SF{}", fields.file_count));
    if !fields.email.is_empty() {
        out.push_str(&format!(" EM{}", fields.email));
    }
    if fields.hubs_normal > 0 || fields.hubs_registered > 0 || fields.hubs_op > 0 {
        out.push_str(&format!(" HN{}", fields.hubs_normal));
        out.push_str(&format!(" HR{}", fields.hubs_registered));
        out.push_str(&format!(" HO{}", fields.hubs_op));
    }
    if !fields.tag.is_empty() {
        out.push_str(&format!(" AP{}", fields.tag));
    }
    if !fields.version.is_empty() {
        out.push_str(&format!(" VE{}", fields.version));
    }
    if !fields.country.is_empty() {
        out.push_str(&format!(" CO{}", fields.country));
    }
    if let Some(limit) = fields.upload_limit {
        out.push_str(&format!(" US{}", limit));
    }
    if let Some(limit) = fields.download_limit {
        out.push_str(&format!(" DS{}", limit));
    }
    if !fields.ipv4.is_empty() {
        out.push_str(&format!(" I4{}", fields.ipv4));
    }
    if !fields.ipv6.is_empty() {
        out.push_str(&format!(" I6{}", fields.ipv6));
    }
    if !fields.udp4.is_empty() {
        out.push_str(&format!(" U4{}", fields.udp4));
    }
    if !fields.udp6.is_empty() {
        out.push_str(&format!(" U6{}", fields.udp6));
    }
    if !fields.keyprint.is_empty() {
        out.push_str(&format!(" KP{}", fields.keyprint));
    }
    if !fields.supports.is_empty() {
        out.push_str(&format!(" SU{}", fields.supports.join(",")));
    }
    out
}

/// Turns `fields` into the 2-letter map used both to render a full `INF`
/// and to diff against the last-sent snapshot.
pub fn inf_field_map(fields: &InfFields) -> BTreeMap<String, String> {
    let rendered = build_inf(Sid::ZERO, fields);
    Command::parse(&rendered)
        .map(|cmd| cmd.as_field_map())
        .unwrap_or_default()
}

/// Builds a diffed `INF`: only changed-or-added keys, plus removed keys
/// rendered as bare (empty-value) tokens "only changed or
/// removed keys are transmitted". Returns `None` if nothing changed.
pub fn build_diffed_inf(own_sid: Sid, current: &BTreeMap<String, String>, last_sent: &BTreeMap<String, String>) -> Option<String> {
    let mut changed: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in current {
        if last_sent.get(key) != Some(value) {
            changed.insert(key.clone(), value.clone());
        }
    }
    for key in last_sent.keys() {
        if !current.contains_key(key) {
            changed.insert(key.clone(), String::new());
        }
    }
    if changed.is_empty() {
        return None;
    }
    Some(crate::wire::adc::render_field_map(&format!("BINF {}", own_sid), &changed))
}

/// `HPAS`'s payload: `base32(TIGER(password ++ salt))`.
pub fn compute_pas(password: &str, salt: &[u8]) -> String {
    let mut hasher = tiger::Tiger::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 24];
    bytes.copy_from_slice(&digest);
    encode_base32(&bytes)
}

pub fn build_pas(password: &str, salt: &[u8]) -> String {
    format!("HPAS {}", compute_pas(password, salt))
}

/// Parses `IGPA <salt>`, entering `Verify` and returning the decoded salt
/// bytes "`GPA` enters `VERIFY` and stores the salt".
pub fn apply_gpa(hub: &mut Hub, line: &str) -> Result<Vec<u8>, Error> {
    let cmd = Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    if cmd.header != "IGPA" {
        return Err(Error::Malformed(line.to_string()));
    }
    let salt_str = cmd
        .params
        .get(0)
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    let alphabet = base32::Alphabet::RFC4648 { padding: false };
    let salt = base32::decode(alphabet, salt_str).ok_or_else(|| Error::Malformed(line.to_string()))?;
    hub.state = State::Verify;
    hub.salt = Some(salt.clone());
    Ok(salt)
}

/// `QUI`'s payload "`QUI` removes a user and, if addressed
/// to self, may carry a redirect `RD`, a reconnect delay `TL` ... and a
/// status `MS`".
#[derive(Clone, Debug, Default)]
pub struct Qui {
    pub sid: Sid,
    pub redirect: Option<String>,
    pub reconnect_delay: Option<i64>,
    pub status: Option<String>,
}

pub fn parse_qui(line: &str) -> Result<Qui, Error> {
    let cmd = Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    if cmd.header != "IQUI" {
        return Err(Error::Malformed(line.to_string()));
    }
    let sid_str = cmd
        .params
        .get(0)
        .ok_or_else(|| Error::MalformedSid(line.to_string()))?;
    let sid = Sid::from_str(sid_str).ok_or_else(|| Error::MalformedSid(sid_str.clone()))?;
    let mut qui = Qui {
        sid,
        ..Default::default()
    };
    for param in cmd.params.iter().skip(1) {
        if let Some(rest) = param.strip_prefix("RD") {
            qui.redirect = Some(rest.to_string());
        } else if let Some(rest) = param.strip_prefix("TL") {
            qui.reconnect_delay = rest.parse().ok();
        } else if let Some(rest) = param.strip_prefix("MS") {
            qui.status = Some(rest.to_string());
        }
    }
    Ok(qui)
}

/// Applies a parsed `QUI`: removes the named user, and if it addresses
/// ourselves, disables auto-reconnect when `TL=-1`.
pub fn apply_qui(hub: &mut Hub, qui: &Qui) {
    if qui.sid == hub.own_sid {
        if qui.reconnect_delay == Some(-1) {
            hub.auto_reconnect = false;
        }
        hub.disconnect();
    } else {
        hub.remove_user(&qui.sid);
    }
}

/// `DCTM <protocol> <port> <token>`: direct connect request.
pub fn build_ctm(protocol: &str, port: u16, token: &str) -> String {
    format!("DCTM {} {} {}", protocol, port, token)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ctm {
    pub protocol: String,
    pub port: u16,
    pub token: String,
}

pub fn parse_ctm(line: &str) -> Result<Ctm, Error> {
    let cmd = Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    if cmd.header != "DCTM" && cmd.header != "ICTM" {
        return Err(Error::Malformed(line.to_string()));
    }
    let protocol = cmd.params.get(0).ok_or_else(|| Error::Malformed(line.to_string()))?.clone();
    let port: u16 = cmd
        .params
        .get(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    let token = cmd.params.get(2).ok_or_else(|| Error::Malformed(line.to_string()))?.clone();
    Ok(Ctm { protocol, port, token })
}

/// `DRCM <protocol> <token>`: reverse connect request.
pub fn build_rcm(protocol: &str, token: &str) -> String {
    format!("DRCM {} {}", protocol, token)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rcm {
    pub protocol: String,
    pub token: String,
}

pub fn parse_rcm(line: &str) -> Result<Rcm, Error> {
    let cmd = Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    if cmd.header != "DRCM" {
        return Err(Error::Malformed(line.to_string()));
    }
    let protocol = cmd.params.get(0).ok_or_else(|| Error::Malformed(line.to_string()))?.clone();
    let token = cmd.params.get(1).ok_or_else(|| Error::Malformed(line.to_string()))?.clone();
    Ok(Rcm { protocol, token })
}

/// `DNAT`/`DRNT <protocol> <port> <token>`: NAT traversal negotiation (spec
/// §4.3, §8 E6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatMessage {
    pub protocol: String,
    pub port: u16,
    pub token: String,
}

pub fn build_nat(protocol: &str, port: u16, token: &str) -> String {
    format!("DNAT {} {} {}", protocol, port, token)
}

pub fn build_rnt(protocol: &str, port: u16, token: &str) -> String {
    format!("DRNT {} {} {}", protocol, port, token)
}

fn parse_nat_like(line: &str, expected_header: &str) -> Result<NatMessage, Error> {
    let cmd = Command::parse(line).ok_or_else(|| Error::Malformed(line.to_string()))?;
    if cmd.header != expected_header {
        return Err(Error::Malformed(line.to_string()));
    }
    let protocol = cmd.params.get(0).ok_or_else(|| Error::Malformed(line.to_string()))?.clone();
    let port: u16 = cmd
        .params
        .get(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed(line.to_string()))?;
    let token = cmd.params.get(2).ok_or_else(|| Error::Malformed(line.to_string()))?.clone();
    Ok(NatMessage { protocol, port, token })
}

pub fn parse_nat(line: &str) -> Result<NatMessage, Error> {
    parse_nat_like(line, "DNAT")
}

pub fn parse_rnt(line: &str) -> Result<NatMessage, Error> {
    parse_nat_like(line, "DRNT")
}

/// Predefined extension groups for `SCH`'s `GR`/`RX` grouping: grouped
/// extensions (`GR`) plus exclude-extensions (`RX`) for SEGA-supporting
/// peers. Declared in a fixed order so `RX` output is deterministic.
const EXTENSION_GROUPS: &[(u8, &[&str])] = &[
    (1, &["flac", "mp3", "ogg", "wav", "ape", "m4a"]),
    (2, &["avi", "mp4", "mkv", "wmv", "mov"]),
];

/// Builds the pair of `SCH` commands a SEGA-aware client sends for one
/// string search: one grouped for peers advertising `SEGA`, one fully
/// expanded for those that don't. `ky` carries the SUDP key for this
/// search when we're active and ADCS ("a `KY` field carrying a base32
/// SUDP key if we're an active ADCS user"); both commands get the field
/// when one is supplied.
pub fn build_grouped_search(
    terms: &[String],
    extensions: &[String],
    ky: Option<&SudpKey>,
) -> (String, String) {
    let mut grouped_tokens: Vec<String> = Vec::new();
    let mut ungrouped: Vec<String> = Vec::new();
    let mut group_used: Option<(u8, &[&str])> = None;

    'outer: for &(group_id, members) in EXTENSION_GROUPS {
        let hit_count = extensions.iter().filter(|e| members.contains(&e.as_str())).count();
        if hit_count * 2 >= members.len() {
            group_used = Some((group_id, members));
            break 'outer;
        }
    }

    for ext in extensions {
        let in_group = group_used
            .map(|(_, members)| members.contains(&ext.as_str()))
            .unwrap_or(false);
        if !in_group {
            ungrouped.push(ext.clone());
        }
    }

    for ext in &ungrouped {
        grouped_tokens.push(format!("EX {}", ext));
    }
    if let Some((group_id, members)) = group_used {
        grouped_tokens.push(format!("GR {}", group_id));
        for member in members {
            if !extensions.iter().any(|e| e == member) {
                grouped_tokens.push(format!("RX {}", member));
            }
        }
    }

    let ky_token = ky.map(|k| format!("KY {}", sudp_key_to_base32(k)));

    let an_tokens: Vec<String> = terms.iter().map(|t| format!("AN {}", t)).collect();
    let mut sega_tokens: Vec<String> = an_tokens.iter().chain(grouped_tokens.iter()).cloned().collect();
    sega_tokens.extend(ky_token.clone());
    let sega_cmd = format!("FSCH +SEGA {}", sega_tokens.join(" "));

    let all_ex: Vec<String> = extensions.iter().map(|e| format!("EX {}", e)).collect();
    let mut non_sega_tokens: Vec<String> = an_tokens.iter().chain(all_ex.iter()).cloned().collect();
    non_sega_tokens.extend(ky_token);
    let non_sega_cmd = format!("FSCH -SEGA {}", non_sega_tokens.join(" "));

    (sega_cmd, non_sega_cmd)
}
