//! ADC ("dialect A") command parsing: the 2-letter-key map shared by `INF`
//! on both the hub and peer handshake.
//!
//! Command syntax per spec §6: `Type Cmd [Flags] [param ...]`, `Type` one of
//! `B,C,D,E,F,H,I,U`. This module only handles the INF-style key/value
//! payload, not per-command dispatch (that lives in `hub`/`peer`).

use std::collections::BTreeMap;

/// A parsed ADC command line: the message type+name token and its ordered
/// list of bare/keyed parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// e.g. `"BINF"`, `"ISUP"`, `"DRCM"`.
    pub header: String,
    /// Every space-separated token after the header, in order.
    pub params: Vec<String>,
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        let mut parts = line.split(' ');
        let header = parts.next()?.to_string();
        if header.is_empty() {
            return None;
        }
        let params = parts.map(|s| s.to_string()).collect();
        Some(Command { header, params })
    }

    pub fn render(&self) -> String {
        let mut out = self.header.clone();
        for param in &self.params {
            out.push(' ');
            out.push_str(param);
        }
        out
    }

    /// Interprets every 2-letter-prefixed parameter as an `INF`-style
    /// key/value pair (e.g. `NIfoo` -> `("NI", "foo")`). Bare tokens
    /// without a recognizable 2-letter key (shorter than 2 chars) are kept
    /// out of the map.
    pub fn as_field_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for param in &self.params {
            if param.len() < 2 {
                continue;
            }
            let (key, value) = param.split_at(2);
            map.insert(key.to_string(), value.to_string());
        }
        map
    }
}

/// Serializes a 2-letter-key map back into ADC parameter tokens, sorted by
/// key for determinism.
pub fn render_field_map(header: &str, fields: &BTreeMap<String, String>) -> String {
    let mut out = header.to_string();
    for (key, value) in fields {
        out.push(' ');
        out.push_str(key);
        out.push_str(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inf_round_trips_through_parse_and_render() {
        // Property 6: ADC INF parser followed by serializer reproduces the
        // same 2-letter-key map modulo unknown fields.
        let line = "BINF ABCD NIfoo SL1 FS1 SS0";
        let cmd = Command::parse(line).unwrap();
        let fields = cmd.as_field_map();
        assert_eq!(fields.get("NI").map(String::as_str), Some("foo"));
        assert_eq!(fields.get("SL").map(String::as_str), Some("1"));

        let rendered = render_field_map(&cmd.header, &fields);
        let reparsed = Command::parse(&rendered).unwrap();
        assert_eq!(reparsed.as_field_map(), fields);
    }

    #[test]
    fn empty_line_does_not_parse() {
        assert!(Command::parse("").is_none());
    }

    #[test]
    fn header_with_no_params_round_trips() {
        let cmd = Command::parse("ISID ABCD").unwrap();
        assert_eq!(cmd.header, "ISID");
        assert_eq!(cmd.params, vec!["ABCD"]);
        assert_eq!(cmd.render(), "ISID ABCD");
    }
}
