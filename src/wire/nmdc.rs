//! NMDC ("dialect B") helpers: pipe-delimited command parsing and the
//! `MyINFO` tag shape.

/// Splits a raw NMDC command (without its trailing `|`) into its leading
/// `$Command` token (if any) and the remainder.
pub fn split_command(raw: &str) -> (Option<&str>, &str) {
    if let Some(rest) = raw.strip_prefix('$') {
        let mut parts = rest.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let remainder = parts.next().unwrap_or("");
        (Some(cmd), remainder)
    } else {
        (None, raw)
    }
}

/// Builds the `M:A/P/5` mode tag plus hub-count/slot fields carried in
/// `MyINFO` "payloads include a tag describing mode ... hubs
/// counts, slots, min upload speed".
pub fn build_myinfo_tag(
    client_tag: &str,
    version: &str,
    mode: char,
    hubs_normal: u32,
    hubs_registered: u32,
    hubs_op: u32,
    slots: u32,
) -> String {
    format!(
        "<{} V:{},M:{},H:{}/{}/{},S:{}>",
        client_tag, version, mode, hubs_normal, hubs_registered, hubs_op, slots
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_extracts_dollar_prefixed_name() {
        let (cmd, rest) = split_command("$MyINFO $ALL nick desc$ $1$$0$");
        assert_eq!(cmd, Some("MyINFO"));
        assert!(rest.starts_with("$ALL"));
    }

    #[test]
    fn split_command_passthrough_for_chat() {
        let (cmd, rest) = split_command("<nick> hello there");
        assert_eq!(cmd, None);
        assert_eq!(rest, "<nick> hello there");
    }

    #[test]
    fn myinfo_tag_has_the_expected_shape() {
        let tag = build_myinfo_tag("dctp", "1.0", 'A', 3, 1, 0, 5);
        assert_eq!(tag, "<dctp V:1.0,M:A,H:3/1/0,S:5>");
    }
}
