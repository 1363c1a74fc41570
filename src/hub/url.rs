//! Hub URL parsing: `(adc|adcs|dchub|nmdcs)://host[:port][?kp=SHA256/<base32>]`
//! (spec §6 "External Interfaces", "Hub URL").

use super::{Dialect, Error};

/// Default TCP port for every scheme ADC/NMDC share: 411 "Absence of
/// port defaults: ADC/NMDC 411, ADCS/NMDCS 411".
pub const DEFAULT_PORT: u16 = 411;

/// A parsed hub URL: dialect, TLS requirement, host, port, and an optional
/// pinned certificate keyprint from the `kp` query parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubUrl {
    pub dialect: Dialect,
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub pinned_keyprint: Option<String>,
}

impl HubUrl {
    /// Parses a raw hub URL string.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let url = url::Url::parse(raw).map_err(|_| Error::Malformed(raw.to_string()))?;
        let (dialect, tls) = match url.scheme() {
            "adc" => (Dialect::Adc, false),
            "adcs" => (Dialect::Adc, true),
            "dchub" => (Dialect::Nmdc, false),
            "nmdcs" => (Dialect::Nmdc, true),
            other => return Err(Error::Malformed(format!("unknown scheme {:?}", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Malformed(raw.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let pinned_keyprint = url
            .query_pairs()
            .find(|(key, _)| key == "kp")
            .map(|(_, value)| value.into_owned());
        Ok(Self {
            dialect,
            tls,
            host,
            port,
            pinned_keyprint,
        })
    }

    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adc_url_defaults_to_port_411_and_no_tls() {
        let url = HubUrl::parse("adc://hub.example.org").unwrap();
        assert_eq!(url.dialect, Dialect::Adc);
        assert!(!url.tls);
        assert_eq!(url.port, DEFAULT_PORT);
        assert_eq!(url.host, "hub.example.org");
    }

    #[test]
    fn adcs_url_sets_tls_and_keeps_explicit_port() {
        let url = HubUrl::parse("adcs://hub.example.org:5000").unwrap();
        assert_eq!(url.dialect, Dialect::Adc);
        assert!(url.tls);
        assert_eq!(url.port, 5000);
    }

    #[test]
    fn dchub_and_nmdcs_map_to_nmdc_dialect() {
        assert_eq!(HubUrl::parse("dchub://h").unwrap().dialect, Dialect::Nmdc);
        assert!(!HubUrl::parse("dchub://h").unwrap().tls);
        assert_eq!(HubUrl::parse("nmdcs://h").unwrap().dialect, Dialect::Nmdc);
        assert!(HubUrl::parse("nmdcs://h").unwrap().tls);
    }

    #[test]
    fn kp_query_parameter_pins_a_keyprint() {
        let url = HubUrl::parse("adcs://h?kp=SHA256/ABCDEF").unwrap();
        assert_eq!(url.pinned_keyprint.as_deref(), Some("SHA256/ABCDEF"));
    }

    #[test]
    fn missing_kp_leaves_no_pinned_keyprint() {
        let url = HubUrl::parse("adc://h").unwrap();
        assert_eq!(url.pinned_keyprint, None);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(HubUrl::parse("http://h").is_err());
    }
}
