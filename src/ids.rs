//! The 192-bit identifiers used throughout the core: the content id (CID),
//! the private id (PID) it's derived from, and the Tiger-tree root hash
//! (TTH). All three share the same on-wire shape: 24 raw bytes, base32
//! encoded to a fixed 39-character string (`ceil(24 * 8 / 5) == 39`).

use std::fmt;

use digest::Digest;

use crate::Digest192;

const BASE32_ALPHABET: base32::Alphabet = base32::Alphabet::RFC4648 { padding: false };

/// Encodes a 192-bit digest as the 39-character base32 string used on the
/// wire for CIDs, PIDs and TTH roots.
pub fn encode_base32(bytes: &Digest192) -> String {
    base32::encode(BASE32_ALPHABET, bytes)
}

/// Decodes a 39-character base32 string back into a 192-bit digest.
///
/// Returns `None` if the string isn't valid base32 or doesn't decode to
/// exactly 24 bytes.
pub fn decode_base32(s: &str) -> Option<Digest192> {
    let bytes = base32::decode(BASE32_ALPHABET, s)?;
    if bytes.len() != 24 {
        return None;
    }
    let mut out = [0u8; 24];
    out.copy_from_slice(&bytes);
    Some(out)
}

macro_rules! digest_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Digest192);

        impl $name {
            /// Parses a 39-character base32 CID/PID/TTH string.
            pub fn from_base32(s: &str) -> Option<Self> {
                decode_base32(s).map(Self)
            }

            /// Renders the id as its 39-character base32 string.
            pub fn to_base32(&self) -> String {
                encode_base32(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_base32())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_base32())
            }
        }
    };
}

digest_id!(Cid, "A 192-bit content identifier, `CID = TIGER(PID)`.");
digest_id!(Pid, "A private 192-bit identifier. Never leaves the client.");
digest_id!(TthValue, "A 192-bit Tiger-tree root hash.");

impl Pid {
    /// Generates a fresh, random PID. Normally done once and persisted as
    /// the `privateID` setting.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 24];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Derives this PID's public CID as `TIGER(PID)`.
    pub fn to_cid(&self) -> Cid {
        let mut hasher = tiger::Tiger::new();
        hasher.update(&self.0);
        let digest = hasher.finalize();
        let mut out = [0u8; 24];
        out.copy_from_slice(&digest);
        Cid(out)
    }
}

/// A hub-local session identifier: a 32-bit tag rendered as 4 printable
/// ASCII bytes on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sid(pub [u8; 4]);

impl Sid {
    /// The "no session id yet" sentinel, used before a hub has assigned us
    /// one "a new connection resets ... SID to 0".
    pub const ZERO: Sid = Sid([0, 0, 0, 0]);

    pub fn from_str(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return None;
        }
        let mut out = [0u8; 4];
        out.copy_from_slice(bytes);
        Some(Sid(out))
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", self.as_str())
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_round_trip() {
        // Property 9: base32 decode of any 39-char CID then re-encode
        // yields the same string (case-insensitive compare).
        let bytes: Digest192 = [
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19,
            20, 21, 22, 23, 24,
        ];
        let encoded = encode_base32(&bytes);
        assert_eq!(encoded.len(), 39);
        let decoded = decode_base32(&encoded).unwrap();
        assert_eq!(decoded, bytes);
        let re_encoded = encode_base32(&decoded);
        assert_eq!(encoded.to_uppercase(), re_encoded.to_uppercase());
    }

    #[test]
    fn cid_is_tiger_of_pid() {
        // Property 1: CID = TIGER(PID) for the local identity after init.
        let pid = Pid::generate();
        let cid = pid.to_cid();

        let mut hasher = tiger::Tiger::new();
        digest::Digest::update(&mut hasher, &pid.0);
        let expected = hasher.finalize();
        assert_eq!(&cid.0[..], &expected[..]);
    }

    #[test]
    fn sid_zero_is_four_nul_bytes() {
        assert_eq!(Sid::ZERO.0, [0, 0, 0, 0]);
    }

    #[test]
    fn sid_round_trips_through_wire_string() {
        let sid = Sid::from_str("ABCD").unwrap();
        assert_eq!(sid.as_str(), "ABCD");
    }
}
