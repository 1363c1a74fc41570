//! The Bloom filter used both for the local share index's fast negative
//! search check and for answering a remote `GET blom` request.
//!
//! For `n` items and `k` hash functions, the filter is sized to
//! `m = round_up(n * k / ln(2), 64)` bits.

use std::hash::{Hash, Hasher};

use bitvec::prelude::{BitVec, Lsb0};

/// Rounds `v` up to the next multiple of `to` (`to` must be non-zero).
fn round_up(v: u64, to: u64) -> u64 {
    ((v + to - 1) / to) * to
}

/// Computes the bit size `m` of a Bloom filter for `n` items and `k` hash
/// functions.
pub fn bit_size_for(n: usize, k: usize) -> u64 {
    let n = n as f64;
    let k = k as f64;
    let raw = (n * k / std::f64::consts::LN_2).ceil() as u64;
    round_up(raw.max(64), 64)
}

/// Errors validating a remote `GET blom` request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BloomParamError {
    #[error("k out of range [1,8]: {0}")]
    KOutOfRange(usize),
    #[error("h out of range [1,64]: {0}")]
    HOutOfRange(usize),
    #[error("requested m {requested} exceeds allowed maximum {max}")]
    MTooLarge { requested: u64, max: u64 },
}

/// Validates a remote `GET blom ... BK=k BH=h` request against our current
/// item count `n`, returning the bit size we'll actually serve.
///
/// Rejects `k∉[1,8]`, `h∉[1,64]`, or requests with
/// `m > 5 · round_up(n·k/ln 2, 64)` or, when `h<32`, `m > 2^h`.
pub fn validate_bloom_request(
    n: usize,
    k: usize,
    h: usize,
    requested_m: u64,
) -> Result<u64, BloomParamError> {
    if k == 0 || k > 8 {
        return Err(BloomParamError::KOutOfRange(k));
    }
    if h == 0 || h > 64 {
        return Err(BloomParamError::HOutOfRange(h));
    }
    let natural_m = bit_size_for(n, k);
    let max_allowed = natural_m * 5;
    if requested_m > max_allowed {
        return Err(BloomParamError::MTooLarge {
            requested: requested_m,
            max: max_allowed,
        });
    }
    if h < 32 {
        let cap = 1u64 << h;
        if requested_m > cap {
            return Err(BloomParamError::MTooLarge {
                requested: requested_m,
                max: cap,
            });
        }
    }
    Ok(requested_m.max(natural_m))
}

/// A Bloom filter over lowercased share names (file and directory names).
#[derive(Clone, Debug)]
pub struct Bloom {
    bits: BitVec<Lsb0, u8>,
    k: usize,
    /// Hash seed width in bits, analogous to the original's `h` parameter.
    h: usize,
}

impl Bloom {
    /// Creates an empty filter sized for `n` expected items with `k` hash
    /// functions and an `h`-bit hash width.
    pub fn new(n: usize, k: usize, h: usize) -> Self {
        let m = bit_size_for(n.max(1), k.max(1));
        Self {
            bits: BitVec::repeat(false, m as usize),
            k: k.max(1),
            h: h.max(1),
        }
    }

    /// Returns the filter's bit count.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Clears every bit, keeping the current size.
    pub fn clear(&mut self) {
        self.bits.fill(false);
    }

    fn positions(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let m = self.bits.len().max(1) as u64;
        let cap = if self.h < 32 { 1u64 << self.h } else { u64::MAX };
        (0..self.k).map(move |i| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            item.hash(&mut hasher);
            i.hash(&mut hasher);
            let raw = hasher.finish() % cap.min(u64::MAX);
            (raw % m) as usize
        })
    }

    /// Adds a raw byte key (used for the TTH-keyed remote `GET blom` filter,
    /// where items are 192-bit digests rather than names).
    pub fn add_raw(&mut self, key: &[u8]) {
        for pos in self.positions(key) {
            self.bits.set(pos, true);
        }
    }

    /// Returns true if the raw byte key might be present.
    pub fn contains_raw(&self, key: &[u8]) -> bool {
        self.positions(key).all(|pos| self.bits[pos])
    }

    /// Adds a (lowercased) name to the filter.
    pub fn add(&mut self, name: &str) {
        let lower = name.to_lowercase();
        self.add_raw(lower.as_bytes());
    }

    /// Returns true if `name` (case-insensitively) might be present.
    pub fn contains(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.contains_raw(lower.as_bytes())
    }

    /// Returns the raw bit payload, as served in an `SND` reply to a `GET
    /// blom` request.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone().into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_size_matches_formula() {
        // m = round_up(n*k/ln2, 64)
        let m = bit_size_for(1000, 4);
        let raw = (1000.0 * 4.0 / std::f64::consts::LN_2).ceil() as u64;
        assert_eq!(m, round_up(raw, 64));
        assert_eq!(m % 64, 0);
    }

    #[test]
    fn rejects_k_out_of_range() {
        assert_eq!(
            validate_bloom_request(100, 0, 10, 64),
            Err(BloomParamError::KOutOfRange(0))
        );
        assert_eq!(
            validate_bloom_request(100, 9, 10, 64),
            Err(BloomParamError::KOutOfRange(9))
        );
    }

    #[test]
    fn rejects_h_out_of_range() {
        assert_eq!(
            validate_bloom_request(100, 4, 0, 64),
            Err(BloomParamError::HOutOfRange(0))
        );
        assert_eq!(
            validate_bloom_request(100, 4, 65, 64),
            Err(BloomParamError::HOutOfRange(65))
        );
    }

    #[test]
    fn rejects_oversized_m() {
        let natural = bit_size_for(10, 4);
        let result = validate_bloom_request(10, 4, 40, natural * 6);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_m_exceeding_low_h_cap() {
        // h < 32 caps m at 2^h regardless of the 5x rule.
        let result = validate_bloom_request(2, 1, 4, 1 << 10);
        assert!(result.is_err());
    }

    #[test]
    fn contains_every_added_name_lowercased() {
        // Property 5: Bloom contains every indexed filename/dirname
        // lowercased.
        let mut bloom = Bloom::new(10, 4, 24);
        bloom.add("MyFile.TXT");
        bloom.add("SomeDir");
        assert!(bloom.contains("myfile.txt"));
        assert!(bloom.contains("MYFILE.TXT"));
        assert!(bloom.contains("somedir"));
    }

    #[test]
    fn negative_probe_is_likely_absent() {
        let mut bloom = Bloom::new(1000, 4, 24);
        bloom.add("present");
        // Not a strict guarantee (false positives are allowed by Bloom
        // filters), but with a sparsely populated large filter the
        // probability of this specific unrelated token colliding is
        // negligible, so we treat it as evidence the negative path exists.
        assert!(!bloom.contains("definitely-absent-xyz-123"));
    }
}
