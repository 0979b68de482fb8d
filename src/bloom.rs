//! Cryptographically salted Bloom filter.
//!
//! Bit positions are derived from a two-stage hash: SHA-256 over the salt and
//! element, then one SHA3-256 round per hash function. The salt is fixed for
//! the filter's lifetime, so membership answers are stable but unlinkable
//! across filter instances.

use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use std::sync::RwLock;

use crate::error::{Result, SearchError};
use crate::types::MAX_BLOOM_HASHES;

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Optimal bit count for `n` elements at false-positive rate `p`, rounded up
/// to a 64-bit word boundary.
fn optimal_bits(n: usize, p: f64) -> usize {
    let m = (-(n as f64) * p.ln() / (2f64.ln().powi(2))).ceil() as usize;
    m.div_ceil(64) * 64
}

/// Base hash count before the privacy-level bonus.
fn base_hashes(m: usize, n: usize) -> u32 {
    ((m as f64 / n as f64) * 2f64.ln()).round().max(1.0) as u32
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

struct BloomBits {
    words: Vec<u64>,
    element_count: u64,
}

/// Salted multi-hash Bloom filter. Bits only move 0 -> 1, so a reader racing
/// a writer can observe extra set bits but never cleared ones.
pub struct SaltedBloom {
    bits: RwLock<BloomBits>,
    salt: [u8; 32],
    size_bits: usize,
    hash_count: u32,
    configured_fpr: f64,
    privacy_level: u8,
}

/// Point-in-time snapshot of filter state.
#[derive(Clone, Debug, Serialize)]
pub struct BloomStats {
    pub size_bits: usize,
    pub hash_count: u32,
    pub element_count: u64,
    pub set_bits: u64,
    pub load_factor: f64,
    pub estimated_fpr: f64,
    pub configured_fpr: f64,
    pub privacy_level: u8,
    pub memory_bytes: usize,
}

impl SaltedBloom {
    /// Construct a filter sized for `expected_n` elements at `fpr`.
    ///
    /// `fpr` must be strictly inside (0, 1) and `expected_n` positive.
    /// A privacy level outside 1..=5 falls back to the default of 3.
    pub fn new(expected_n: usize, fpr: f64, privacy_level: u8) -> Result<Self> {
        if expected_n == 0 {
            return Err(SearchError::Internal("bloom filter needs expected_n > 0".into()));
        }
        if fpr <= 0.0 || fpr >= 1.0 {
            return Err(SearchError::Internal(format!(
                "bloom fpr must be in (0, 1) exclusive, got {fpr}"
            )));
        }
        let privacy_level = if (1..=5).contains(&privacy_level) { privacy_level } else { 3 };

        let size_bits = optimal_bits(expected_n, fpr);
        let hash_count =
            (base_hashes(size_bits, expected_n) + (privacy_level as u32 - 1)).min(MAX_BLOOM_HASHES);

        let mut salt = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        Ok(Self {
            bits: RwLock::new(BloomBits {
                words: vec![0u64; size_bits / 64],
                element_count: 0,
            }),
            salt,
            size_bits,
            hash_count,
            configured_fpr: fpr,
            privacy_level,
        })
    }

    /// Bit indices for an element: s = SHA-256(salt || e), then
    /// h_i = SHA3-256(s || i), first 8 bytes little-endian mod m.
    fn bit_indices(&self, element: &[u8]) -> Vec<usize> {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(element);
        let seed = hasher.finalize();

        (0..self.hash_count)
            .map(|i| {
                let mut h = Sha3_256::new();
                h.update(seed);
                h.update([i as u8]);
                let digest = h.finalize();
                let raw = u64::from_le_bytes(digest[..8].try_into().expect("8-byte slice"));
                (raw % self.size_bits as u64) as usize
            })
            .collect()
    }

    /// Insert an element. Empty input is rejected.
    pub fn add(&self, element: &[u8]) -> Result<()> {
        if element.is_empty() {
            return Err(SearchError::InvalidQuery("cannot add empty element".into()));
        }
        let indices = self.bit_indices(element);
        let mut bits = self.bits.write().map_err(|_| lock_poisoned())?;
        for idx in indices {
            bits.words[idx / 64] |= 1u64 << (idx % 64);
        }
        bits.element_count += 1;
        Ok(())
    }

    /// Membership test. `false` means the element was definitely never added.
    pub fn contains(&self, element: &[u8]) -> Result<bool> {
        if element.is_empty() {
            return Err(SearchError::InvalidQuery("cannot test empty element".into()));
        }
        let indices = self.bit_indices(element);
        let bits = self.bits.read().map_err(|_| lock_poisoned())?;
        Ok(indices.iter().all(|&idx| bits.words[idx / 64] & (1u64 << (idx % 64)) != 0))
    }

    /// Snapshot filter statistics. `estimated_fpr = load_factor ^ k`.
    pub fn stats(&self) -> BloomStats {
        let bits = self.bits.read().unwrap_or_else(|p| p.into_inner());
        let set_bits: u64 = bits.words.iter().map(|w| w.count_ones() as u64).sum();
        let load_factor = set_bits as f64 / self.size_bits as f64;
        BloomStats {
            size_bits: self.size_bits,
            hash_count: self.hash_count,
            element_count: bits.element_count,
            set_bits,
            load_factor,
            estimated_fpr: load_factor.powi(self.hash_count as i32),
            configured_fpr: self.configured_fpr,
            privacy_level: self.privacy_level,
            memory_bytes: bits.words.len() * 8,
        }
    }
}

fn lock_poisoned() -> SearchError {
    SearchError::Internal("bloom filter lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let filter = SaltedBloom::new(1000, 0.01, 3).unwrap();
        for i in 0..500 {
            filter.add(format!("element-{i}").as_bytes()).unwrap();
        }
        for i in 0..500 {
            assert!(
                filter.contains(format!("element-{i}").as_bytes()).unwrap(),
                "inserted element-{i} must be found"
            );
        }
    }

    #[test]
    fn empty_filter_answers_false() {
        let filter = SaltedBloom::new(100, 0.01, 3).unwrap();
        assert!(!filter.contains(b"anything").unwrap());
        assert_eq!(filter.stats().set_bits, 0);
    }

    #[test]
    fn empty_element_is_rejected() {
        let filter = SaltedBloom::new(100, 0.01, 3).unwrap();
        assert!(filter.add(b"").is_err());
        assert!(filter.contains(b"").is_err());
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(SaltedBloom::new(0, 0.01, 3).is_err());
        assert!(SaltedBloom::new(100, 0.0, 3).is_err());
        assert!(SaltedBloom::new(100, 1.0, 3).is_err());
    }

    #[test]
    fn privacy_level_out_of_range_defaults_to_three() {
        let filter = SaltedBloom::new(100, 0.01, 9).unwrap();
        assert_eq!(filter.stats().privacy_level, 3);
        let filter = SaltedBloom::new(100, 0.01, 0).unwrap();
        assert_eq!(filter.stats().privacy_level, 3);
    }

    #[test]
    fn hash_count_is_clamped() {
        // Very low fpr drives k_base high; privacy bonus must not push past 20.
        let filter = SaltedBloom::new(10, 0.000001, 5).unwrap();
        assert!(filter.stats().hash_count <= MAX_BLOOM_HASHES);
    }

    #[test]
    fn two_inserts_set_bounded_bits() {
        let filter = SaltedBloom::new(1000, 0.01, 3).unwrap();
        filter.add(b"file1.txt").unwrap();
        filter.add(b"file2.txt").unwrap();
        assert!(filter.contains(b"file1.txt").unwrap());
        assert!(filter.contains(b"file2.txt").unwrap());
        let stats = filter.stats();
        assert_eq!(stats.element_count, 2);
        assert!(stats.set_bits <= 2 * stats.hash_count as u64);
    }

    #[test]
    fn empirical_fpr_within_calibration() {
        let n = 2000;
        let p = 0.01;
        let filter = SaltedBloom::new(n, p, 1).unwrap();
        for i in 0..n {
            filter.add(format!("member-{i}").as_bytes()).unwrap();
        }
        let mut false_positives = 0u32;
        let probes = 10_000;
        for i in 0..probes {
            if filter.contains(format!("absent-{i}").as_bytes()).unwrap() {
                false_positives += 1;
            }
        }
        let empirical = false_positives as f64 / probes as f64;
        assert!(
            empirical <= 3.0 * p,
            "empirical fpr {empirical} exceeds 3x configured {p}"
        );
    }

    #[test]
    fn salts_differ_between_instances() {
        let a = SaltedBloom::new(100, 0.01, 3).unwrap();
        let b = SaltedBloom::new(100, 0.01, 3).unwrap();
        assert_ne!(a.salt, b.salt);
    }
}
