//! Locality-sensitive hashing over content signatures.
//!
//! Signatures are fixed-length arrays of 64-bit lane values produced by a
//! sliding-window FNV-64a hash; similarity is the fraction of equal lanes
//! (a MinHash-style Jaccard estimate). The index partitions signatures into
//! bands and buckets them by band hash, so near-duplicates collide in at
//! least one band with high probability.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::{Result, SearchError};
use crate::types::LshConfig;

// ---------------------------------------------------------------------------
// FNV-64a
// ---------------------------------------------------------------------------

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-64a over `bytes`, starting from `basis`.
fn fnv64a(bytes: &[u8], basis: u64) -> u64 {
    let mut hash = basis;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ---------------------------------------------------------------------------
// Fingerprints and signatures
// ---------------------------------------------------------------------------

/// Chunk size for fingerprinting.
const FP_CHUNK: usize = 1024;
/// Overlap between consecutive fingerprint chunks.
const FP_OVERLAP: usize = 256;

/// Exact-match content fingerprint: XOR-fold of SHA-256 over overlapping
/// chunks, with the chunk index XORed into the leading digest byte so
/// reordered chunks produce distinct folds.
pub fn generate_fingerprint(content: &[u8]) -> [u8; 32] {
    let mut folded = [0u8; 32];
    if content.is_empty() {
        return folded;
    }
    let stride = FP_CHUNK - FP_OVERLAP;
    let mut start = 0usize;
    let mut index = 0usize;
    loop {
        let end = (start + FP_CHUNK).min(content.len());
        let mut digest: [u8; 32] = Sha256::digest(&content[start..end]).into();
        digest[0] ^= index as u8;
        for (f, d) in folded.iter_mut().zip(digest.iter()) {
            *f ^= d;
        }
        if end == content.len() {
            break;
        }
        start += stride;
        index += 1;
    }
    folded
}

/// Approximate-similarity signature: `feature_count` lanes, each hashing a
/// `window`-byte slice with FNV-64a. Lane i's window starts at
/// `(i * step) mod (len - window + 1)`; content shorter than the window is
/// hashed whole. The window start seeds the basis and the lane index is
/// folded into the lane value, so identical windows at different lanes
/// still produce distinct lanes.
pub fn generate_signature(content: &[u8], cfg: &LshConfig) -> Vec<u64> {
    let mut signature = Vec::with_capacity(cfg.feature_count);
    if content.is_empty() {
        signature.resize(cfg.feature_count, 0);
        return signature;
    }
    let window = cfg.window.min(content.len());
    let positions = content.len() - window + 1;
    for lane in 0..cfg.feature_count {
        let start = (lane * cfg.step) % positions;
        let slice = &content[start..start + window];
        let basis = FNV_OFFSET_BASIS ^ start as u64;
        signature.push(fnv64a(slice, basis).wrapping_add(lane as u64));
    }
    signature
}

/// Jaccard similarity estimate: fraction of equal lanes.
pub fn jaccard(a: &[u64], b: &[u64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let equal = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    equal as f64 / a.len() as f64
}

/// Band hash: FNV-64a over the band's lane values, big-endian.
fn band_hash(signature: &[u64], band: usize, rows: usize) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for lane in &signature[band * rows..(band + 1) * rows] {
        for b in lane.to_be_bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// A similarity hit from `find_similar`.
#[derive(Clone, Debug)]
pub struct SimilarityMatch {
    pub content_id: String,
    pub similarity: f64,
    /// Content addressing is opaque here; the content ID doubles as the CID.
    pub block_cid: String,
}

struct LshTables {
    /// (band, band hash) -> content IDs.
    buckets: HashMap<(usize, u64), Vec<String>>,
    /// Full signatures for exact similarity confirmation.
    signatures: HashMap<String, Vec<u64>>,
}

/// Banded LSH index over content signatures.
pub struct LshIndex {
    tables: RwLock<LshTables>,
    bands: usize,
    rows: usize,
}

impl LshIndex {
    pub fn new(cfg: &LshConfig) -> Result<Self> {
        if cfg.bands * cfg.rows > cfg.feature_count {
            return Err(SearchError::Internal(format!(
                "lsh bands*rows ({}) exceeds feature count ({})",
                cfg.bands * cfg.rows,
                cfg.feature_count
            )));
        }
        Ok(Self {
            tables: RwLock::new(LshTables { buckets: HashMap::new(), signatures: HashMap::new() }),
            bands: cfg.bands,
            rows: cfg.rows,
        })
    }

    /// Store a signature and bucket it under every band hash.
    pub fn add(&self, content_id: &str, signature: Vec<u64>) -> Result<()> {
        if signature.len() < self.bands * self.rows {
            return Err(SearchError::Internal(format!(
                "signature too short: {} lanes, need {}",
                signature.len(),
                self.bands * self.rows
            )));
        }
        let mut tables = self.tables.write().map_err(|_| lock_poisoned())?;
        for band in 0..self.bands {
            let hash = band_hash(&signature, band, self.rows);
            let ids = tables.buckets.entry((band, hash)).or_default();
            if !ids.iter().any(|id| id == content_id) {
                ids.push(content_id.to_string());
            }
        }
        tables.signatures.insert(content_id.to_string(), signature);
        Ok(())
    }

    /// Candidates sharing at least one band bucket, re-ranked by exact
    /// Jaccard against stored signatures. Results meet `threshold` and are
    /// unsorted; callers order them.
    pub fn find_similar(&self, signature: &[u64], threshold: f64) -> Result<Vec<SimilarityMatch>> {
        if signature.len() < self.bands * self.rows {
            return Err(SearchError::Internal("query signature too short".into()));
        }
        let tables = self.tables.read().map_err(|_| lock_poisoned())?;

        let mut candidates: HashSet<&str> = HashSet::new();
        for band in 0..self.bands {
            let hash = band_hash(signature, band, self.rows);
            if let Some(ids) = tables.buckets.get(&(band, hash)) {
                candidates.extend(ids.iter().map(|s| s.as_str()));
            }
        }

        let mut matches = Vec::new();
        for id in candidates {
            let Some(stored) = tables.signatures.get(id) else { continue };
            let similarity = jaccard(signature, stored);
            if similarity >= threshold {
                matches.push(SimilarityMatch {
                    content_id: id.to_string(),
                    similarity,
                    block_cid: id.to_string(),
                });
            }
        }
        Ok(matches)
    }

    /// Number of stored signatures.
    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.signatures.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_poisoned() -> SearchError {
    SearchError::Internal("lsh index lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LshConfig {
        LshConfig::default()
    }

    #[test]
    fn signature_is_deterministic() {
        let content = b"the quick brown fox jumps over the lazy dog, repeatedly and often";
        let a = generate_signature(content, &cfg());
        let b = generate_signature(content, &cfg());
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let content = vec![0xabu8; 4096];
        assert_eq!(generate_fingerprint(&content), generate_fingerprint(&content));
    }

    #[test]
    fn fingerprint_distinguishes_content() {
        let a = vec![1u8; 2048];
        let mut b = a.clone();
        b[0] = 2;
        assert_ne!(generate_fingerprint(&a), generate_fingerprint(&b));
    }

    #[test]
    fn short_content_hashes_whole() {
        let sig = generate_signature(b"tiny", &cfg());
        assert_eq!(sig.len(), 128);
        // All lanes see the same (whole) window but fold distinct lane indices.
        assert_ne!(sig[0], sig[1]);
    }

    #[test]
    fn jaccard_identical_is_one() {
        let content = b"some content that spans a few windows worth of bytes for the test";
        let sig = generate_signature(content, &cfg());
        assert_eq!(jaccard(&sig, &sig), 1.0);
    }

    #[test]
    fn jaccard_length_mismatch_is_zero() {
        assert_eq!(jaccard(&[1, 2, 3], &[1, 2]), 0.0);
    }

    #[test]
    fn identical_content_is_found() {
        let index = LshIndex::new(&cfg()).unwrap();
        let content = vec![0x42u8; 1024];
        let sig = generate_signature(&content, &cfg());
        index.add("doc-1", sig.clone()).unwrap();

        let hits = index.find_similar(&sig, 0.8).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content_id, "doc-1");
        assert_eq!(hits[0].similarity, 1.0);
        assert_eq!(hits[0].block_cid, "doc-1");
    }

    // One shared full band is enough for recall.
    #[test]
    fn shared_band_guarantees_recall() {
        let index = LshIndex::new(&cfg()).unwrap();
        let base: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let mut variant = base.clone();
        // Perturb the tail so early bands stay identical.
        let len = variant.len();
        variant[len - 1] ^= 0xff;

        let sig_base = generate_signature(&base, &cfg());
        let sig_variant = generate_signature(&variant, &cfg());
        index.add("base", sig_base.clone()).unwrap();

        let similarity = jaccard(&sig_variant, &sig_base);
        let shares_band = (0..20).any(|b| {
            band_hash(&sig_variant, b, 5) == band_hash(&sig_base, b, 5)
        });
        if shares_band {
            let hits = index.find_similar(&sig_variant, similarity).unwrap();
            assert!(
                hits.iter().any(|h| h.content_id == "base"),
                "band-sharing signature must be recalled at its own jaccard"
            );
        }
    }

    // A one-byte difference at offset 0 perturbs a single lane.
    #[test]
    fn near_duplicate_scores_high() {
        let index = LshIndex::new(&cfg()).unwrap();
        let a: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
        let mut b = a.clone();
        b[0] ^= 0x01;

        index.add("a", generate_signature(&a, &cfg())).unwrap();
        index.add("b", generate_signature(&b, &cfg())).unwrap();

        let query = generate_signature(&a, &cfg());
        let hits = index.find_similar(&query, 0.8).unwrap();
        let hit_b = hits.iter().find(|h| h.content_id == "b").expect("near-duplicate returned");
        assert!(hit_b.similarity >= 0.95, "similarity {} below 0.95", hit_b.similarity);
    }

    #[test]
    fn dissimilar_content_is_filtered() {
        let index = LshIndex::new(&cfg()).unwrap();
        let a: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
        let b: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(7919) % 256) as u8).collect();

        index.add("other", generate_signature(&b, &cfg())).unwrap();
        let hits = index.find_similar(&generate_signature(&a, &cfg()), 0.8).unwrap();
        assert!(hits.is_empty(), "unrelated content must not clear a 0.8 threshold");
    }

    #[test]
    fn misconfigured_bands_are_rejected() {
        let bad = LshConfig { bands: 40, rows: 5, feature_count: 128, ..LshConfig::default() };
        assert!(LshIndex::new(&bad).is_err());
    }
}
