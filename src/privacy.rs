//! Privacy index: four typed Bloom filters over encrypted filenames, blinded
//! content fingerprints, metadata buckets, and directory paths.
//!
//! Filename queries can be gated by a per-session differential-privacy
//! budget: each query costs a fixed slice of the budget and an exhausted
//! budget degrades to "not found" instead of erroring.

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use rand::RngCore;

use crate::bloom::{BloomStats, SaltedBloom};
use crate::error::Result;
use crate::types::{day_bucket, size_bucket, BloomConfig, FileMetadata};

/// Starting differential-privacy budget per session.
pub const DP_INITIAL_BUDGET: f64 = 1.0;
/// Budget cost of one protected filename query.
pub const DP_QUERY_COST: f64 = 0.01;
/// Budget refreshed per maintenance run, capped at the initial budget.
pub const DP_REFRESH: f64 = 0.1;

/// Four Bloom filters with per-type false-positive tuning.
pub struct PrivacyIndex {
    filename: SaltedBloom,
    content: SaltedBloom,
    metadata: SaltedBloom,
    directory: SaltedBloom,
    /// Per-session DP budgets; present only when the gate is enabled.
    budgets: Option<DashMap<String, f64>>,
    /// Keyed-hash blinding of content fingerprints.
    blind_key: Option<[u8; 32]>,
}

/// Aggregated stats for all four filters.
#[derive(Clone, Debug, Serialize)]
pub struct PrivacyIndexStats {
    pub filename: BloomStats,
    pub content: BloomStats,
    pub metadata: BloomStats,
    pub directory: BloomStats,
    pub dp_sessions: usize,
}

impl PrivacyIndex {
    /// Build the four filters from one base config. Content and directory
    /// filters run a level higher; metadata and directory run tighter FPRs.
    pub fn new(cfg: &BloomConfig, dp_enabled: bool) -> Result<Self> {
        let n = cfg.expected_items;
        let fpr = cfg.false_positive_rate;
        let level = cfg.privacy_level;
        let raised = level.saturating_add(1).min(5);

        let blind_key = if cfg.content_blinding {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            Some(key)
        } else {
            None
        };

        Ok(Self {
            filename: SaltedBloom::new(n, fpr, level)?,
            content: SaltedBloom::new(n, (1.5 * fpr).min(0.99), raised)?,
            metadata: SaltedBloom::new(n, 0.8 * fpr, level)?,
            directory: SaltedBloom::new(n, 0.5 * fpr, raised)?,
            budgets: dp_enabled.then(DashMap::new),
            blind_key,
        })
    }

    // -----------------------------------------------------------------------
    // Filenames
    // -----------------------------------------------------------------------

    /// Index an encrypted filename together with its metadata buckets.
    pub fn index_filename(&self, enc_filename: &[u8], metadata: &FileMetadata) -> Result<()> {
        self.filename.add(enc_filename)?;
        self.index_metadata_attributes(metadata)
    }

    /// Membership test for an encrypted filename, gated by the session's
    /// DP budget when the gate is enabled. An exhausted budget returns
    /// `false` regardless of filter state.
    pub fn query_filename(&self, enc_filename: &[u8], session_id: Option<&str>) -> Result<bool> {
        if let (Some(budgets), Some(session)) = (&self.budgets, session_id) {
            let mut budget = budgets.entry(session.to_string()).or_insert(DP_INITIAL_BUDGET);
            if *budget < DP_QUERY_COST {
                return Ok(false);
            }
            *budget -= DP_QUERY_COST;
        }
        self.filename.contains(enc_filename)
    }

    // -----------------------------------------------------------------------
    // Content fingerprints
    // -----------------------------------------------------------------------

    fn blind(&self, fingerprint: &[u8; 32]) -> Vec<u8> {
        match &self.blind_key {
            Some(key) => {
                let mut h = Sha256::new();
                h.update(key);
                h.update(fingerprint);
                h.finalize().to_vec()
            }
            None => fingerprint.to_vec(),
        }
    }

    /// Index a content fingerprint (blinded when enabled) and its block CID.
    pub fn index_content(&self, fingerprint: &[u8; 32], block_cid: &str) -> Result<()> {
        self.content.add(&self.blind(fingerprint))?;
        if !block_cid.is_empty() {
            self.content.add(block_cid.as_bytes())?;
        }
        Ok(())
    }

    /// Membership test for a content fingerprint.
    pub fn query_content(&self, fingerprint: &[u8; 32]) -> Result<bool> {
        self.content.contains(&self.blind(fingerprint))
    }

    // -----------------------------------------------------------------------
    // Metadata buckets
    // -----------------------------------------------------------------------

    /// Bucket size and mod-time, then add the bucket strings plus the
    /// content type and any custom attributes to the metadata filter.
    pub fn index_metadata_attributes(&self, metadata: &FileMetadata) -> Result<()> {
        self.metadata.add(format!("size:{}", size_bucket(metadata.size)).as_bytes())?;
        self.metadata.add(format!("time:{}", day_bucket(&metadata.mod_time)).as_bytes())?;
        if !metadata.content_type.is_empty() {
            self.metadata.add(format!("type:{}", metadata.content_type).as_bytes())?;
        }
        for (key, value) in &metadata.attributes {
            self.metadata.add(format!("{key}:{}", value.render()).as_bytes())?;
        }
        Ok(())
    }

    /// Membership test for a rendered metadata bucket string.
    pub fn query_metadata_bucket(&self, bucket: &str) -> Result<bool> {
        self.metadata.contains(bucket.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------------

    /// Index an encrypted directory path.
    pub fn index_directory(&self, enc_path: &[u8]) -> Result<()> {
        self.directory.add(enc_path)
    }

    /// Membership test for an encrypted directory path.
    pub fn query_directory(&self, enc_path: &[u8]) -> Result<bool> {
        self.directory.contains(enc_path)
    }

    // -----------------------------------------------------------------------
    // Budget bookkeeping
    // -----------------------------------------------------------------------

    /// Remaining DP budget for a session. Full budget when the session has
    /// not queried yet or the gate is disabled.
    pub fn budget_remaining(&self, session_id: &str) -> f64 {
        match &self.budgets {
            Some(budgets) => budgets.get(session_id).map(|b| *b).unwrap_or(DP_INITIAL_BUDGET),
            None => DP_INITIAL_BUDGET,
        }
    }

    /// Maintenance: refresh every tracked budget by [`DP_REFRESH`], capped
    /// at the initial budget.
    pub fn maintenance(&self) {
        if let Some(budgets) = &self.budgets {
            for mut entry in budgets.iter_mut() {
                *entry = (*entry + DP_REFRESH).min(DP_INITIAL_BUDGET);
            }
        }
    }

    /// Drop budget state for sessions that no longer exist.
    pub fn retain_sessions(&self, live: &dyn Fn(&str) -> bool) {
        if let Some(budgets) = &self.budgets {
            budgets.retain(|id, _| live(id));
        }
    }

    pub fn stats(&self) -> PrivacyIndexStats {
        PrivacyIndexStats {
            filename: self.filename.stats(),
            content: self.content.stats(),
            metadata: self.metadata.stats(),
            directory: self.directory.stats(),
            dp_sessions: self.budgets.as_ref().map(|b| b.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cfg() -> BloomConfig {
        BloomConfig { expected_items: 1000, ..BloomConfig::default() }
    }

    fn meta() -> FileMetadata {
        FileMetadata::new(4096, Utc::now(), "text/plain")
    }

    #[test]
    fn filename_roundtrip() {
        let index = PrivacyIndex::new(&cfg(), false).unwrap();
        index.index_filename(b"enc-report.pdf", &meta()).unwrap();
        assert!(index.query_filename(b"enc-report.pdf", None).unwrap());
        // A single insert into a 1000-element filter cannot plausibly
        // collide on every hash round.
        assert!(!index.query_filename(b"enc-other.pdf", None).unwrap());
    }

    #[test]
    fn metadata_buckets_are_queryable() {
        let index = PrivacyIndex::new(&cfg(), false).unwrap();
        index.index_metadata_attributes(&meta()).unwrap();
        assert!(index.query_metadata_bucket("size:small").unwrap());
        assert!(index.query_metadata_bucket("type:text/plain").unwrap());
    }

    #[test]
    fn content_blinding_still_matches() {
        let index = PrivacyIndex::new(&cfg(), false).unwrap();
        let fp = [7u8; 32];
        index.index_content(&fp, "bafyexamplecid001").unwrap();
        assert!(index.query_content(&fp).unwrap());
    }

    // Budget decreases per query, empties after exhaustion, and is
    // refreshed only by maintenance.
    #[test]
    fn budget_gate_drains_and_refreshes() {
        let index = PrivacyIndex::new(&cfg(), true).unwrap();
        index.index_filename(b"enc-secret", &meta()).unwrap();

        for _ in 0..50 {
            index.query_filename(b"enc-secret", Some("sess-a")).unwrap();
        }
        let used = DP_INITIAL_BUDGET - index.budget_remaining("sess-a");
        assert!((used - 0.5).abs() < 0.011, "budget used {used} not near 0.5");

        for _ in 0..51 {
            index.query_filename(b"enc-secret", Some("sess-a")).unwrap();
        }
        assert!(index.budget_remaining("sess-a") < DP_QUERY_COST);
        // Exhausted budget degrades to "not found" without error.
        assert!(!index.query_filename(b"enc-secret", Some("sess-a")).unwrap());

        index.maintenance();
        let refreshed = index.budget_remaining("sess-a");
        assert!(refreshed >= DP_REFRESH - 1e-9);
        assert!(index.query_filename(b"enc-secret", Some("sess-a")).unwrap());
    }

    #[test]
    fn budgets_are_per_session() {
        let index = PrivacyIndex::new(&cfg(), true).unwrap();
        index.index_filename(b"enc-doc", &meta()).unwrap();
        for _ in 0..110 {
            index.query_filename(b"enc-doc", Some("drained")).unwrap();
        }
        assert!(!index.query_filename(b"enc-doc", Some("drained")).unwrap());
        assert!(index.query_filename(b"enc-doc", Some("fresh")).unwrap());
    }

    #[test]
    fn maintenance_caps_at_initial_budget() {
        let index = PrivacyIndex::new(&cfg(), true).unwrap();
        index.index_filename(b"enc-x", &meta()).unwrap();
        index.query_filename(b"enc-x", Some("s")).unwrap();
        for _ in 0..20 {
            index.maintenance();
        }
        assert!(index.budget_remaining("s") <= DP_INITIAL_BUDGET + 1e-9);
    }
}
