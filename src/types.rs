use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum raw query length accepted by the validator.
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Maximum number of whitespace-separated terms per query.
pub const MAX_TERMS_PER_QUERY: usize = 20;

/// Hard cap on Bloom filter hash functions.
pub const MAX_BLOOM_HASHES: u32 = 20;

/// Size of the per-session recent-query ring.
pub const RECENT_QUERY_RING: usize = 50;

// ---------------------------------------------------------------------------
// Engine configuration — loaded from veilsearch.toml or defaults
// ---------------------------------------------------------------------------

/// Runtime configuration for the whole engine. Every section has sane
/// defaults so an empty config file is valid.
#[derive(Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub bloom: BloomConfig,
    pub lsh: LshConfig,
    pub manifest: ManifestConfig,
    pub pipeline: PipelineConfig,
    pub sessions: SessionConfig,
    pub rate: RateLimitConfig,
    pub server: ServerConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file. A missing file is not an error;
    /// defaults apply.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        toml::from_str(&raw).map_err(|e| format!("invalid config {}: {e}", path.display()))
    }
}

/// Bloom filter sizing and privacy parameters.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Expected number of indexed elements per filter.
    pub expected_items: usize,
    /// Target false-positive rate, exclusive (0, 1).
    pub false_positive_rate: f64,
    /// Privacy level 1..=5; adds extra hash rounds.
    pub privacy_level: u8,
    /// Blind content fingerprints with a keyed hash before insertion.
    pub content_blinding: bool,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_items: 100_000,
            false_positive_rate: 0.01,
            privacy_level: 3,
            content_blinding: true,
        }
    }
}

/// Locality-sensitive hashing parameters.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LshConfig {
    /// Signature lanes per document.
    pub feature_count: usize,
    /// LSH bands; bands * rows lanes are consumed by bucketing.
    pub bands: usize,
    /// Rows per band.
    pub rows: usize,
    /// Sliding window size in bytes.
    pub window: usize,
    /// Window step in bytes.
    pub step: usize,
    /// Default similarity threshold for `find_similar`.
    pub similarity_threshold: f64,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            feature_count: 128,
            bands: 20,
            rows: 5,
            window: 64,
            step: 16,
            similarity_threshold: 0.8,
        }
    }
}

/// Encrypted path index and manifest cache parameters.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Maximum cached manifests.
    pub cache_max_entries: usize,
    /// Cache entry time-to-live in seconds.
    pub cache_ttl_secs: u64,
    /// Maintain the hierarchy index alongside the path filter.
    pub hierarchy_enabled: bool,
    /// Optional hex-encoded 32-byte path key. Random when absent.
    pub path_key: Option<String>,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: 10_000,
            cache_ttl_secs: 3600,
            hierarchy_enabled: true,
            path_key: None,
        }
    }
}

/// Query pipeline tuning: privacy transformation, timing, caching.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default privacy level for queries that do not specify one.
    pub default_privacy_level: u8,
    /// Minimum privacy level the validator accepts.
    pub require_privacy_level: u8,
    /// Dummy queries generated at privacy level >= 3.
    pub dummy_query_count: usize,
    /// Maximum concurrently executing dummy queries.
    pub max_concurrent_dummies: usize,
    /// Per-dummy scheduling jitter upper bound in milliseconds.
    pub execution_delay_range_ms: u64,
    /// Base timing delay per privacy level 1..=5, milliseconds.
    pub base_delay_ms: [u64; 5],
    /// Uniform random delay added on top of the base, milliseconds.
    pub random_delay_range_ms: u64,
    /// Configured noise magnitude fed into `calc_noise`.
    pub noise_level: f64,
    /// K-anonymity group size floor.
    pub k_anonymity: usize,
    /// Result cache TTL in seconds (scaled down at higher privacy levels).
    pub cache_ttl_secs: u64,
    /// Per-query deadline in seconds.
    pub query_timeout_secs: u64,
    /// Dispatch sub-index queries in parallel.
    pub parallel_search: bool,
    /// Upper bound on concurrently executing queries.
    pub max_concurrent_queries: usize,
    /// Default maximum results when the caller does not specify one.
    pub default_max_results: usize,
    /// Pad real result sets up to this floor with dummies.
    pub min_results: usize,
    /// Fraction of dummy results appended at privacy level >= 4.
    pub dummy_result_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_privacy_level: 3,
            require_privacy_level: 1,
            dummy_query_count: 3,
            max_concurrent_dummies: 5,
            execution_delay_range_ms: 200,
            base_delay_ms: [0, 50, 100, 200, 400],
            random_delay_range_ms: 100,
            noise_level: 1.0,
            k_anonymity: 5,
            cache_ttl_secs: 300,
            query_timeout_secs: 30,
            parallel_search: true,
            max_concurrent_queries: 64,
            default_max_results: 100,
            min_results: 3,
            dummy_result_ratio: 0.2,
        }
    }
}

/// Session lifecycle and differential-privacy budget parameters.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_active_sessions: usize,
    pub max_sessions_per_user: usize,
    /// Wall-clock session lifetime in seconds.
    pub session_ttl_secs: u64,
    /// Idle cutoff in seconds.
    pub inactivity_timeout_secs: u64,
    /// Extend expiry on activity.
    pub extend_on_activity: bool,
    /// Enforce the per-session differential-privacy budget.
    pub dp_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 10_000,
            max_sessions_per_user: 8,
            session_ttl_secs: 24 * 3600,
            inactivity_timeout_secs: 1800,
            extend_on_activity: true,
            dp_enabled: true,
        }
    }
}

/// Multi-window rate limits with a burst allowance.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { per_minute: 60, per_hour: 1000, per_day: 10_000, burst: 10 }
    }
}

/// HTTP server and maintenance scheduling.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Minimum seconds between maintenance runs.
    pub maintenance_interval_secs: u64,
    /// Background prune/maintenance tick in seconds.
    pub background_tick_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { maintenance_interval_secs: 60, background_tick_secs: 300 }
    }
}

// ---------------------------------------------------------------------------
// File metadata supplied by the descriptor layer
// ---------------------------------------------------------------------------

/// Tagged attribute value. Rendered as `key:tag:value` before Bloom
/// insertion so reproduction is deterministic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl AttributeValue {
    /// Deterministic `tag:value` rendering.
    pub fn render(&self) -> String {
        match self {
            AttributeValue::String(s) => format!("str:{s}"),
            AttributeValue::Int(i) => format!("int:{i}"),
            AttributeValue::Float(f) => format!("float:{f}"),
            AttributeValue::Bool(b) => format!("bool:{b}"),
            AttributeValue::Time(t) => format!("time:{}", t.to_rfc3339()),
            AttributeValue::Bytes(b) => format!("bytes:{}", hex::encode(b)),
        }
    }

    /// Untagged value rendering, used for attribute bucket keys.
    pub fn plain(&self) -> String {
        match self {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Int(i) => i.to_string(),
            AttributeValue::Float(f) => f.to_string(),
            AttributeValue::Bool(b) => b.to_string(),
            AttributeValue::Time(t) => t.to_rfc3339(),
            AttributeValue::Bytes(b) => hex::encode(b),
        }
    }
}

/// Metadata attached to an indexed file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub attributes: HashMap<String, AttributeValue>,
}

impl FileMetadata {
    pub fn new(size: u64, mod_time: DateTime<Utc>, content_type: impl Into<String>) -> Self {
        Self { size, mod_time, content_type: content_type.into(), attributes: HashMap::new() }
    }
}

/// Size class boundaries: 1 KB, 1 MB, 10 MB, 100 MB.
pub fn size_bucket(size: u64) -> &'static str {
    match size {
        0..=1024 => "tiny",
        s if s <= 1 << 20 => "small",
        s if s <= 10 << 20 => "medium",
        s if s <= 100 << 20 => "large",
        _ => "huge",
    }
}

/// Byte bounds of a named size bucket.
pub fn size_bucket_bounds(name: &str) -> Option<(u64, u64)> {
    match name {
        "tiny" => Some((0, 1024)),
        "small" => Some((1025, 1 << 20)),
        "medium" => Some(((1 << 20) + 1, 10 << 20)),
        "large" => Some(((10 << 20) + 1, 100 << 20)),
        "huge" => Some(((100 << 20) + 1, u64::MAX)),
        _ => None,
    }
}

/// Day-granular time bucket: `YYYY-MM-DD`.
pub fn day_bucket(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}

// ---------------------------------------------------------------------------
// Query model
// ---------------------------------------------------------------------------

/// The five query shapes the parser produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Filename,
    Content,
    Metadata,
    Similarity,
    Complex,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Filename => "filename",
            QueryType::Content => "content",
            QueryType::Metadata => "metadata",
            QueryType::Similarity => "similarity",
            QueryType::Complex => "complex",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options bag accepted by `search`: `{privacy_level, session_id,
/// max_results, type?}` plus pagination.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SearchOptions {
    pub privacy_level: Option<u8>,
    pub session_id: Option<String>,
    pub max_results: Option<usize>,
    #[serde(rename = "type")]
    pub query_type: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub offset: usize,
}

/// A parsed, validated, and (after transformation) privacy-enriched query.
#[derive(Clone, Debug)]
pub struct Query {
    pub raw: String,
    pub obfuscated: String,
    pub query_type: QueryType,
    pub max_results: usize,
    pub privacy_level: u8,
    pub session_id: String,
    pub user_id: Option<String>,
    pub request_time: DateTime<Utc>,
    /// Synthetic cover queries issued alongside the real one.
    pub dummy_queries: Vec<String>,
    /// Indistinguishability cohort the query is grouped into.
    pub k_anonymity_group: Vec<String>,
    /// Noise magnitude applied downstream (0 when level < 4).
    pub noise_level: f64,
    /// Obfuscation delay applied after execution.
    pub timing_delay: Duration,
    /// Budget cost accounted against the session.
    pub privacy_cost: f64,
}

impl Query {
    /// Whitespace-separated terms of the obfuscated string.
    pub fn terms(&self) -> Vec<String> {
        self.obfuscated.split_whitespace().map(|t| t.to_string()).collect()
    }
}

// ---------------------------------------------------------------------------
// Unified cross-index query and match records
// ---------------------------------------------------------------------------

/// Which sub-index produced a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexSource {
    Privacy,
    Manifest,
    Content,
}

impl IndexSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexSource::Privacy => "privacy",
            IndexSource::Manifest => "manifest",
            IndexSource::Content => "content",
        }
    }
}

impl fmt::Display for IndexSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte-level similarity sub-query.
#[derive(Clone, Debug)]
pub struct SimilarityQuery {
    pub content: Vec<u8>,
    pub threshold: f64,
    pub max_candidates: usize,
}

/// Attribute sub-query over metadata buckets.
#[derive(Clone, Debug, Default)]
pub struct MetadataQuery {
    pub size_range: Option<(u64, u64)>,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub content_types: Vec<String>,
    pub custom: HashMap<String, String>,
}

/// The cross-index query the manager fans out.
#[derive(Clone, Debug)]
pub struct UnifiedQuery {
    pub terms: Vec<String>,
    pub query_type: QueryType,
    pub max_results: usize,
    pub session_id: String,
    pub similarity: Option<SimilarityQuery>,
    pub metadata: Option<MetadataQuery>,
}

/// A single-source match before the weighted merge.
#[derive(Clone, Debug)]
pub struct UnifiedMatch {
    pub file_id: String,
    pub relevance: f64,
    pub match_type: String,
    pub similarity: f64,
    pub source: IndexSource,
    pub filename: Option<String>,
    pub directory: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// When the file entered the index, as recorded at ingest.
    pub indexed_at: Option<DateTime<Utc>>,
}

/// One record per file after grouping matches across sources.
#[derive(Clone, Debug)]
pub struct MergedMatch {
    pub file_id: String,
    /// Weighted combination of the per-source relevances.
    pub relevance: f64,
    pub match_type: String,
    pub similarity: f64,
    pub sources: Vec<IndexSource>,
    /// The highest-weighted source that contributed.
    pub primary: IndexSource,
    pub filename: Option<String>,
    pub directory: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub indexed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Search results (external shape)
// ---------------------------------------------------------------------------

/// One ranked result. Invariant: `0 <= relevance <= 1` after every
/// transformation; `noise_level` is set whenever noise was applied.
#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub relevance: f64,
    pub match_type: String,
    pub similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub privacy_level: u8,
    pub noise_level: f64,
    pub sources: Vec<IndexSource>,
    pub index_source: IndexSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub indexed_at: DateTime<Utc>,
}

impl SearchResult {
    /// Build a result from a merged cross-index match. `indexed_at` is the
    /// ingest-time stamp the index recorded; the fallback only covers
    /// matches with no surviving record.
    pub fn from_merged(m: &MergedMatch, privacy_level: u8) -> Self {
        SearchResult {
            file_id: m.file_id.clone(),
            filename: m.filename.clone(),
            directory: m.directory.clone(),
            content_type: m.content_type.clone(),
            relevance: m.relevance.clamp(0.0, 1.0),
            match_type: m.match_type.clone(),
            similarity: m.similarity,
            metadata: None,
            privacy_level,
            noise_level: 0.0,
            sources: m.sources.clone(),
            index_source: m.primary,
            last_modified: m.last_modified,
            indexed_at: m.indexed_at.or(m.last_modified).unwrap_or_else(Utc::now),
        }
    }
}

/// External JSON response for `search`.
#[derive(Clone, Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total_results: usize,
    pub has_more: bool,
    pub query: String,
    /// Wall-clock query time in milliseconds.
    pub query_time: u64,
    pub privacy_level: u8,
    /// Number of dummy queries issued alongside the real one.
    pub dummy_queries: usize,
    /// Timing-obfuscation delay in milliseconds.
    pub timing_delay: u64,
    pub noise_injected: bool,
    pub offset: usize,
    pub limit: usize,
    pub search_id: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_buckets_respect_thresholds() {
        assert_eq!(size_bucket(0), "tiny");
        assert_eq!(size_bucket(1024), "tiny");
        assert_eq!(size_bucket(1025), "small");
        assert_eq!(size_bucket(1 << 20), "small");
        assert_eq!(size_bucket((10 << 20) + 1), "large");
        assert_eq!(size_bucket(200 << 20), "huge");
    }

    #[test]
    fn day_bucket_is_date_only() {
        let t = DateTime::parse_from_rfc3339("2026-03-14T15:09:26Z").unwrap().with_timezone(&Utc);
        assert_eq!(day_bucket(&t), "2026-03-14");
    }

    #[test]
    fn attribute_render_is_tagged() {
        assert_eq!(AttributeValue::Int(42).render(), "int:42");
        assert_eq!(AttributeValue::Bool(true).render(), "bool:true");
        assert_eq!(AttributeValue::String("report".into()).render(), "str:report");
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.bloom.false_positive_rate > 0.0 && cfg.bloom.false_positive_rate < 1.0);
        assert_eq!(cfg.lsh.bands * cfg.lsh.rows, 100);
        assert!(cfg.lsh.feature_count >= cfg.lsh.bands * cfg.lsh.rows);
    }

    #[test]
    fn config_parses_partial_toml() {
        let cfg: EngineConfig =
            toml::from_str("[pipeline]\ndummy_query_count = 7\n").expect("partial config");
        assert_eq!(cfg.pipeline.dummy_query_count, 7);
        assert_eq!(cfg.sessions.max_sessions_per_user, 8);
    }
}
