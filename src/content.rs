//! Content index: fingerprinting, LSH bookkeeping, attribute buckets, and
//! the noisy-query preserver.
//!
//! The index owns one LSH index, one attribute index, and one content
//! analyzer. Searches compose a similarity part (raw bytes against the LSH
//! buckets) with a metadata part (bucket membership), and every result set
//! can be degraded by the preserver before it leaves the index.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::bloom::SaltedBloom;
use crate::error::{Result, SearchError};
use crate::lsh::{generate_fingerprint, generate_signature, LshIndex};
use crate::privacy::{DP_INITIAL_BUDGET, DP_QUERY_COST, DP_REFRESH};
use crate::types::{
    day_bucket, size_bucket, size_bucket_bounds, FileMetadata, LshConfig, MetadataQuery,
    SimilarityQuery,
};

/// Fraction of the (sorted) result tail dropped by the preserver.
const PRESERVER_NOISE: f64 = 0.1;

/// Cap on enumerated day buckets for a time-range query.
const MAX_TIME_BUCKETS: i64 = 366;

// ---------------------------------------------------------------------------
// Content analyzer
// ---------------------------------------------------------------------------

/// Deterministic content digests: a 32-byte exact-match fingerprint and a
/// lane signature for approximate similarity.
pub struct ContentAnalyzer {
    cfg: LshConfig,
}

impl ContentAnalyzer {
    pub fn new(cfg: LshConfig) -> Self {
        Self { cfg }
    }

    pub fn fingerprint(&self, content: &[u8]) -> [u8; 32] {
        generate_fingerprint(content)
    }

    pub fn signature(&self, content: &[u8]) -> Vec<u64> {
        generate_signature(content, &self.cfg)
    }
}

// ---------------------------------------------------------------------------
// Attribute index
// ---------------------------------------------------------------------------

/// Lazily created per-bucket Bloom filters over file IDs. Categories:
/// size, time, type, custom.
pub struct AttributeIndex {
    buckets: RwLock<HashMap<String, SaltedBloom>>,
    expected_items: usize,
    fpr: f64,
}

impl AttributeIndex {
    pub fn new(expected_items: usize, fpr: f64) -> Self {
        Self { buckets: RwLock::new(HashMap::new()), expected_items, fpr }
    }

    /// Bucket strings for a file's metadata.
    fn bucket_strings(meta: &FileMetadata) -> Vec<String> {
        let mut buckets = vec![
            format!("size:{}", size_bucket(meta.size)),
            format!("time:{}", day_bucket(&meta.mod_time)),
        ];
        if !meta.content_type.is_empty() {
            buckets.push(format!("type:{}", meta.content_type));
        }
        for (key, value) in &meta.attributes {
            buckets.push(format!("{key}:{}", value.plain()));
        }
        buckets
    }

    /// Register a file under every bucket its metadata falls into.
    pub fn index(&self, file_id: &str, meta: &FileMetadata) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(|_| lock_poisoned())?;
        for bucket in Self::bucket_strings(meta) {
            if !buckets.contains_key(&bucket) {
                buckets.insert(bucket.clone(), SaltedBloom::new(self.expected_items, self.fpr, 3)?);
            }
            buckets.get(&bucket).expect("inserted above").add(file_id.as_bytes())?;
        }
        Ok(())
    }

    /// Union semantics: a file matches when any requested bucket's filter
    /// contains it. Intersection over probabilistic per-bucket answers would
    /// manufacture false negatives, which the filter contract forbids.
    pub fn matches_any(&self, file_id: &str, requested: &[String]) -> Result<bool> {
        let buckets = self.buckets.read().map_err(|_| lock_poisoned())?;
        for bucket in requested {
            if let Some(filter) = buckets.get(bucket) {
                if filter.contains(file_id.as_bytes())? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Expand a metadata query into the bucket strings it touches.
    pub fn query_buckets(q: &MetadataQuery) -> Vec<String> {
        let mut buckets = Vec::new();
        if let Some((lo, hi)) = q.size_range {
            for name in ["tiny", "small", "medium", "large", "huge"] {
                let (bucket_lo, bucket_hi) =
                    size_bucket_bounds(name).expect("bucket names are fixed");
                if lo <= bucket_hi && hi >= bucket_lo {
                    buckets.push(format!("size:{name}"));
                }
            }
        }
        if let Some((from, to)) = q.time_range {
            let mut day = from.date_naive();
            let last = to.date_naive();
            let mut steps = 0i64;
            while day <= last && steps < MAX_TIME_BUCKETS {
                buckets.push(format!("time:{}", day.format("%Y-%m-%d")));
                day += ChronoDuration::days(1);
                steps += 1;
            }
        }
        for ct in &q.content_types {
            buckets.push(format!("type:{ct}"));
        }
        for (key, value) in &q.custom {
            buckets.push(format!("{key}:{value}"));
        }
        buckets
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().map(|b| b.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Noisy-query preserver
// ---------------------------------------------------------------------------

/// Budget-gated result degradation: drops a noise-proportional suffix of a
/// sorted result set and empties it once the session budget is spent.
pub struct QueryPreserver {
    enabled: bool,
    noise: f64,
    budgets: DashMap<String, f64>,
}

impl QueryPreserver {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, noise: PRESERVER_NOISE, budgets: DashMap::new() }
    }

    /// Apply the preserver to an already-sorted result set.
    fn apply<T>(&self, session_id: Option<&str>, mut results: Vec<T>) -> Vec<T> {
        if !self.enabled {
            return results;
        }
        if let Some(session) = session_id {
            let mut budget = self.budgets.entry(session.to_string()).or_insert(DP_INITIAL_BUDGET);
            if *budget < DP_QUERY_COST {
                return Vec::new();
            }
            *budget -= DP_QUERY_COST;
        }
        let drop = (self.noise * results.len() as f64).round() as usize;
        results.truncate(results.len().saturating_sub(drop));
        results
    }

    pub fn maintenance(&self) {
        for mut entry in self.budgets.iter_mut() {
            *entry = (*entry + DP_REFRESH).min(DP_INITIAL_BUDGET);
        }
    }
}

// ---------------------------------------------------------------------------
// Content index
// ---------------------------------------------------------------------------

/// A composed content search: similarity part, metadata part, or both.
#[derive(Clone, Debug, Default)]
pub struct ContentSearch {
    pub similarity: Option<SimilarityQuery>,
    pub metadata: Option<MetadataQuery>,
    pub session_id: Option<String>,
    /// Consult the exact-fingerprint table for the similarity bytes. Callers
    /// screen this through their membership oracle first.
    pub include_exact: bool,
}

/// A match emitted by the content index.
#[derive(Clone, Debug)]
pub struct ContentMatch {
    pub content_id: String,
    pub block_cid: String,
    pub relevance: f64,
    pub similarity: f64,
    pub match_type: &'static str,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub indexed_at: Option<DateTime<Utc>>,
}

struct ContentRecord {
    fingerprint: [u8; 32],
    content_type: String,
    mod_time: DateTime<Utc>,
    /// When the document first entered the index. Survives re-indexing.
    indexed_at: DateTime<Utc>,
}

#[derive(Default)]
struct ContentTables {
    records: HashMap<String, ContentRecord>,
    /// Fingerprint -> document IDs, for exact-match confirmation.
    by_fingerprint: HashMap<[u8; 32], Vec<String>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ContentIndexStats {
    pub indexed_documents: usize,
    pub attribute_buckets: usize,
}

/// Content index owning the analyzer, the LSH index, and the attribute
/// index.
pub struct ContentIndex {
    analyzer: ContentAnalyzer,
    lsh: LshIndex,
    attributes: AttributeIndex,
    preserver: QueryPreserver,
    tables: RwLock<ContentTables>,
    default_threshold: f64,
}

impl ContentIndex {
    pub fn new(cfg: &LshConfig, expected_items: usize, fpr: f64, preserver_enabled: bool) -> Result<Self> {
        Ok(Self {
            analyzer: ContentAnalyzer::new(cfg.clone()),
            lsh: LshIndex::new(cfg)?,
            attributes: AttributeIndex::new(expected_items, fpr),
            preserver: QueryPreserver::new(preserver_enabled),
            tables: RwLock::new(ContentTables::default()),
            default_threshold: cfg.similarity_threshold,
        })
    }

    /// Index a document's bytes and metadata. Returns the fingerprint so the
    /// caller can register it with the privacy index.
    pub fn index(&self, file_id: &str, content: &[u8], meta: &FileMetadata) -> Result<[u8; 32]> {
        if file_id.is_empty() {
            return Err(SearchError::InvalidQuery("empty file id".into()));
        }
        let fingerprint = self.analyzer.fingerprint(content);
        let signature = self.analyzer.signature(content);
        self.lsh.add(file_id, signature)?;
        self.attributes.index(file_id, meta)?;
        let mut tables = self.tables.write().map_err(|_| lock_poisoned())?;
        let indexed_at =
            tables.records.get(file_id).map(|r| r.indexed_at).unwrap_or_else(Utc::now);
        tables.records.insert(
            file_id.to_string(),
            ContentRecord {
                fingerprint,
                content_type: meta.content_type.clone(),
                mod_time: meta.mod_time,
                indexed_at,
            },
        );
        let ids = tables.by_fingerprint.entry(fingerprint).or_default();
        if !ids.iter().any(|id| id == file_id) {
            ids.push(file_id.to_string());
        }
        Ok(fingerprint)
    }

    /// Execute a composed content search. Similarity candidates are
    /// confirmed by exact Jaccard; a metadata part filters candidates by
    /// bucket membership (or enumerates all records when it stands alone).
    /// Final order is descending relevance.
    pub fn search(&self, query: &ContentSearch) -> Result<Vec<ContentMatch>> {
        let mut matches: Vec<ContentMatch> = Vec::new();

        match (&query.similarity, &query.metadata) {
            (Some(sim), metadata) => {
                let mut exact_ids: Vec<String> = Vec::new();
                if query.include_exact {
                    let fingerprint = self.analyzer.fingerprint(&sim.content);
                    let tables = self.tables.read().map_err(|_| lock_poisoned())?;
                    if let Some(ids) = tables.by_fingerprint.get(&fingerprint) {
                        exact_ids = ids.clone();
                    }
                }

                let signature = self.analyzer.signature(&sim.content);
                let threshold =
                    if sim.threshold > 0.0 { sim.threshold } else { self.default_threshold };
                let mut hits = self.lsh.find_similar(&signature, threshold)?;
                hits.sort_unstable_by(|a, b| {
                    b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal)
                });
                hits.truncate(sim.max_candidates.max(1));

                let buckets = metadata.as_ref().map(AttributeIndex::query_buckets);
                for id in exact_ids {
                    if let Some(buckets) = &buckets {
                        if !buckets.is_empty() && !self.attributes.matches_any(&id, buckets)? {
                            continue;
                        }
                    }
                    matches.push(self.to_match(id.clone(), id, 1.0, "exact"));
                }
                for hit in hits {
                    if matches.iter().any(|m| m.content_id == hit.content_id) {
                        continue;
                    }
                    if let Some(buckets) = &buckets {
                        if !buckets.is_empty() && !self.attributes.matches_any(&hit.content_id, buckets)? {
                            continue;
                        }
                    }
                    matches.push(self.to_match(hit.content_id, hit.block_cid, hit.similarity, "similarity"));
                }
            }
            (None, Some(metadata)) => {
                let buckets = AttributeIndex::query_buckets(metadata);
                if !buckets.is_empty() {
                    let ids: Vec<String> = {
                        let tables = self.tables.read().map_err(|_| lock_poisoned())?;
                        tables.records.keys().cloned().collect()
                    };
                    let total = buckets.len() as f64;
                    for id in ids {
                        let matched = self.matched_bucket_count(&id, &buckets)?;
                        if matched > 0 {
                            let relevance = matched as f64 / total;
                            matches.push(self.to_match(id.clone(), id, relevance, "metadata"));
                        }
                    }
                }
            }
            (None, None) => {}
        }

        matches.sort_unstable_by(|a, b| {
            b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(self.preserver.apply(query.session_id.as_deref(), matches))
    }

    /// Attribute search restricted to a size window.
    pub fn search_by_size_range(&self, lo: u64, hi: u64, session_id: Option<&str>) -> Result<Vec<ContentMatch>> {
        self.search(&ContentSearch {
            metadata: Some(MetadataQuery { size_range: Some((lo, hi)), ..MetadataQuery::default() }),
            session_id: session_id.map(str::to_string),
            ..ContentSearch::default()
        })
    }

    /// Attribute search restricted to a content type.
    pub fn search_by_content_type(&self, content_type: &str, session_id: Option<&str>) -> Result<Vec<ContentMatch>> {
        self.search(&ContentSearch {
            metadata: Some(MetadataQuery {
                content_types: vec![content_type.to_string()],
                ..MetadataQuery::default()
            }),
            session_id: session_id.map(str::to_string),
            ..ContentSearch::default()
        })
    }

    /// The stored fingerprint for a document, if indexed.
    pub fn fingerprint_of(&self, file_id: &str) -> Option<[u8; 32]> {
        self.tables.read().ok()?.records.get(file_id).map(|r| r.fingerprint)
    }

    /// When a document first entered the index, if it did.
    pub fn indexed_at_of(&self, file_id: &str) -> Option<DateTime<Utc>> {
        self.tables.read().ok()?.records.get(file_id).map(|r| r.indexed_at)
    }

    pub fn analyzer(&self) -> &ContentAnalyzer {
        &self.analyzer
    }

    pub fn maintenance(&self) {
        self.preserver.maintenance();
    }

    pub fn stats(&self) -> ContentIndexStats {
        ContentIndexStats {
            indexed_documents: self.lsh.len(),
            attribute_buckets: self.attributes.bucket_count(),
        }
    }

    fn matched_bucket_count(&self, file_id: &str, buckets: &[String]) -> Result<usize> {
        let mut matched = 0;
        for bucket in buckets {
            if self.attributes.matches_any(file_id, std::slice::from_ref(bucket))? {
                matched += 1;
            }
        }
        Ok(matched)
    }

    fn to_match(
        &self,
        content_id: String,
        block_cid: String,
        relevance: f64,
        match_type: &'static str,
    ) -> ContentMatch {
        let tables = self.tables.read().ok();
        let record = tables.as_ref().and_then(|t| t.records.get(&content_id));
        ContentMatch {
            similarity: if match_type == "metadata" { 0.0 } else { relevance },
            relevance,
            content_type: record.map(|r| r.content_type.clone()).filter(|ct| !ct.is_empty()),
            last_modified: record.map(|r| r.mod_time),
            indexed_at: record.map(|r| r.indexed_at),
            content_id,
            block_cid,
            match_type,
        }
    }
}

fn lock_poisoned() -> SearchError {
    SearchError::Internal("content index lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeValue;

    fn index() -> ContentIndex {
        ContentIndex::new(&LshConfig::default(), 1000, 0.01, false).unwrap()
    }

    fn meta(size: u64, content_type: &str) -> FileMetadata {
        FileMetadata::new(size, Utc::now(), content_type)
    }

    #[test]
    fn similarity_search_finds_near_duplicates() {
        let index = index();
        let base: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
        let mut near = base.clone();
        near[0] ^= 1;

        index.index("doc-a", &base, &meta(4096, "text/plain")).unwrap();
        index.index("doc-b", &near, &meta(4096, "text/plain")).unwrap();

        let hits = index
            .search(&ContentSearch {
                similarity: Some(SimilarityQuery { content: base, threshold: 0.8, max_candidates: 10 }),
                ..ContentSearch::default()
            })
            .unwrap();
        assert!(hits.iter().any(|h| h.content_id == "doc-a" && h.similarity == 1.0));
        assert!(hits.iter().any(|h| h.content_id == "doc-b" && h.similarity >= 0.95));
        // Descending relevance.
        assert!(hits.windows(2).all(|w| w[0].relevance >= w[1].relevance));
    }

    #[test]
    fn metadata_filter_prunes_similarity_hits() {
        let index = index();
        let content: Vec<u8> = (0..2048u32).map(|i| (i % 97) as u8).collect();
        index.index("doc-txt", &content, &meta(500, "text/plain")).unwrap();

        let hits = index
            .search(&ContentSearch {
                similarity: Some(SimilarityQuery {
                    content: content.clone(),
                    threshold: 0.8,
                    max_candidates: 10,
                }),
                metadata: Some(MetadataQuery {
                    content_types: vec!["image/png".to_string()],
                    ..MetadataQuery::default()
                }),
                ..ContentSearch::default()
            })
            .unwrap();
        assert!(hits.is_empty(), "type filter must prune mismatched candidates");
    }

    #[test]
    fn metadata_only_search_enumerates_records() {
        let index = index();
        index.index("small-doc", b"aaaa", &meta(500, "text/plain")).unwrap();
        index.index("big-doc", b"bbbb", &meta(5 << 20, "video/mp4")).unwrap();

        let hits = index.search_by_size_range(0, 1024, None).unwrap();
        assert!(hits.iter().any(|h| h.content_id == "small-doc"));
        assert!(!hits.iter().any(|h| h.content_id == "big-doc"));
    }

    #[test]
    fn content_type_search() {
        let index = index();
        index.index("clip", b"framesframesframes", &meta(900, "video/mp4")).unwrap();
        let hits = index.search_by_content_type("video/mp4", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].match_type, "metadata");
    }

    #[test]
    fn custom_attributes_participate_in_buckets() {
        let index = index();
        let mut m = meta(100, "");
        m.attributes.insert("project".to_string(), AttributeValue::String("apollo".to_string()));
        index.index("tagged", b"xyz", &m).unwrap();

        let mut custom = HashMap::new();
        custom.insert("project".to_string(), "apollo".to_string());
        let hits = index
            .search(&ContentSearch {
                metadata: Some(MetadataQuery { custom, ..MetadataQuery::default() }),
                ..ContentSearch::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content_id, "tagged");
    }

    #[test]
    fn preserver_drops_tail_and_drains_budget() {
        let index = ContentIndex::new(&LshConfig::default(), 1000, 0.01, true).unwrap();
        for i in 0..20 {
            index
                .index(&format!("doc-{i}"), format!("payload {i}").as_bytes(), &meta(100, "text/plain"))
                .unwrap();
        }
        let hits = index.search_by_content_type("text/plain", Some("sess")).unwrap();
        // 10% suffix dropped: 20 -> 18.
        assert_eq!(hits.len(), 18);

        for _ in 0..200 {
            index.search_by_content_type("text/plain", Some("sess")).unwrap();
        }
        let drained = index.search_by_content_type("text/plain", Some("sess")).unwrap();
        assert!(drained.is_empty(), "exhausted budget must return empty results");
    }

    #[test]
    fn fingerprint_is_stored() {
        let index = index();
        let fp = index.index("doc", b"some bytes", &meta(10, "")).unwrap();
        assert_eq!(index.fingerprint_of("doc"), Some(fp));
    }

    #[test]
    fn indexed_at_is_stamped_once_and_survives_reindex() {
        let index = index();
        index.index("doc", b"first version", &meta(10, "text/plain")).unwrap();
        let first = index.indexed_at_of("doc").expect("stamped at ingest");
        std::thread::sleep(std::time::Duration::from_millis(5));
        index.index("doc", b"second version", &meta(12, "text/plain")).unwrap();
        assert_eq!(index.indexed_at_of("doc"), Some(first));

        let hits = index.search_by_content_type("text/plain", None).unwrap();
        assert_eq!(hits[0].indexed_at, Some(first));
    }

    #[test]
    fn exact_fingerprint_match_outranks_lsh() {
        let index = index();
        let body: Vec<u8> = (0..4096u32).map(|i| (i % 211) as u8).collect();
        index.index("original", &body, &meta(4096, "text/plain")).unwrap();

        let hits = index
            .search(&ContentSearch {
                similarity: Some(SimilarityQuery {
                    content: body,
                    threshold: 0.8,
                    max_candidates: 10,
                }),
                include_exact: true,
                ..ContentSearch::default()
            })
            .unwrap();
        assert_eq!(hits[0].content_id, "original");
        assert_eq!(hits[0].match_type, "exact");
        assert_eq!(hits[0].relevance, 1.0);
        // The LSH path must not duplicate the exact hit.
        assert_eq!(hits.iter().filter(|h| h.content_id == "original").count(), 1);
    }

    #[test]
    fn query_buckets_cover_size_overlap() {
        let q = MetadataQuery { size_range: Some((1000, 2_000_000)), ..MetadataQuery::default() };
        let buckets = AttributeIndex::query_buckets(&q);
        assert!(buckets.contains(&"size:tiny".to_string()));
        assert!(buckets.contains(&"size:small".to_string()));
        assert!(buckets.contains(&"size:medium".to_string()));
        assert!(!buckets.contains(&"size:huge".to_string()));
    }
}
