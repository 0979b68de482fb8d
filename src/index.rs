//! Index manager: cross-index orchestration.
//!
//! One `index_file` call fans out to the privacy, manifest, and content
//! indices under the manager's write lock, so concurrent searches observe
//! either all three writes or none. Searches fan out in parallel (rayon)
//! when enabled and merge per-file matches with source weights.

use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::content::{AttributeIndex, ContentIndex, ContentIndexStats, ContentSearch};
use crate::error::{Result, SearchError};
use crate::manifest::{ManifestIndex, ManifestIndexStats, PathCipher, SegmentKey};
use crate::privacy::{PrivacyIndex, PrivacyIndexStats};
use crate::store::{BlockStore, MemoryPool};
use crate::types::{
    EngineConfig, FileMetadata, IndexSource, MergedMatch, QueryType, SimilarityQuery,
    UnifiedMatch, UnifiedQuery,
};

/// Merge weights for the manager's sequential path.
pub fn manager_weight(source: IndexSource) -> f64 {
    match source {
        IndexSource::Privacy => 0.6,
        IndexSource::Manifest => 0.8,
        IndexSource::Content => 1.0,
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct IndexManagerStats {
    pub indexed_files: usize,
    pub privacy: PrivacyIndexStats,
    pub manifest: ManifestIndexStats,
    pub content: ContentIndexStats,
}

/// Holds the three sub-indices and coordinates writes across them.
pub struct IndexManager {
    privacy: PrivacyIndex,
    manifest: ManifestIndex,
    content: ContentIndex,
    /// Encrypted filename -> file IDs, consulted after a filter hit.
    names: RwLock<HashMap<SegmentKey, Vec<(String, String)>>>,
    name_cipher: PathCipher,
    /// Searches take this shared; `index_file` takes it exclusive so the
    /// three-way write is atomic with respect to readers.
    fanout: RwLock<()>,
    parallel: bool,
    maintenance_interval: Duration,
    last_maintenance: Mutex<Option<Instant>>,
    default_threshold: f64,
}

impl IndexManager {
    pub fn new(
        cfg: &EngineConfig,
        store: Arc<dyn BlockStore>,
        pool: Arc<dyn MemoryPool>,
    ) -> Result<Self> {
        let mut name_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut name_key);
        Ok(Self {
            privacy: PrivacyIndex::new(&cfg.bloom, cfg.sessions.dp_enabled)?,
            manifest: ManifestIndex::new(&cfg.manifest, &cfg.bloom, store, pool)?,
            content: ContentIndex::new(
                &cfg.lsh,
                cfg.bloom.expected_items,
                cfg.bloom.false_positive_rate,
                cfg.sessions.dp_enabled,
            )?,
            names: RwLock::new(HashMap::new()),
            name_cipher: PathCipher::new(name_key),
            fanout: RwLock::new(()),
            parallel: cfg.pipeline.parallel_search,
            maintenance_interval: Duration::from_secs(cfg.server.maintenance_interval_secs),
            last_maintenance: Mutex::new(None),
            default_threshold: cfg.lsh.similarity_threshold,
        })
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Index one file across all three indices. The first failing stage's
    /// error propagates and aborts the call.
    pub fn index_file(
        &self,
        file_id: &str,
        filename: &str,
        dir_path: &str,
        content: &[u8],
        metadata: &FileMetadata,
    ) -> Result<()> {
        let _guard = self.fanout.write().map_err(|_| lock_poisoned())?;

        let enc_name = self.name_cipher.encrypt_path(filename);
        self.privacy
            .index_filename(&enc_name, metadata)
            .map_err(|e| SearchError::index(IndexSource::Privacy, e.to_string()))?;

        let tag = format!("{filename}:{file_id}");
        self.manifest
            .index_directory(dir_path, tag.as_bytes())
            .map_err(|e| SearchError::index(IndexSource::Manifest, e.to_string()))?;

        let fingerprint = self
            .content
            .index(file_id, content, metadata)
            .map_err(|e| SearchError::index(IndexSource::Content, e.to_string()))?;

        // Secondary privacy registrations: blinded fingerprint and the
        // encrypted directory path.
        self.privacy
            .index_content(&fingerprint, file_id)
            .map_err(|e| SearchError::index(IndexSource::Privacy, e.to_string()))?;
        let enc_dir = self.manifest.cipher().encrypt_path(dir_path);
        self.privacy
            .index_directory(&enc_dir)
            .map_err(|e| SearchError::index(IndexSource::Privacy, e.to_string()))?;

        let mut names = self.names.write().map_err(|_| lock_poisoned())?;
        let entries = names.entry(enc_name).or_default();
        if !entries.iter().any(|(id, _)| id == file_id) {
            entries.push((file_id.to_string(), dir_path.to_string()));
        }
        debug!(file_id = file_id, "indexed file across privacy/manifest/content");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Fan a unified query out to the three indices and merge per-file with
    /// the manager weights.
    pub fn search_files(&self, query: &UnifiedQuery) -> Result<Vec<MergedMatch>> {
        let matches = self.fan_out(query)?;
        let mut merged = merge_matches(matches, manager_weight);
        merged.truncate(query.max_results.max(1));
        Ok(merged)
    }

    /// Collect raw single-source matches from all three indices, in
    /// parallel when enabled. The first sub-index error surfaces.
    pub fn fan_out(&self, query: &UnifiedQuery) -> Result<Vec<UnifiedMatch>> {
        let _guard = self.fanout.read().map_err(|_| lock_poisoned())?;

        if self.parallel {
            let (privacy_res, (manifest_res, content_res)) = rayon::join(
                || self.privacy_matches(query),
                || rayon::join(|| self.manifest_matches(query), || self.content_matches(query)),
            );
            let mut all = privacy_res?;
            all.extend(manifest_res?);
            all.extend(content_res?);
            Ok(all)
        } else {
            let mut all = self.privacy_matches(query)?;
            all.extend(self.manifest_matches(query)?);
            all.extend(self.content_matches(query)?);
            Ok(all)
        }
    }

    /// Filename-filter matches. The Bloom screen runs first (and pays the
    /// DP cost when enabled); the name table resolves IDs only after a hit.
    pub fn privacy_matches(&self, query: &UnifiedQuery) -> Result<Vec<UnifiedMatch>> {
        let mut matches = Vec::new();
        for term in &query.terms {
            let enc = self.name_cipher.encrypt_path(term);
            if !self.privacy.query_filename(&enc, Some(query.session_id.as_str()))? {
                continue;
            }
            let entries = {
                let names = self.names.read().map_err(|_| lock_poisoned())?;
                names.get(&enc).cloned().unwrap_or_default()
            };
            for (file_id, dir) in entries {
                matches.push(UnifiedMatch {
                    relevance: 1.0,
                    match_type: "filename".to_string(),
                    similarity: 0.0,
                    source: IndexSource::Privacy,
                    filename: Some(term.clone()),
                    directory: Some(dir),
                    content_type: None,
                    last_modified: None,
                    indexed_at: self.content.indexed_at_of(&file_id),
                    file_id,
                });
            }
        }
        Ok(matches)
    }

    /// Manifest tag matches over recorded directory blobs.
    pub fn manifest_matches(&self, query: &UnifiedQuery) -> Result<Vec<UnifiedMatch>> {
        let hits = self
            .manifest
            .search_tags(&query.terms, query.max_results.max(1))
            .map_err(|e| SearchError::index(IndexSource::Manifest, e.to_string()))?;
        Ok(hits
            .into_iter()
            .map(|h| UnifiedMatch {
                relevance: h.relevance,
                match_type: "path".to_string(),
                similarity: 0.0,
                source: IndexSource::Manifest,
                filename: Some(h.filename),
                directory: None,
                content_type: None,
                last_modified: None,
                indexed_at: self.content.indexed_at_of(&h.file_id),
                file_id: h.file_id,
            })
            .collect())
    }

    /// Content matches: explicit similarity/metadata parts when present,
    /// otherwise the query text itself is fingerprinted for content-typed
    /// queries. The privacy index's content and metadata filters act as
    /// fast existence oracles before the content index is consulted.
    pub fn content_matches(&self, query: &UnifiedQuery) -> Result<Vec<UnifiedMatch>> {
        let similarity = match (&query.similarity, query.query_type) {
            (Some(sim), _) => Some(sim.clone()),
            (None, QueryType::Content | QueryType::Similarity | QueryType::Complex) => {
                Some(SimilarityQuery {
                    content: query.terms.join(" ").into_bytes(),
                    threshold: self.default_threshold,
                    max_candidates: query.max_results.max(1),
                })
            }
            _ => None,
        };
        if similarity.is_none() && query.metadata.is_none() {
            return Ok(Vec::new());
        }

        // Metadata screen: a bucket set the metadata filter has never seen
        // is a definite miss for a metadata-only query.
        if let Some(metadata) = &query.metadata {
            let requested = AttributeIndex::query_buckets(metadata);
            if !requested.is_empty() {
                let mut any_present = false;
                for bucket in &requested {
                    if self.privacy.query_metadata_bucket(bucket)? {
                        any_present = true;
                        break;
                    }
                }
                if !any_present && similarity.is_none() {
                    return Ok(Vec::new());
                }
            }
        }

        // Exact-match gate: only consult the fingerprint table when the
        // (blinded) content filter says the fingerprint may exist.
        let include_exact = match &similarity {
            Some(sim) => {
                let fingerprint = self.content.analyzer().fingerprint(&sim.content);
                self.privacy.query_content(&fingerprint)?
            }
            None => false,
        };

        let hits = self
            .content
            .search(&ContentSearch {
                similarity,
                metadata: query.metadata.clone(),
                session_id: Some(query.session_id.clone()),
                include_exact,
            })
            .map_err(|e| SearchError::index(IndexSource::Content, e.to_string()))?;
        Ok(hits
            .into_iter()
            .map(|h| UnifiedMatch {
                file_id: h.content_id,
                relevance: h.relevance,
                match_type: h.match_type.to_string(),
                similarity: h.similarity,
                source: IndexSource::Content,
                filename: None,
                directory: None,
                content_type: h.content_type,
                last_modified: h.last_modified,
                indexed_at: h.indexed_at,
            })
            .collect())
    }

    /// Directory lookup, screened by the privacy index's directory filter.
    /// Every directory indexed through `index_file` is registered there, so
    /// a filter miss is a definite miss.
    pub fn lookup_directory(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.fanout.read().map_err(|_| lock_poisoned())?;
        let enc_dir = self.manifest.cipher().encrypt_path(path);
        if !self.privacy.query_directory(&enc_dir)? {
            return Ok(None);
        }
        self.manifest.lookup_directory(path)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Periodic maintenance, gated by the configured interval. Returns true
    /// when a run actually happened.
    pub fn maintenance(&self) -> bool {
        let mut last = self.last_maintenance.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = *last {
            if prev.elapsed() < self.maintenance_interval {
                return false;
            }
        }
        *last = Some(Instant::now());
        drop(last);

        self.privacy.maintenance();
        self.content.maintenance();
        let purged = self.manifest.maintenance();
        debug!(purged_manifests = purged, "index maintenance complete");
        true
    }

    /// Drop DP budget state for dead sessions.
    pub fn retain_sessions(&self, live: &dyn Fn(&str) -> bool) {
        self.privacy.retain_sessions(live);
    }

    pub fn stats(&self) -> IndexManagerStats {
        let names = self.names.read().map(|n| n.values().map(Vec::len).sum()).unwrap_or(0);
        IndexManagerStats {
            indexed_files: names,
            privacy: self.privacy.stats(),
            manifest: self.manifest.stats(),
            content: self.content.stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Weighted merge
// ---------------------------------------------------------------------------

/// Group single-source matches by file ID and combine them into one record
/// per file: relevance = sum(r_i * w_i) / sum(w_i), source list union,
/// fields coalesced from the highest-weighted source. Output is sorted by
/// descending relevance.
pub fn merge_matches(matches: Vec<UnifiedMatch>, weight: fn(IndexSource) -> f64) -> Vec<MergedMatch> {
    let mut groups: HashMap<String, Vec<UnifiedMatch>> = HashMap::new();
    for m in matches {
        groups.entry(m.file_id.clone()).or_default().push(m);
    }

    let mut merged: Vec<MergedMatch> = groups
        .into_iter()
        .map(|(file_id, group)| {
            let mut weight_sum = 0.0;
            let mut weighted = 0.0;
            let mut sources = Vec::new();
            let mut similarity = 0.0f64;
            for m in &group {
                let w = weight(m.source);
                weight_sum += w;
                weighted += m.relevance * w;
                if !sources.contains(&m.source) {
                    sources.push(m.source);
                }
                similarity = similarity.max(m.similarity);
            }
            let primary = group
                .iter()
                .max_by(|a, b| {
                    weight(a.source).partial_cmp(&weight(b.source)).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("group is non-empty");
            MergedMatch {
                file_id,
                relevance: if weight_sum > 0.0 { weighted / weight_sum } else { 0.0 },
                match_type: primary.match_type.clone(),
                similarity,
                sources,
                primary: primary.source,
                filename: group.iter().find_map(|m| m.filename.clone()),
                directory: group.iter().find_map(|m| m.directory.clone()),
                content_type: group.iter().find_map(|m| m.content_type.clone()),
                last_modified: group.iter().find_map(|m| m.last_modified),
                indexed_at: group.iter().find_map(|m| m.indexed_at),
            }
        })
        .collect();

    merged.sort_unstable_by(|a, b| {
        b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

fn lock_poisoned() -> SearchError {
    SearchError::Internal("index manager lock poisoned".into())
}
