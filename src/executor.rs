//! Search executor: cache lookup, sub-index fan-out, weighted merge, and
//! post-processing.
//!
//! The executor owns a TTL-bounded result cache keyed by the obfuscated
//! query. Parallel-safe queries fan out directly over the three indices
//! with the executor's own weight map; everything else takes the
//! sequential path through the index manager.

use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::analytics::Analytics;
use crate::error::Result;
use crate::index::{merge_matches, IndexManager};
use crate::types::{IndexSource, PipelineConfig, Query, QueryType, SearchResult, UnifiedQuery};

/// Merge weights for the executor's parallel path.
pub fn executor_weight(source: IndexSource) -> f64 {
    match source {
        IndexSource::Privacy => 0.7,
        IndexSource::Manifest => 0.9,
        IndexSource::Content => 1.0,
    }
}

// ---------------------------------------------------------------------------
// Query optimizer
// ---------------------------------------------------------------------------

/// Execution plan derived from the query shape.
#[derive(Clone, Copy, Debug)]
pub struct QueryPlan {
    /// The three sub-indices can be queried concurrently.
    pub parallel_safe: bool,
    /// The result set may be cached.
    pub cacheable: bool,
}

/// Pattern analysis for execution planning. Complex queries stay on the
/// sequential path; level-5 results never enter the cache.
pub struct QueryOptimizer;

impl QueryOptimizer {
    pub fn analyze(query: &Query) -> QueryPlan {
        QueryPlan {
            parallel_safe: query.query_type != QueryType::Complex,
            cacheable: query.privacy_level < 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct CachedSearch {
    results: Vec<SearchResult>,
    created: Instant,
}

/// Executes transformed queries against the index manager.
pub struct SearchExecutor {
    manager: Arc<IndexManager>,
    cache: DashMap<String, CachedSearch>,
    analytics: Arc<Analytics>,
    base_cache_ttl: Duration,
}

impl SearchExecutor {
    pub fn new(manager: Arc<IndexManager>, analytics: Arc<Analytics>, cfg: &PipelineConfig) -> Self {
        Self {
            manager,
            cache: DashMap::new(),
            analytics,
            base_cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
        }
    }

    /// Cache key over everything that shapes the result set.
    fn cache_key(query: &Query) -> String {
        let mut h = Sha256::new();
        h.update(query.obfuscated.as_bytes());
        h.update([0x1f]);
        h.update(query.query_type.as_str().as_bytes());
        h.update([query.privacy_level]);
        h.update((query.max_results as u64).to_le_bytes());
        hex::encode(h.finalize())
    }

    /// Higher privacy levels keep cached results for less time.
    fn cache_ttl(&self, privacy_level: u8) -> Duration {
        self.base_cache_ttl / privacy_level.max(1) as u32
    }

    /// Execute a transformed query. Cache hits short-circuit; misses fan
    /// out and (when the plan allows) populate the cache.
    pub fn execute(&self, query: &Query) -> Result<Vec<SearchResult>> {
        let plan = QueryOptimizer::analyze(query);
        let key = Self::cache_key(query);

        if let Some(cached) = self.cache.get(&key) {
            if cached.created.elapsed() <= self.cache_ttl(query.privacy_level) {
                self.analytics.record_cache(true);
                return Ok(cached.results.clone());
            }
            drop(cached);
            self.cache.remove(&key);
        }
        self.analytics.record_cache(false);

        let terms = query.terms();
        let metadata = match query.query_type {
            QueryType::Metadata | QueryType::Complex => crate::query::parse_metadata_terms(&terms),
            _ => None,
        };
        let unified = UnifiedQuery {
            terms,
            query_type: query.query_type,
            max_results: query.max_results,
            session_id: query.session_id.clone(),
            similarity: None,
            metadata,
        };

        let merged = if plan.parallel_safe {
            let matches = self.manager.fan_out(&unified)?;
            let mut merged = merge_matches(matches, executor_weight);
            merged.truncate(unified.max_results.max(1));
            merged
        } else {
            self.manager.search_files(&unified)?
        };

        let mut results: Vec<SearchResult> =
            merged.iter().map(|m| SearchResult::from_merged(m, query.privacy_level)).collect();
        self.post_process(&mut results, query);

        if plan.cacheable {
            self.cache.insert(key, CachedSearch { results: results.clone(), created: Instant::now() });
        }
        debug!(
            results = results.len(),
            parallel = plan.parallel_safe,
            "query executed against indices"
        );
        Ok(results)
    }

    /// Cap to `max_results` and add relevance noise at level >= 4.
    fn post_process(&self, results: &mut Vec<SearchResult>, query: &Query) {
        results.truncate(query.max_results.max(1));
        if query.privacy_level >= 4 && query.noise_level > 0.0 {
            let mut rng = rand::thread_rng();
            for r in results.iter_mut() {
                let noise = rng.gen_range(-query.noise_level / 2.0..=query.noise_level / 2.0);
                r.relevance = (r.relevance + noise).clamp(0.0, 1.0);
                r.noise_level = query.noise_level;
            }
        }
    }

    /// Drop expired cache entries. Returns the number removed.
    pub fn prune_cache(&self) -> usize {
        let before = self.cache.len();
        // The longest possible TTL bounds staleness for every level.
        let ttl = self.base_cache_ttl;
        self.cache.retain(|_, entry| entry.created.elapsed() <= ttl);
        before - self.cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
