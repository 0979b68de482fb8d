//! Privacy coordinator: runs the real query alongside a bounded dummy-query
//! workload, applies the timing delay, and finishes with result-level
//! privacy.
//!
//! All sleeps are tokio sleeps, so cancelling the per-query future (the
//! engine wraps every search in its deadline) abandons the delay and the
//! dummy wait promptly.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::analytics::Analytics;
use crate::error::Result;
use crate::executor::SearchExecutor;
use crate::results::ResultProcessor;
use crate::types::{PipelineConfig, Query, QueryType, SearchResult};

/// Global cap on waiting for stragglers in the dummy workload.
const DUMMY_WAIT_CAP: Duration = Duration::from_secs(5);

/// Result-count obfuscation caps per privacy level.
fn obfuscated_max_results(privacy_level: u8, requested: usize) -> usize {
    let cap = match privacy_level {
        5 => 20,
        4 => 30,
        3 => 50,
        _ => usize::MAX,
    };
    requested.min(cap)
}

/// Coordinates dummy traffic, timing obfuscation, and result privacy around
/// the executor.
pub struct PrivacyCoordinator {
    executor: Arc<SearchExecutor>,
    processor: ResultProcessor,
    analytics: Arc<Analytics>,
    dummy_permits: Arc<Semaphore>,
    execution_delay_range: Duration,
    default_max_results: usize,
}

impl PrivacyCoordinator {
    pub fn new(executor: Arc<SearchExecutor>, analytics: Arc<Analytics>, cfg: &PipelineConfig) -> Self {
        Self {
            executor,
            processor: ResultProcessor::new(cfg),
            analytics,
            dummy_permits: Arc::new(Semaphore::new(cfg.max_concurrent_dummies.max(1))),
            execution_delay_range: Duration::from_millis(cfg.execution_delay_range_ms),
            default_max_results: cfg.default_max_results,
        }
    }

    /// Execute a transformed query with its cover traffic.
    pub async fn execute(&self, query: &Query) -> Result<Vec<SearchResult>> {
        let dummy_handles = self.spawn_dummies(query);

        let results = self.executor.execute(query)?;

        // Let the cover traffic finish (bounded) before the delay, so the
        // observable burst ends together.
        let deadline = Instant::now() + DUMMY_WAIT_CAP;
        for handle in dummy_handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                trace!("dummy query outlived the wait cap");
                break;
            }
        }

        if query.timing_delay > Duration::ZERO {
            tokio::time::sleep(query.timing_delay).await;
        }

        Ok(self.apply_result_privacy(query, results))
    }

    /// Fire-and-mostly-forget dummy workload behind the semaphore, each
    /// with its own scheduling jitter.
    fn spawn_dummies(&self, query: &Query) -> Vec<tokio::task::JoinHandle<()>> {
        if query.dummy_queries.is_empty() {
            return Vec::new();
        }
        self.analytics.record_dummies(query.dummy_queries.len());

        let mut handles = Vec::with_capacity(query.dummy_queries.len());
        for dummy_text in &query.dummy_queries {
            let permits = Arc::clone(&self.dummy_permits);
            let executor = Arc::clone(&self.executor);
            let dummy = self.make_dummy_query(dummy_text, query.max_results);
            let jitter_range = self.execution_delay_range;

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = permits.acquire().await else { return };
                if !jitter_range.is_zero() {
                    let jitter_ms = rand::thread_rng().gen_range(0..jitter_range.as_millis() as u64);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                }
                // Dummy failures are deliberately invisible.
                let _ = executor.execute(&dummy);
            }));
        }
        debug!(count = handles.len(), "dummy workload scheduled");
        handles
    }

    /// Dummies run under a coordinator-scoped session so cover traffic
    /// never drains the caller's privacy budget.
    fn make_dummy_query(&self, text: &str, max_results: usize) -> Query {
        Query {
            raw: text.to_string(),
            obfuscated: text.to_string(),
            query_type: QueryType::Filename,
            max_results: max_results.min(self.default_max_results),
            privacy_level: 1,
            session_id: "sess_cover".to_string(),
            user_id: None,
            request_time: chrono::Utc::now(),
            dummy_queries: Vec::new(),
            k_anonymity_group: Vec::new(),
            noise_level: 0.0,
            timing_delay: Duration::ZERO,
            privacy_cost: 0.0,
        }
    }

    /// K-anonymity accounting plus the processor stages, with the
    /// level-scaled result cap.
    fn apply_result_privacy(&self, query: &Query, results: Vec<SearchResult>) -> Vec<SearchResult> {
        trace!(
            group = query.k_anonymity_group.len(),
            "query executed within k-anonymity cohort"
        );
        let max = obfuscated_max_results(query.privacy_level, query.max_results);
        self.processor.process(results, query.privacy_level, query.noise_level, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexManager;
    use crate::query::QueryParser;
    use crate::store::{BufferPool, MemoryBlockStore};
    use crate::transformer::PrivacyTransformer;
    use crate::types::{EngineConfig, FileMetadata, SearchOptions};
    use chrono::Utc;

    fn coordinator(cfg: &EngineConfig) -> (PrivacyCoordinator, Arc<Analytics>) {
        let manager = Arc::new(
            IndexManager::new(cfg, Arc::new(MemoryBlockStore::new()), Arc::new(BufferPool::new(8)))
                .unwrap(),
        );
        manager
            .index_file(
                "f-1",
                "notes.txt",
                "/home",
                b"meeting notes",
                &FileMetadata::new(128, Utc::now(), "text/plain"),
            )
            .unwrap();
        let analytics = Arc::new(Analytics::new());
        let executor =
            Arc::new(SearchExecutor::new(manager, Arc::clone(&analytics), &cfg.pipeline));
        (PrivacyCoordinator::new(executor, Arc::clone(&analytics), &cfg.pipeline), analytics)
    }

    fn transformed_query(cfg: &EngineConfig, raw: &str, level: u8) -> Query {
        let opts = SearchOptions { privacy_level: Some(level), ..Default::default() };
        let mut q = QueryParser::new(&cfg.pipeline).parse(raw, &opts, "sess-c").unwrap();
        PrivacyTransformer::new(cfg.pipeline.clone()).transform(&mut q);
        q
    }

    fn quick_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.bloom.expected_items = 500;
        cfg.sessions.dp_enabled = false;
        cfg.pipeline.base_delay_ms = [0, 0, 0, 5, 10];
        cfg.pipeline.random_delay_range_ms = 5;
        cfg.pipeline.execution_delay_range_ms = 5;
        cfg
    }

    #[tokio::test]
    async fn low_level_query_returns_results() {
        let cfg = quick_config();
        let (coordinator, _) = coordinator(&cfg);
        let q = transformed_query(&cfg, "notes.txt", 1);
        let results = coordinator.execute(&q).await.unwrap();
        assert!(results.iter().any(|r| r.file_id == "f-1"));
    }

    #[tokio::test]
    async fn dummy_accounting_matches_configuration() {
        let cfg = quick_config();
        let (coordinator, analytics) = coordinator(&cfg);
        let q = transformed_query(&cfg, "notes.txt", 4);
        assert_eq!(q.dummy_queries.len(), cfg.pipeline.dummy_query_count);

        let before = analytics.dummy_queries_generated();
        coordinator.execute(&q).await.unwrap();
        assert_eq!(
            analytics.dummy_queries_generated() - before,
            cfg.pipeline.dummy_query_count as u64
        );
    }

    #[tokio::test]
    async fn timing_delay_is_applied() {
        let mut cfg = quick_config();
        cfg.pipeline.base_delay_ms = [0, 0, 0, 40, 40];
        cfg.pipeline.random_delay_range_ms = 0;
        let (coordinator, _) = coordinator(&cfg);
        let q = transformed_query(&cfg, "notes.txt", 4);
        assert!(q.timing_delay >= Duration::from_millis(4)); // floor of factor 0.1

        let started = Instant::now();
        coordinator.execute(&q).await.unwrap();
        assert!(started.elapsed() >= q.timing_delay);
    }

    #[tokio::test]
    async fn cancellation_cuts_the_delay_short() {
        let mut cfg = quick_config();
        cfg.pipeline.base_delay_ms = [0, 0, 0, 0, 10_000];
        cfg.pipeline.random_delay_range_ms = 0;
        let (coordinator, _) = coordinator(&cfg);
        let q = transformed_query(&cfg, "notes.txt", 5);
        assert!(q.timing_delay >= Duration::from_millis(1000));

        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_millis(80), coordinator.execute(&q)).await;
        assert!(outcome.is_err(), "deadline must cancel the delayed query");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn result_cap_shrinks_with_level() {
        let cfg = quick_config();
        let (coordinator, _) = coordinator(&cfg);
        let mut q = transformed_query(&cfg, "notes.txt", 5);
        q.max_results = 500;
        let results = coordinator.execute(&q).await.unwrap();
        assert!(results.len() <= 20);
    }

    #[test]
    fn obfuscated_caps_shrink_with_level() {
        assert_eq!(obfuscated_max_results(3, 500), 50);
        assert_eq!(obfuscated_max_results(4, 500), 30);
        assert_eq!(obfuscated_max_results(5, 500), 20);
        assert_eq!(obfuscated_max_results(2, 500), 500);
    }
}
