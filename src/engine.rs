//! Engine facade: the object the transport layer holds.
//!
//! Wires parser -> validator -> transformer -> coordinator/executor ->
//! session bookkeeping, and exposes the public operations: `search`,
//! `index_file`, `stats`, `clear_sessions`, `perform_maintenance`.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::analytics::{Analytics, AnalyticsSnapshot};
use crate::coordinator::PrivacyCoordinator;
use crate::error::{Result, SearchError};
use crate::executor::SearchExecutor;
use crate::index::{IndexManager, IndexManagerStats};
use crate::query::QueryParser;
use crate::session::{SessionManager, SessionStats};
use crate::store::{BlockStore, BufferPool, MemoryBlockStore, MemoryPool};
use crate::transformer::PrivacyTransformer;
use crate::types::{
    EngineConfig, FileMetadata, SearchOptions, SearchResponse, SearchResult,
};
use crate::validate::{validate_dir_path, validate_filename};
use crate::validator::{QueryValidator, Severity};

/// Snapshot of every component's counters.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub analytics: AnalyticsSnapshot,
    pub sessions: SessionStats,
    pub indices: IndexManagerStats,
    pub cached_searches: usize,
}

/// Outcome of one maintenance pass.
#[derive(Clone, Debug, Serialize)]
pub struct MaintenanceReport {
    pub ran: bool,
    pub pruned_sessions: usize,
    pub pruned_cache_entries: usize,
}

/// The privacy-preserving search engine.
pub struct SearchEngine {
    manager: Arc<IndexManager>,
    parser: QueryParser,
    validator: QueryValidator,
    transformer: PrivacyTransformer,
    coordinator: PrivacyCoordinator,
    executor: Arc<SearchExecutor>,
    sessions: Arc<SessionManager>,
    analytics: Arc<Analytics>,
    query_timeout: Duration,
    query_permits: Semaphore,
}

impl SearchEngine {
    /// Build an engine with the in-memory block store and buffer pool.
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        Self::with_store(cfg, Arc::new(MemoryBlockStore::new()), Arc::new(BufferPool::new(64)))
    }

    /// Build an engine over an externally provided block store and pool.
    pub fn with_store(
        cfg: EngineConfig,
        store: Arc<dyn BlockStore>,
        pool: Arc<dyn MemoryPool>,
    ) -> Result<Self> {
        let analytics = Arc::new(Analytics::new());
        let manager = Arc::new(IndexManager::new(&cfg, store, pool)?);
        let executor =
            Arc::new(SearchExecutor::new(Arc::clone(&manager), Arc::clone(&analytics), &cfg.pipeline));
        let coordinator =
            PrivacyCoordinator::new(Arc::clone(&executor), Arc::clone(&analytics), &cfg.pipeline);
        Ok(Self {
            parser: QueryParser::new(&cfg.pipeline),
            validator: QueryValidator::new(&cfg.pipeline, cfg.rate.clone()),
            transformer: PrivacyTransformer::new(cfg.pipeline.clone()),
            coordinator,
            executor,
            sessions: Arc::new(SessionManager::new(cfg.sessions.clone())),
            analytics,
            query_timeout: Duration::from_secs(cfg.pipeline.query_timeout_secs),
            query_permits: Semaphore::new(cfg.pipeline.max_concurrent_queries.max(1)),
            manager,
        })
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Run one query through the full pipeline. Cancellation and the
    /// per-query deadline propagate into every sleep and fan-out below.
    pub async fn search(&self, raw: &str, options: &SearchOptions) -> Result<SearchResponse> {
        let _permit = self
            .query_permits
            .acquire()
            .await
            .map_err(|_| SearchError::Internal("query pool closed".into()))?;
        let started = Instant::now();

        let session_id =
            self.sessions.get_or_create(options.session_id.as_deref(), options.user_id.as_deref());
        if self.sessions.is_blocked(&session_id) {
            self.analytics.record_blocked();
            return Err(SearchError::PrivacyViolation("session is blocked".into()));
        }

        let mut query = self.parser.parse(raw, options, &session_id)?;
        query.privacy_level =
            self.sessions.effective_privacy_level(&session_id, query.privacy_level);
        self.analytics.record_query(query.query_type, query.privacy_level, query.raw.len());

        let report = self.validator.validate(&query);
        if report.blocked {
            for issue in &report.issues {
                self.sessions.record_security_event(
                    &session_id,
                    issue.rule,
                    severity_name(issue.severity),
                    &issue.detail,
                );
            }
            self.analytics.record_blocked();
            self.sessions.record_query(&session_id, query.query_type, query.privacy_level, false);
            return if report.rate_limited {
                Err(SearchError::RateLimit("request rate exceeded".into()))
            } else {
                Err(SearchError::PrivacyViolation("query blocked by security screen".into()))
            };
        }
        if !report.valid {
            let reason =
                report.warnings.first().cloned().unwrap_or_else(|| "invalid query".to_string());
            return Err(SearchError::InvalidQuery(reason));
        }

        let dummies = self.transformer.transform(&mut query);

        // Budget exhaustion degrades to an empty response, never an error.
        if !self.sessions.consume_budget(&session_id, query.privacy_cost) {
            debug!(session = session_id.as_str(), "session budget exhausted, degrading");
            self.sessions.record_query(&session_id, query.query_type, query.privacy_level, true);
            return Ok(self.build_response(&query, Vec::new(), dummies, options, started));
        }

        let results =
            match tokio::time::timeout(self.query_timeout, self.coordinator.execute(&query)).await {
                Err(_) => {
                    self.analytics.record_timeout();
                    self.sessions.record_query(
                        &session_id,
                        query.query_type,
                        query.privacy_level,
                        false,
                    );
                    return Err(SearchError::Timeout(self.query_timeout));
                }
                Ok(Err(err)) => {
                    self.analytics.record_failure();
                    if matches!(err, SearchError::Internal(_) | SearchError::Index { .. }) {
                        self.analytics.record_internal_error();
                    }
                    self.sessions.record_query(
                        &session_id,
                        query.query_type,
                        query.privacy_level,
                        false,
                    );
                    return Err(err);
                }
                Ok(Ok(results)) => results,
            };

        self.sessions.record_query(&session_id, query.query_type, query.privacy_level, true);
        self.analytics.record_latency(started.elapsed().as_micros() as u64);
        Ok(self.build_response(&query, results, dummies, options, started))
    }

    fn build_response(
        &self,
        query: &crate::types::Query,
        results: Vec<SearchResult>,
        dummies: usize,
        options: &SearchOptions,
        started: Instant,
    ) -> SearchResponse {
        let total = results.len();
        let offset = options.offset.min(total);
        let limit = query.max_results;
        let page: Vec<SearchResult> =
            results.into_iter().skip(offset).take(limit).collect();
        SearchResponse {
            has_more: offset + page.len() < total,
            results: page,
            total_results: total,
            query: query.raw.clone(),
            query_time: started.elapsed().as_millis() as u64,
            privacy_level: query.privacy_level,
            dummy_queries: dummies,
            timing_delay: query.timing_delay.as_millis() as u64,
            noise_injected: query.noise_level > 0.0,
            offset,
            limit,
            search_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    // -----------------------------------------------------------------------
    // Ingest and operations
    // -----------------------------------------------------------------------

    /// Index one file. Indexing is never budget-gated.
    pub fn index_file(
        &self,
        file_id: &str,
        filename: &str,
        dir_path: &str,
        content: &[u8],
        metadata: &FileMetadata,
    ) -> Result<()> {
        if file_id.is_empty() {
            return Err(SearchError::InvalidQuery("file id is empty".into()));
        }
        validate_filename(filename, None)?;
        validate_dir_path(dir_path)?;
        self.manager.index_file(file_id, filename, dir_path, content, metadata)?;
        self.analytics.record_index_op();
        Ok(())
    }

    /// Directory manifest lookup.
    pub fn lookup_directory(&self, path: &str) -> Result<Option<Vec<u8>>> {
        validate_dir_path(path)?;
        self.manager.lookup_directory(path)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            analytics: self.analytics.snapshot(),
            sessions: self.sessions.stats(),
            indices: self.manager.stats(),
            cached_searches: self.executor.cache_len(),
        }
    }

    /// Drop every session and its per-session state.
    pub fn clear_sessions(&self) -> usize {
        let cleared = self.sessions.clear();
        self.manager.retain_sessions(&|_| false);
        self.validator.retain_sessions(&|_| false);
        info!(cleared = cleared, "sessions cleared");
        cleared
    }

    /// Run a maintenance pass: sub-index upkeep, expired sessions, stale
    /// cache entries, and per-session state for dead sessions.
    pub fn perform_maintenance(&self) -> MaintenanceReport {
        let ran = self.manager.maintenance();
        let pruned_sessions = self.sessions.prune_expired();
        let pruned_cache = self.executor.prune_cache();

        let sessions = Arc::clone(&self.sessions);
        let live = move |id: &str| sessions.contains(id);
        self.manager.retain_sessions(&live);
        self.validator.retain_sessions(&live);

        if ran || pruned_sessions > 0 || pruned_cache > 0 {
            debug!(
                ran = ran,
                pruned_sessions = pruned_sessions,
                pruned_cache = pruned_cache,
                "maintenance pass complete"
            );
        }
        MaintenanceReport { ran, pruned_sessions, pruned_cache_entries: pruned_cache }
    }
}

fn severity_name(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SearchEngine {
        let mut cfg = EngineConfig::default();
        cfg.bloom.expected_items = 1000;
        cfg.sessions.dp_enabled = false;
        cfg.pipeline.base_delay_ms = [0, 0, 0, 5, 10];
        cfg.pipeline.random_delay_range_ms = 2;
        cfg.pipeline.execution_delay_range_ms = 2;
        SearchEngine::new(cfg).unwrap()
    }

    fn meta() -> FileMetadata {
        FileMetadata::new(2048, Utc::now(), "text/plain")
    }

    #[tokio::test]
    async fn index_then_search_roundtrip() {
        let engine = engine();
        engine.index_file("f-1", "report.pdf", "/docs", b"the annual report", &meta()).unwrap();

        let opts = SearchOptions { privacy_level: Some(1), ..Default::default() };
        let response = engine.search("report.pdf", &opts).await.unwrap();
        assert!(response.results.iter().any(|r| r.file_id == "f-1"));
        assert_eq!(response.privacy_level, 1);
        assert!(!response.search_id.is_empty());
    }

    #[tokio::test]
    async fn invalid_filename_is_rejected_at_ingest() {
        let engine = engine();
        let err = engine.index_file("f-2", "../evil", "/docs", b"x", &meta()).unwrap_err();
        assert_eq!(err.error_type(), "invalid_query");
    }

    #[tokio::test]
    async fn injection_query_is_blocked() {
        let engine = engine();
        let err = engine
            .search("SELECT * FROM users WHERE password='1'", &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "privacy_violation");
        assert_eq!(engine.stats().analytics.queries_blocked, 1);
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let engine = engine();
        let err = engine.search("   ", &SearchOptions::default()).await.unwrap_err();
        assert_eq!(err.error_type(), "invalid_query");
    }

    #[tokio::test]
    async fn response_reports_dummy_and_timing_fields() {
        let engine = engine();
        engine.index_file("f-1", "notes.txt", "/n", b"notes", &meta()).unwrap();
        let opts = SearchOptions { privacy_level: Some(4), ..Default::default() };
        let response = engine.search("confidential document", &opts).await.unwrap();
        assert_eq!(response.dummy_queries, EngineConfig::default().pipeline.dummy_query_count);
        assert!(response.timing_delay > 0);
        assert!(response.noise_injected);
    }

    #[tokio::test]
    async fn pagination_fields_are_consistent() {
        let engine = engine();
        for i in 0..5 {
            engine
                .index_file(&format!("f-{i}"), &format!("doc{i}.txt"), "/d", b"doc body", &meta())
                .unwrap();
        }
        let opts = SearchOptions {
            privacy_level: Some(1),
            max_results: Some(2),
            ..Default::default()
        };
        let response = engine.search("doc1.txt", &opts).await.unwrap();
        assert!(response.results.len() <= 2);
        assert_eq!(response.limit, 2);
    }

    #[tokio::test]
    async fn sessions_are_created_and_cleared() {
        let engine = engine();
        engine.search("anything", &SearchOptions::default()).await.unwrap();
        assert!(engine.stats().sessions.active_sessions >= 1);
        assert!(engine.clear_sessions() >= 1);
        assert_eq!(engine.stats().sessions.active_sessions, 0);
    }

    #[tokio::test]
    async fn maintenance_reports_activity() {
        let engine = engine();
        let report = engine.perform_maintenance();
        assert!(report.ran);
    }
}
