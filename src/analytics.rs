//! Anonymized analytics: atomic hot-path counters and bucketed query
//! metrics. No raw query strings or identifiers are ever recorded.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::QueryType;

/// Query-length histogram buckets (upper bounds, chars).
const LENGTH_BUCKETS: [usize; 5] = [8, 16, 32, 64, 1000];

/// Process-wide counters. All writes are lock-free.
#[derive(Default)]
pub struct Analytics {
    queries_total: AtomicU64,
    queries_blocked: AtomicU64,
    queries_failed: AtomicU64,
    queries_timed_out: AtomicU64,
    dummy_queries_generated: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    index_operations: AtomicU64,
    internal_errors: AtomicU64,
    latency_micros_total: AtomicU64,
    latency_samples: AtomicU64,
    by_type: DashMap<&'static str, u64>,
    by_privacy_level: DashMap<u8, u64>,
    length_histogram: [AtomicU64; 5],
}

/// Serialized snapshot for `getStats`.
#[derive(Clone, Debug, Serialize)]
pub struct AnalyticsSnapshot {
    pub queries_total: u64,
    pub queries_blocked: u64,
    pub queries_failed: u64,
    pub queries_timed_out: u64,
    pub dummy_queries_generated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub index_operations: u64,
    pub internal_errors: u64,
    pub avg_latency_micros: u64,
    pub queries_by_type: std::collections::HashMap<String, u64>,
    pub queries_by_privacy_level: std::collections::HashMap<u8, u64>,
    pub query_length_buckets: Vec<u64>,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted query: its type, level, and bucketed length.
    pub fn record_query(&self, query_type: QueryType, privacy_level: u8, query_len: usize) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        *self.by_type.entry(query_type.as_str()).or_insert(0) += 1;
        *self.by_privacy_level.entry(privacy_level).or_insert(0) += 1;
        let bucket = LENGTH_BUCKETS.iter().position(|&b| query_len <= b).unwrap_or(4);
        self.length_histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.queries_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.queries_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dummies(&self, count: usize) {
        self.dummy_queries_generated.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_index_op(&self) {
        self.index_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, micros: u64) {
        self.latency_micros_total.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dummy_queries_generated(&self) -> u64 {
        self.dummy_queries_generated.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        AnalyticsSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            queries_blocked: self.queries_blocked.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            queries_timed_out: self.queries_timed_out.load(Ordering::Relaxed),
            dummy_queries_generated: self.dummy_queries_generated.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            index_operations: self.index_operations.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            avg_latency_micros: if samples > 0 {
                self.latency_micros_total.load(Ordering::Relaxed) / samples
            } else {
                0
            },
            queries_by_type: self
                .by_type
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            queries_by_privacy_level: self.by_privacy_level.iter().map(|e| (*e.key(), *e.value())).collect(),
            query_length_buckets: self.length_histogram.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let a = Analytics::new();
        a.record_query(QueryType::Filename, 3, 10);
        a.record_query(QueryType::Content, 4, 40);
        a.record_dummies(3);
        a.record_cache(true);
        a.record_cache(false);
        a.record_latency(500);
        a.record_latency(1500);

        let snap = a.snapshot();
        assert_eq!(snap.queries_total, 2);
        assert_eq!(snap.dummy_queries_generated, 3);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.avg_latency_micros, 1000);
        assert_eq!(snap.queries_by_type["filename"], 1);
        assert_eq!(snap.queries_by_privacy_level[&4], 1);
    }

    #[test]
    fn lengths_are_bucketed_not_stored() {
        let a = Analytics::new();
        a.record_query(QueryType::Filename, 1, 5);
        a.record_query(QueryType::Filename, 1, 30);
        let snap = a.snapshot();
        assert_eq!(snap.query_length_buckets[0], 1);
        assert_eq!(snap.query_length_buckets[2], 1);
    }
}
