//! Test harness for end-to-end pipeline tests.
//!
//! Builds a [`SearchEngine`] from a fast test configuration and seeds it
//! with a small corpus, so scenario tests exercise the whole pipeline
//! without network transport.

use chrono::Utc;
use veilsearch::engine::SearchEngine;
use veilsearch::types::{EngineConfig, FileMetadata, SearchOptions};

pub struct TestHarness {
    pub engine: SearchEngine,
}

impl TestHarness {
    /// Engine with short delays, a small filter budget, and DP enabled as
    /// requested.
    pub fn new(dp_enabled: bool) -> Self {
        let mut cfg = EngineConfig::default();
        cfg.bloom.expected_items = 2000;
        cfg.sessions.dp_enabled = dp_enabled;
        cfg.pipeline.base_delay_ms = [0, 0, 0, 5, 10];
        cfg.pipeline.random_delay_range_ms = 2;
        cfg.pipeline.execution_delay_range_ms = 2;
        // Generous rate windows so only the rate-limit tests trip them.
        cfg.rate.per_minute = 10_000;
        cfg.rate.per_hour = 100_000;
        cfg.rate.per_day = 1_000_000;
        cfg.rate.burst = 10_000;
        Self { engine: SearchEngine::new(cfg).expect("test engine") }
    }

    /// Seed a small document corpus.
    pub fn seed_corpus(&self) {
        let files: &[(&str, &str, &str, &str, &str)] = &[
            ("f-report", "annual_report.pdf", "/home/user/documents", "annual financial report for the year", "application/pdf"),
            ("f-notes", "meeting_notes.txt", "/home/user/documents", "notes from the quarterly planning meeting", "text/plain"),
            ("f-photo", "holiday.jpg", "/home/user/pictures", "binary-ish photo payload bytes", "image/jpeg"),
            ("f-budget", "budget.xlsx", "/home/user/finance", "budget spreadsheet with projections", "application/vnd.ms-excel"),
            ("f-readme", "readme.md", "/srv/projects/apollo", "project apollo readme and setup instructions", "text/markdown"),
        ];
        for (id, name, dir, body, ct) in files {
            self.engine
                .index_file(id, name, dir, body.as_bytes(), &FileMetadata::new(body.len() as u64, Utc::now(), *ct))
                .expect("seeding must succeed");
        }
    }

    pub fn options(&self, level: u8) -> SearchOptions {
        SearchOptions { privacy_level: Some(level), ..SearchOptions::default() }
    }

    pub fn options_with_session(&self, level: u8, session: &str) -> SearchOptions {
        SearchOptions {
            privacy_level: Some(level),
            session_id: Some(session.to_string()),
            ..SearchOptions::default()
        }
    }
}
