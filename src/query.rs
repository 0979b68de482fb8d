//! Query parser: raw string + options bag -> typed [`Query`], plus the
//! metadata-term grammar (`type:`, `size:`, `after:`, `before:`, `key=value`).

use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

use crate::error::{Result, SearchError};
use crate::types::{size_bucket_bounds, MetadataQuery, PipelineConfig, Query, QueryType, SearchOptions};

/// Turns raw query strings into typed queries with pipeline defaults
/// applied.
pub struct QueryParser {
    default_privacy_level: u8,
    default_max_results: usize,
}

impl QueryParser {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            default_privacy_level: cfg.default_privacy_level,
            default_max_results: cfg.default_max_results,
        }
    }

    /// Parse a raw query. The session ID must already be resolved by the
    /// caller; everything else falls back to configured defaults.
    pub fn parse(&self, raw: &str, options: &SearchOptions, session_id: &str) -> Result<Query> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SearchError::InvalidQuery("query string is empty".into()));
        }

        let privacy_level = options
            .privacy_level
            .filter(|l| (1..=5).contains(l))
            .unwrap_or(self.default_privacy_level);

        let query_type = match options.query_type.as_deref() {
            Some("filename") => QueryType::Filename,
            Some("content") => QueryType::Content,
            Some("metadata") => QueryType::Metadata,
            Some("similarity") => QueryType::Similarity,
            Some("complex") => QueryType::Complex,
            Some(other) => {
                return Err(SearchError::InvalidQuery(format!("unknown query type '{other}'")))
            }
            None => infer_type(trimmed),
        };

        Ok(Query {
            raw: trimmed.to_string(),
            obfuscated: trimmed.to_string(),
            query_type,
            max_results: options.max_results.unwrap_or(self.default_max_results).max(1),
            privacy_level,
            session_id: session_id.to_string(),
            user_id: options.user_id.clone(),
            request_time: Utc::now(),
            dummy_queries: Vec::new(),
            k_anonymity_group: Vec::new(),
            noise_level: 0.0,
            timing_delay: Duration::ZERO,
            privacy_cost: 0.0,
        })
    }
}

/// Infer the query type from its shape: two or more boolean operators make
/// it complex, metadata terms search metadata, multi-word or ':'-delimited
/// strings search content, and a single bare word searches filenames.
fn infer_type(query: &str) -> QueryType {
    let boolean_ops = query
        .split_whitespace()
        .filter(|w| matches!(*w, "AND" | "OR" | "NOT"))
        .count();
    if boolean_ops >= 2 {
        return QueryType::Complex;
    }
    if query.split_whitespace().all(is_metadata_term) {
        return QueryType::Metadata;
    }
    let words = query.split_whitespace().count();
    if words > 1 || query.contains(':') {
        QueryType::Content
    } else {
        QueryType::Filename
    }
}

fn is_metadata_term(term: &str) -> bool {
    term.split_once(':').is_some_and(|(key, _)| {
        matches!(key, "type" | "size" | "after" | "before")
    }) || term.contains('=')
}

/// Build an attribute sub-query from metadata terms. Returns `None` when no
/// term uses the metadata grammar.
///
/// Grammar: `type:<content-type>`, `size:<tiny|small|medium|large|huge>`,
/// `after:YYYY-MM-DD`, `before:YYYY-MM-DD`, `<key>=<value>`.
pub fn parse_metadata_terms(terms: &[String]) -> Option<MetadataQuery> {
    let mut query = MetadataQuery::default();
    let mut any = false;
    let mut after: Option<DateTime<Utc>> = None;
    let mut before: Option<DateTime<Utc>> = None;

    for term in terms {
        if let Some((key, value)) = term.split_once(':') {
            match key {
                "type" if !value.is_empty() => {
                    query.content_types.push(value.to_string());
                    any = true;
                    continue;
                }
                "size" => {
                    if let Some(bounds) = size_bucket_bounds(value) {
                        query.size_range = Some(match query.size_range {
                            Some((lo, hi)) => (lo.min(bounds.0), hi.max(bounds.1)),
                            None => bounds,
                        });
                        any = true;
                    }
                    continue;
                }
                "after" | "before" => {
                    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                        let at = date
                            .and_hms_opt(0, 0, 0)
                            .expect("midnight is always valid")
                            .and_utc();
                        if key == "after" {
                            after = Some(at);
                        } else {
                            before = Some(at);
                        }
                        any = true;
                    }
                    continue;
                }
                _ => {}
            }
        }
        if let Some((key, value)) = term.split_once('=') {
            if !key.is_empty() && !value.is_empty() {
                query.custom.insert(key.to_string(), value.to_string());
                any = true;
            }
        }
    }

    if after.is_some() || before.is_some() {
        // An open-ended lower bound defaults to a year back; bucket
        // enumeration downstream is day-granular and capped.
        let from = after.unwrap_or_else(|| Utc::now() - chrono::Duration::days(365));
        let to = before.unwrap_or_else(Utc::now);
        query.time_range = Some((from, to));
    }
    any.then_some(query)
}
