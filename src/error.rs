//! Error taxonomy for the search core.
//!
//! Every failure that crosses the public boundary is one of five types
//! (`invalid_query`, `privacy_violation`, `rate_limit`, `timeout`,
//! `internal_error`); sub-index failures additionally carry the index that
//! produced them.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::IndexSource;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SearchError>;

/// Unified error for all core operations.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Malformed or disallowed input. Surfaced immediately, never retried.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A security rule or privacy constraint blocked the operation.
    #[error("privacy violation: {0}")]
    PrivacyViolation(String),

    /// A rate window (minute/hour/day or burst) was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// The per-query deadline fired. Partial results are discarded.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// A sub-index failed during fan-out.
    #[error("{index} index: {message}")]
    Index { index: IndexSource, message: String },

    /// Invariant violation or corruption. Counted in stats, never mutates
    /// persistent state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SearchError {
    /// The wire-level error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            SearchError::InvalidQuery(_) => "invalid_query",
            SearchError::PrivacyViolation(_) => "privacy_violation",
            SearchError::RateLimit(_) => "rate_limit",
            SearchError::Timeout(_) => "timeout",
            SearchError::Index { .. } | SearchError::Internal(_) => "internal_error",
        }
    }

    /// Stable numeric code for the wire contract.
    pub fn code(&self) -> u16 {
        match self {
            SearchError::InvalidQuery(_) => 1001,
            SearchError::PrivacyViolation(_) => 1002,
            SearchError::RateLimit(_) => 1003,
            SearchError::Timeout(_) => 1004,
            SearchError::Index { .. } => 1005,
            SearchError::Internal(_) => 1000,
        }
    }

    /// Convenience constructor tagging an error with its originating index.
    pub fn index(index: IndexSource, message: impl Into<String>) -> Self {
        SearchError::Index { index, message: message.into() }
    }
}

/// JSON body for boundary errors: `{type, message, code}`.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub message: String,
    pub code: u16,
}

impl From<&SearchError> for ErrorBody {
    fn from(err: &SearchError) -> Self {
        ErrorBody { error_type: err.error_type(), message: err.to_string(), code: err.code() }
    }
}
