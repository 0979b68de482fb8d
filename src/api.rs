//! HTTP API handlers for the search server.
//!
//! Routes expose search, ingest, stats, and maintenance as JSON. All
//! endpoints are mounted under `/api/*` by the main server; `/health` sits
//! at the root.

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::engine::SearchEngine;
use crate::error::{ErrorBody, SearchError};
use crate::types::{AttributeValue, FileMetadata, SearchOptions};

/// Axum application state.
#[derive(Clone)]
pub struct AppContext {
    pub engine: Arc<SearchEngine>,
    pub start_time: Instant,
}

/// Map a core error onto an HTTP status and the wire error body.
fn error_response(err: &SearchError) -> (StatusCode, Json<ErrorBody>) {
    let status = match err {
        SearchError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        SearchError::PrivacyViolation(_) => StatusCode::FORBIDDEN,
        SearchError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        SearchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SearchError::Index { .. } | SearchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody::from(err)))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Server status, version, and uptime.
pub async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    let stats = ctx.engine.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "indexed_files": stats.indices.indexed_files,
        "active_sessions": stats.sessions.active_sessions,
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SearchParams {
    q: String,
    privacy_level: Option<u8>,
    session_id: Option<String>,
    max_results: Option<usize>,
    #[serde(rename = "type")]
    query_type: Option<String>,
    user_id: Option<String>,
    #[serde(default)]
    offset: usize,
}

impl From<SearchParams> for (String, SearchOptions) {
    fn from(p: SearchParams) -> Self {
        (
            p.q,
            SearchOptions {
                privacy_level: p.privacy_level,
                session_id: p.session_id,
                max_results: p.max_results,
                query_type: p.query_type,
                user_id: p.user_id,
                offset: p.offset,
            },
        )
    }
}

/// GET /api/search?q=...&privacy_level=...
pub async fn api_search(
    State(ctx): State<AppContext>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let (raw, options): (String, SearchOptions) = params.into();
    match ctx.engine.search(&raw, &options).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => Err(error_response(&err)),
    }
}

/// POST /api/search with the same fields in a JSON body.
pub async fn api_search_post(
    State(ctx): State<AppContext>,
    Json(params): Json<SearchParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let (raw, options): (String, SearchOptions) = params.into();
    match ctx.engine.search(&raw, &options).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => Err(error_response(&err)),
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct IndexRequest {
    file_id: String,
    filename: String,
    directory: String,
    /// Document bytes, UTF-8. Binary ingest goes through the library API.
    content: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    mod_time: Option<DateTime<Utc>>,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    attributes: HashMap<String, AttributeValue>,
}

/// POST /api/index
pub async fn api_index(
    State(ctx): State<AppContext>,
    Json(req): Json<IndexRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let metadata = FileMetadata {
        size: req.size.unwrap_or(req.content.len() as u64),
        mod_time: req.mod_time.unwrap_or_else(Utc::now),
        content_type: req.content_type,
        attributes: req.attributes,
    };
    ctx.engine
        .index_file(&req.file_id, &req.filename, &req.directory, req.content.as_bytes(), &metadata)
        .map_err(|e| error_response(&e))?;
    Ok(Json(serde_json::json!({ "indexed": true, "file_id": req.file_id })))
}

// ---------------------------------------------------------------------------
// Stats, maintenance, sessions
// ---------------------------------------------------------------------------

/// GET /api/stats
pub async fn api_stats(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.engine.stats())
}

/// POST /api/maintenance
pub async fn api_maintenance(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.engine.perform_maintenance())
}

/// DELETE /api/sessions
pub async fn api_sessions_clear(State(ctx): State<AppContext>) -> impl IntoResponse {
    let cleared = ctx.engine.clear_sessions();
    Json(serde_json::json!({ "cleared": cleared }))
}
