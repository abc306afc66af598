//! HTTP API handlers - search, recent, stats, health
//
// All endpoints return JSON. Errors map onto status codes: an invalid
// query is the caller's fault (400/422), a saturated pipeline asks the
// caller to shed (503), anything else is ours (500).

use super::AppState;
use crate::ingest::IngestStats;
use crate::record::LogRecord;
use crate::store::{SearchMode, SearchQuery, StoreError};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

/// Gateway-level error with its HTTP mapping.
#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    Unsupported(String),
    Unavailable(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Retryable(msg) => ApiError::Unavailable(msg),
            StoreError::UnsupportedPredicate(expr) => {
                ApiError::Unsupported(format!("unsupported structured-data predicate: {expr}"))
            }
            StoreError::Permanent { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unsupported(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            tracing::error!("api error: {} - {}", status, message);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Wire parameters of the query endpoint; every field optional.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct SearchParams {
    /// Exact record id.
    id: Option<i64>,
    /// Full-text query over the message body.
    q: Option<String>,
    mode: Option<SearchMode>,
    hostname: Option<String>,
    app_name: Option<String>,
    proc_id: Option<String>,
    msg_id: Option<String>,
    facility: Option<u8>,
    severity: Option<u8>,
    min_severity: Option<u8>,
    priority: Option<u8>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    /// Experimental structured-data predicate (`path` or `path=value`).
    sd: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl SearchParams {
    fn into_query(self) -> SearchQuery {
        SearchQuery {
            id: self.id,
            message: self.q,
            mode: self.mode.unwrap_or_default(),
            hostname: self.hostname,
            app_name: self.app_name,
            proc_id: self.proc_id,
            msg_id: self.msg_id,
            facility: self.facility,
            severity: self.severity,
            min_severity: self.min_severity,
            priority: self.priority,
            since: self.since,
            until: self.until,
            structured_data: self.sd,
            limit: self.limit,
            offset: self.offset,
        }
    }

    fn validate(&self) -> Result<(), ApiError> {
        if let Some(facility) = self.facility {
            if facility > 23 {
                return Err(ApiError::BadRequest(format!("facility out of range: {facility}")));
            }
        }
        for (name, value) in [
            ("severity", self.severity),
            ("min_severity", self.min_severity),
        ] {
            if let Some(value) = value {
                if value > 7 {
                    return Err(ApiError::BadRequest(format!("{name} out of range: {value}")));
                }
            }
        }
        Ok(())
    }
}

/// GET /api/logs - filtered, paginated history query.
pub(crate) async fn search_logs(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    params.validate()?;
    let query = params.into_query();
    let records = state.service.search(&query)?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecentParams {
    limit: Option<usize>,
}

/// GET /api/logs/recent - the newest records, newest first.
pub(crate) async fn get_recent(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let records = state.service.get_recent(params.limit.unwrap_or(100))?;
    Ok(Json(records))
}

/// GET /api/stats - pipeline counter snapshot.
pub(crate) async fn get_stats(State(state): State<AppState>) -> Json<IngestStats> {
    Json(state.service.stats())
}

/// GET /api/healthz - liveness plus a store round-trip.
pub(crate) async fn healthz(State(state): State<AppState>) -> Result<Response, ApiError> {
    let records = state.service.store().count()?;
    Ok(Json(json!({ "status": "ok", "records": records })).into_response())
}
