//! HTTP surface over the orchestrator and cache.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use utoipa::{IntoParams, ToSchema};

use crate::batch::{BatchCoordinator, BatchReport};
use crate::cache::{CacheEntry, CacheStats};
use crate::config::Config;
use crate::error::{EngineFailureSummary, ExtractionError};
use crate::identity::BusinessIdentity;
use crate::orchestrator::{ExtractRequest, Extraction, Orchestrator};

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub batch: BatchCoordinator,
    pub config: Config,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: Config) -> Self {
        Self {
            batch: BatchCoordinator::new(orchestrator.clone(), config.max_concurrent_sessions),
            orchestrator,
            config,
        }
    }

    fn request(&self, force_refresh: Option<bool>, include_reviews: Option<bool>, max_reviews: Option<usize>) -> ExtractRequest {
        ExtractRequest {
            force_refresh: force_refresh.unwrap_or(false),
            include_reviews: include_reviews.unwrap_or(self.config.include_reviews),
            max_reviews: max_reviews.unwrap_or(self.config.max_reviews),
            timeout: self.config.engine_timeout,
            ..ExtractRequest::default()
        }
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExtractBody {
    /// Free-text business query or a maps URL
    pub query: String,
    pub force_refresh: Option<bool>,
    pub include_reviews: Option<bool>,
    pub max_reviews: Option<usize>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchBody {
    pub queries: Vec<String>,
    pub force_refresh: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EntryParams {
    /// Identity key such as `cid:6132208262146062126`
    pub key: String,
    pub max_age_hours: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SweepBody {
    pub older_than_days: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SweepResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub engines: Vec<EngineFailureSummary>,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Exhausted(ExtractionError),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(error) => (StatusCode::BAD_REQUEST, ErrorResponse { error, engines: Vec::new() }),
            ApiError::NotFound(error) => (StatusCode::NOT_FOUND, ErrorResponse { error, engines: Vec::new() }),
            ApiError::Exhausted(e) => (
                StatusCode::BAD_GATEWAY,
                ErrorResponse { error: e.to_string(), engines: e.engine_summaries() },
            ),
            ApiError::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse { error, engines: Vec::new() }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ExtractionError> for ApiError {
    fn from(e: ExtractionError) -> Self {
        match e {
            ExtractionError::EmptyQuery => ApiError::BadRequest(e.to_string()),
            other => ApiError::Exhausted(other),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[utoipa::path(
    post,
    path = "/extract",
    request_body = ExtractBody,
    responses(
        (status = 200, description = "Business extracted", body = Extraction),
        (status = 400, description = "Empty query", body = ErrorResponse),
        (status = 502, description = "Every engine failed", body = ErrorResponse)
    ),
    tag = "extraction"
)]
pub async fn extract(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExtractBody>,
) -> Result<Json<Extraction>, ApiError> {
    info!(query = %body.query, "📥 extract request");
    let request = state.request(body.force_refresh, body.include_reviews, body.max_reviews);
    let extraction = state.orchestrator.extract(&body.query, &request).await?;
    Ok(Json(extraction))
}

#[utoipa::path(
    post,
    path = "/batch",
    request_body = BatchBody,
    responses(
        (status = 200, description = "Per-query results in input order", body = BatchReport),
        (status = 400, description = "No queries", body = ErrorResponse)
    ),
    tag = "extraction"
)]
pub async fn batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchBody>,
) -> Result<Json<BatchReport>, ApiError> {
    if body.queries.is_empty() {
        return Err(ApiError::BadRequest("queries must not be empty".to_string()));
    }
    let request = state.request(body.force_refresh, None, None);
    Ok(Json(state.batch.run(body.queries, request).await))
}

#[utoipa::path(
    get,
    path = "/cache/stats",
    responses((status = 200, description = "Cache statistics", body = CacheStats)),
    tag = "cache"
)]
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<CacheStats>, ApiError> {
    state.orchestrator.cache().stats().await.map(Json).map_err(|e| {
        error!(error = %e, "stats query failed");
        ApiError::Internal(e.to_string())
    })
}

#[utoipa::path(
    get,
    path = "/cache/entry",
    params(EntryParams),
    responses(
        (status = 200, description = "Fresh cache entry", body = CacheEntry),
        (status = 400, description = "Malformed key", body = ErrorResponse),
        (status = 404, description = "Absent or stale", body = ErrorResponse)
    ),
    tag = "cache"
)]
pub async fn cache_entry(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EntryParams>,
) -> Result<Json<CacheEntry>, ApiError> {
    let identity: BusinessIdentity = params.key.parse().map_err(ApiError::BadRequest)?;
    let max_age = params
        .max_age_hours
        .map(|h| Duration::from_secs(h.saturating_mul(3600)))
        .unwrap_or(state.config.cache_max_age);

    match state.orchestrator.cache().get(&identity, max_age).await {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err(ApiError::NotFound(format!("no fresh entry for {}", identity))),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

#[utoipa::path(
    post,
    path = "/cache/sweep",
    request_body = SweepBody,
    responses((status = 200, description = "Entries deleted", body = SweepResponse)),
    tag = "cache"
)]
pub async fn cache_sweep(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SweepBody>,
) -> Result<Json<SweepResponse>, ApiError> {
    let max_age = Duration::from_secs(body.older_than_days.saturating_mul(24 * 3600));
    let deleted = state
        .orchestrator
        .cache()
        .sweep(max_age)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(SweepResponse { deleted }))
}
