// HTTP handlers for the sync/async API
// Thin adapters between axum extractors and RequestService

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use tracing::debug;
use uuid::Uuid;

use super::middleware::RateLimiter;
use super::types::{
    create_error_response, AsyncAckResponse, AsyncWorkRequest, HealthResponse, ListQuery,
    StatsResponse, SystemInfo, WorkRequest, WorkResponse, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};
use crate::config::Environment;
use crate::engine::service::RequestService;
use crate::models::RequestRecord;
use crate::ServiceError;

type ApiResult<T> = std::result::Result<T, ServiceError>;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RequestService>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub environment: Environment,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(service: Arc<RequestService>, environment: Environment) -> Self {
        Self {
            service,
            rate_limiter: None,
            environment,
            started_at: Instant::now(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

fn bad_body(rejection: JsonRejection) -> ServiceError {
    ServiceError::InvalidInput(rejection.body_text())
}

/// Synchronous processing - POST /sync
pub async fn sync_request(
    State(state): State<AppState>,
    payload: Result<Json<WorkRequest>, JsonRejection>,
) -> ApiResult<Json<WorkResponse>> {
    let Json(request) = payload.map_err(bad_body)?;

    let record = state
        .service
        .process_sync(request.data, request.complexity)
        .await?;

    Ok(Json(WorkResponse {
        request_id: record.id,
        result: record.result.unwrap_or(Value::Null),
        processing_time_ms: record.processing_time_ms.unwrap_or_default(),
        timestamp: Utc::now(),
    }))
}

/// Asynchronous processing - POST /async
pub async fn async_request(
    State(state): State<AppState>,
    payload: Result<Json<AsyncWorkRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AsyncAckResponse>)> {
    let Json(request) = payload.map_err(bad_body)?;

    let record = state
        .service
        .accept_async(request.data, request.complexity, request.callback_url)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AsyncAckResponse::accepted(
            record.id,
            record.callback_url.is_some(),
        )),
    ))
}

/// List stored requests - GET /requests
pub async fn list_requests(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<RequestRecord>>> {
    let Query(query) = query.map_err(|e| ServiceError::InvalidInput(e.body_text()))?;

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(ServiceError::InvalidInput(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }
    let offset = query.offset.unwrap_or(0);

    debug!(mode = ?query.mode, limit, offset, "Listing requests");
    let records = state.service.list(query.mode, limit, offset).await?;
    Ok(Json(records))
}

/// Fetch one request - GET /requests/:id
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestRecord>> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ServiceError::InvalidInput(format!("'{id}' is not a valid request id")))?;
    let record = state.service.get(&id).await?;
    Ok(Json(record))
}

/// Health check endpoint - GET /healthz
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Service statistics - GET /stats
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let engine = state.service.stats().await?;

    Ok(Json(StatsResponse {
        engine,
        rate_limiting: state.rate_limiter.as_ref().map(|limiter| limiter.stats()),
        system: SystemInfo {
            environment: state.environment.to_string(),
            uptime_seconds: state.uptime_seconds(),
            timestamp: Utc::now(),
        },
    }))
}

/// Callback receiver for manual testing - POST /test-callback
pub async fn test_callback(Json(payload): Json<Value>) -> Json<Value> {
    let request_id = payload
        .get("request_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    debug!(request_id = %request_id, "Test callback received");
    Json(serde_json::json!({
        "status": "callback_received",
        "payload": payload,
    }))
}

/// Fallback for unknown routes
pub async fn not_found(uri: Uri) -> impl IntoResponse {
    let mut error = create_error_response(
        format!("No route for {}", uri.path()),
        "not_found_error",
        "NOT_FOUND",
    );
    error.path = Some(uri.path().to_string());
    (StatusCode::NOT_FOUND, Json(error))
}
