// Request/response bodies for the HTTP API
// Also maps ServiceError onto status codes and the JSON error body

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::middleware::RateLimiterStats;
use crate::engine::service::ServiceStats;
use crate::models::RequestMode;
use crate::ServiceError;

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

fn default_complexity() -> u32 {
    1
}

/// Body of `POST /sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub data: Value,
    #[serde(default = "default_complexity")]
    pub complexity: u32,
}

/// Body of `POST /async`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncWorkRequest {
    pub data: Value,
    #[serde(default = "default_complexity")]
    pub complexity: u32,
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Result of a synchronous request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResponse {
    pub request_id: Uuid,
    pub result: Value,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Immediate acknowledgement of an asynchronous request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncAckResponse {
    pub request_id: Uuid,
    pub status: String,
    pub message: String,
}

impl AsyncAckResponse {
    pub fn accepted(request_id: Uuid, has_callback: bool) -> Self {
        let message = if has_callback {
            "Request accepted for processing. Callback will be sent when complete."
        } else {
            "Request accepted for processing. Poll /requests/{id} for the result."
        };
        Self {
            request_id,
            status: "accepted".to_string(),
            message: message.to_string(),
        }
    }
}

/// Query string of `GET /requests`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub mode: Option<RequestMode>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub environment: String,
    pub uptime_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// Body of `GET /stats`
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub engine: ServiceStats,
    /// Present only when rate limiting is active
    pub rate_limiting: Option<RateLimiterStats>,
    pub system: SystemInfo,
}

/// Error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Seconds until the client may retry (rate limiting only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,

    /// Error category
    #[serde(rename = "type")]
    pub error_type: String,

    /// Machine-readable code
    pub code: String,
}

pub fn create_error_response(message: String, error_type: &str, code: &str) -> ErrorResponse {
    ErrorResponse {
        error: ErrorDetail {
            message,
            error_type: error_type.to_string(),
            code: code.to_string(),
        },
        timestamp: Utc::now(),
        path: None,
        retry_after: None,
    }
}

impl ServiceError {
    /// HTTP status, error type and code for this error
    pub fn classify(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found_error", "NOT_FOUND"),
            ServiceError::InvalidInput(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", "INVALID_INPUT")
            }
            ServiceError::InvalidCallbackUrl(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "INVALID_CALLBACK_URL",
            ),
            ServiceError::Computation(_) => {
                (StatusCode::BAD_REQUEST, "processing_error", "COMPUTATION_ERROR")
            }
            ServiceError::AlreadySubmitted(_) => {
                (StatusCode::CONFLICT, "conflict_error", "ALREADY_SUBMITTED")
            }
            ServiceError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                "QUEUE_FULL",
            ),
            ServiceError::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                "SHUTTING_DOWN",
            ),
            ServiceError::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "RATE_LIMITED",
            ),
            ServiceError::InvalidTransition { .. }
            | ServiceError::Storage(_)
            | ServiceError::Serialization(_)
            | ServiceError::Config(_)
            | ServiceError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "INTERNAL_ERROR",
            ),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = self.classify();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }
        (
            status,
            Json(create_error_response(self.to_string(), error_type, code)),
        )
            .into_response()
    }
}
