//! API error taxonomy for the web boundary.
//!
//! A `thiserror`-derived `ApiError` maps the spec's five error classes to
//! HTTP status codes via `IntoResponse`: validation → 400, unauthorized →
//! 401, not-found → 404, conflict → 409, rate-limited → 429, and
//! database/internal → 500. Storage and config layers use `anyhow`; those
//! errors fold into `Internal` via `From<anyhow::Error>`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Result alias used throughout the web and identity layers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Error classes surfaced at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Invalid request input; surfaced as 400 before any mutation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Authentication/authorization failure; surfaced as 401.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Requested resource does not exist; surfaced as 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness/state conflict; surfaced as 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Request rejected by the rate limiter; surfaced as 429.
    #[error("rate limited")]
    RateLimited,

    /// Transient or infrastructure failure; surfaced as 500 and logged.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// HTTP status for this error class.
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Infra failures are logged at error level; client errors at debug.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
