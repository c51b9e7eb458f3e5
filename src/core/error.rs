//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps the
//! various failure sources and converts into the OpenAI-style error envelope
//! `{"error":{"message":…,"type":…}}` expected by clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error type strings surfaced at the client boundary.
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_SERVICE_UNAVAILABLE: &str = "service_unavailable";
pub const ERROR_TYPE_BAD_GATEWAY: &str = "bad_gateway";
pub const ERROR_TYPE_API: &str = "api_error";

/// Main error type for the application.
///
/// Internal dispatch kinds ([`AppError::GroupNotFound`],
/// [`AppError::ModelIndexOutOfBounds`], [`AppError::NoKeysAvailable`]) are
/// mapped to the client-visible surface here; they never leak their internal
/// wording unchanged into a 5xx.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or unrecognized administrator token
    #[error("Unauthorized")]
    Unauthorized,

    /// IP-level rate limit exceeded
    #[error("Too many requests")]
    RateLimited,

    /// Malformed JSON or invalid routing token
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Routing token named a group that does not exist in the snapshot
    #[error("model group '{0}' not found")]
    GroupNotFound(String),

    /// Pin index was parseable but past the end of the group's model list
    #[error("model index {index} out of bounds for group '{group}'")]
    ModelIndexOutOfBounds { group: String, index: usize },

    /// No model in the group has any configured credential
    #[error("no models in group '{0}' have API keys configured")]
    NoKeysAvailable(String),

    /// Every credential of every candidate model is cooling down or dead
    #[error("all keys for group '{0}' are in cooldown or dead")]
    AllKeysUnavailable(String),

    /// Retry budget exhausted with only network failures
    #[error("all models unavailable after {attempts} attempts")]
    AllAttemptsFailed { attempts: usize },

    /// HTTP transport errors from the reqwest client
    #[error("upstream request error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Repository errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Credential decrypt failure (logged, credential skipped)
    #[error("decrypt failed: {0}")]
    DecryptFailed(String),

    /// Adapter could not convert the request for the upstream family
    #[error("adapter conversion failed: {0}")]
    AdapterConversionFailed(String),

    /// Generic internal errors with custom message
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Client-visible `(status, type)` pair for this error.
    fn surface(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, ERROR_TYPE_AUTHENTICATION),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, ERROR_TYPE_RATE_LIMIT),
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, ERROR_TYPE_INVALID_REQUEST),
            AppError::GroupNotFound(_) => (StatusCode::NOT_FOUND, ERROR_TYPE_INVALID_REQUEST),
            AppError::ModelIndexOutOfBounds { .. } => {
                (StatusCode::BAD_REQUEST, ERROR_TYPE_INVALID_REQUEST)
            }
            AppError::NoKeysAvailable(_) | AppError::AllKeysUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ERROR_TYPE_SERVICE_UNAVAILABLE,
            ),
            AppError::AllAttemptsFailed { .. } | AppError::Upstream(_) => {
                (StatusCode::BAD_GATEWAY, ERROR_TYPE_BAD_GATEWAY)
            }
            AppError::Serialization(_) => (StatusCode::BAD_REQUEST, ERROR_TYPE_INVALID_REQUEST),
            AppError::Database(_)
            | AppError::DecryptFailed(_)
            | AppError::AdapterConversionFailed(_)
            | AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_API),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.surface();

        if status.is_server_error() {
            tracing::error!(error = %self, status = %status, "request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for handler results.
pub type Result<T> = std::result::Result<T, AppError>;
