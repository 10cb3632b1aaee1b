//! Error types for RustRead
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! Background tasks never surface these to a caller; they only log them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Coarse error category, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Transport,
    Conflict,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Transport => "transport",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Application-wide error type
///
/// Every operation surfaces one of these. The first five variants form the
/// federation taxonomy; the rest are infrastructure failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Actor, post, key or local user absent (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed envelope or missing required field (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote fetch or delivery failure (502)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Duplicate key on insert (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Signature absent or invalid (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Transport(_) => ErrorKind::Transport,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Whether a sqlx error is a UNIQUE / PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error kind to a status code and a JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let kind = self.kind();
        let (status, error_message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Transport(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, kind = kind.as_str(), "Request rejected");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[kind.as_str()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
