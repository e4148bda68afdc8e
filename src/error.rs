// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("User {user_id} is not enrolled in course {course_id}")]
    NotEnrolled { user_id: String, course_id: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A stored document that cannot be read as its model. Retrying will
    /// not change it.
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether the failure is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::UpstreamUnavailable(_))
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details, retryable) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None, false),
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token", None, false),
            AppError::Forbidden(msg) => {
                (StatusCode::FORBIDDEN, "forbidden", Some(msg.clone()), false)
            }
            AppError::InvalidArgument(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_argument",
                Some(msg.clone()),
                false,
            ),
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, "not_found", Some(msg.clone()), false)
            }
            AppError::NotEnrolled { .. } => (
                StatusCode::FORBIDDEN,
                "not_enrolled",
                Some(self.to_string()),
                false,
            ),
            AppError::WriteFailed(msg) => {
                tracing::error!(error = %msg, "Write failed after retries");
                (StatusCode::SERVICE_UNAVAILABLE, "write_failed", None, true)
            }
            AppError::UpstreamUnavailable(msg) => {
                tracing::warn!(error = %msg, "Upstream unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "upstream_unavailable",
                    None,
                    true,
                )
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (StatusCode::SERVICE_UNAVAILABLE, "database_error", None, true)
            }
            AppError::MalformedDocument(msg) => {
                tracing::error!(error = %msg, "Malformed document");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "malformed_document",
                    None,
                    false,
                )
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    None,
                    false,
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
            retryable,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
