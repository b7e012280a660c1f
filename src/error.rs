// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use crate::ports::PortError;
use crate::saga::TriggerError;
use crate::services::webhook_verifier::VerificationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("No linked bank account for user {0}")]
    NotLinked(String),

    /// A payment run for the user is already in flight
    #[error("Payment already in progress: {0}")]
    Conflict(String),

    #[error("Webhook verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Upstream provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<PortError> for AppError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::NotLinked(user_id) => AppError::NotLinked(user_id),
            PortError::NotFound(what) => AppError::NotFound(what),
            PortError::Transient(msg) | PortError::Rejected(msg) => AppError::Provider(msg),
            PortError::Persistence(msg) => AppError::Database(msg),
        }
    }
}

impl From<TriggerError> for AppError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::Validation(msg) => AppError::BadRequest(msg),
            TriggerError::NotLinked(user_id) => AppError::NotLinked(user_id),
            TriggerError::AlreadyInFlight { run_id } => AppError::Conflict(run_id),
            TriggerError::Persistence(msg) => AppError::Database(msg),
        }
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone()))
            }
            AppError::NotLinked(user_id) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "not_linked",
                Some(user_id.clone()),
            ),
            AppError::Conflict(run_id) => {
                (StatusCode::CONFLICT, "run_in_flight", Some(run_id.clone()))
            }
            AppError::Verification(err) => {
                tracing::warn!(error = %err, "Webhook rejected");
                if err.is_transient() {
                    (StatusCode::SERVICE_UNAVAILABLE, "verification_unavailable", None)
                } else {
                    (StatusCode::UNAUTHORIZED, "verification_failed", None)
                }
            }
            AppError::Provider(msg) => {
                (StatusCode::BAD_GATEWAY, "provider_error", Some(msg.clone()))
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
