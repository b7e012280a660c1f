// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use ach_payments::error::AppError;
use ach_payments::ports::PortError;
use ach_payments::saga::TriggerError;
use ach_payments::services::webhook_verifier::VerificationError;
use axum::{http::StatusCode, response::IntoResponse};

fn status(err: AppError) -> StatusCode {
    err.into_response().status()
}

#[test]
fn test_port_errors_map_to_status() {
    assert_eq!(
        status(PortError::NotLinked("user_1".to_string()).into()),
        StatusCode::UNPROCESSABLE_ENTITY
    );
    assert_eq!(
        status(PortError::NotFound("run_1".to_string()).into()),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        status(PortError::Transient("timeout".to_string()).into()),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        status(PortError::Rejected("invalid token".to_string()).into()),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        status(PortError::Persistence("unavailable".to_string()).into()),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_trigger_errors_map_to_status() {
    assert_eq!(
        status(TriggerError::Validation("amount".to_string()).into()),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        status(
            TriggerError::AlreadyInFlight {
                run_id: "run_1".to_string()
            }
            .into()
        ),
        StatusCode::CONFLICT
    );
}

#[test]
fn test_only_key_outage_is_unavailable() {
    assert_eq!(
        status(VerificationError::KeysUnavailable("timeout".to_string()).into()),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        status(VerificationError::BadSignature.into()),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        status(VerificationError::StaleWebhook { age_secs: 301 }.into()),
        StatusCode::UNAUTHORIZED
    );
}
