// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook routes for bank-link and payment processor events.

use crate::error::{AppError, Result};
use crate::models::ChargeStatus;
use crate::services::stripe::{self, ProcessorEvent, DEFAULT_SIGNATURE_TOLERANCE_SECS};
use crate::services::webhook_verifier::{VerificationError, VERIFICATION_HEADER};
use crate::services::BankLinkEvent;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use std::sync::Arc;

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook/bank-link", post(handle_bank_link_event))
        .route("/webhook/processor", post(handle_processor_event))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::Verification(VerificationError::MalformedSignature(format!(
                "missing {} header",
                name
            )))
        })
}

/// Handle a bank-link webhook (POST).
///
/// The body is verified before it is parsed.
async fn handle_bank_link_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let token = header_str(&headers, VERIFICATION_HEADER)?;
    state.webhook_verifier.verify(token, &body).await?;

    let event = BankLinkEvent::decode(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid webhook body: {}", e)))?;

    tracing::info!(event = ?event, "Bank-link webhook received");

    if let Some(hint) = event.health_hint() {
        state.ledger.record_account_health(&hint).await?;
    }

    Ok(StatusCode::OK)
}

/// Handle a payment processor webhook (POST).
async fn handle_processor_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    let signature = header_str(&headers, stripe::SIGNATURE_HEADER)?;
    stripe::verify_webhook_signature(
        &body,
        signature,
        &state.config.stripe_webhook_secret,
        DEFAULT_SIGNATURE_TOLERANCE_SECS,
        chrono::Utc::now().timestamp(),
    )?;

    let event = ProcessorEvent::decode(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid webhook body: {}", e)))?;

    let (data, status) = match event {
        ProcessorEvent::ChargeSucceeded { data } => (data, ChargeStatus::Succeeded),
        ProcessorEvent::ChargeFailed { data } => (data, ChargeStatus::Failed),
        ProcessorEvent::Unrecognized => {
            tracing::debug!("Ignoring unrecognized processor event");
            return Ok(StatusCode::OK);
        }
    };

    let processor_charge_id = data.object.id;
    let Some(charge) = state
        .ledger
        .find_charge_by_processor_id(&processor_charge_id)
        .await?
    else {
        // Not recorded yet; a non-2xx makes the processor redeliver later
        tracing::warn!(
            processor_charge_id = %processor_charge_id,
            "Processor event for unknown charge"
        );
        return Err(AppError::NotFound(format!(
            "charge {}",
            processor_charge_id
        )));
    };

    let updated = state
        .ledger
        .update_charge_status(&charge.id, status, None)
        .await?;

    tracing::info!(
        charge_id = %charge.id,
        processor_charge_id = %processor_charge_id,
        status = updated.status.as_str(),
        failure_code = data.object.failure_code.as_deref().unwrap_or(""),
        "Charge status updated from processor event"
    );

    Ok(StatusCode::OK)
}
