// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Payment routes: trigger a run, query status, list charges, cancel.

use crate::error::{AppError, Result};
use crate::models::{ChargeRecord, ChargeRequest, SagaRun, SagaState};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Payment routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payments", post(trigger_payment).get(list_payments))
        .route("/payments/{id}", get(get_payment))
        .route("/payments/{id}/cancel", post(cancel_payment))
}

/// Response to a trigger.
#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct TriggerResponse {
    pub run_id: String,
    pub state: SagaState,
}

/// Start a payment run. Returns once the run is recorded as started.
async fn trigger_payment(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChargeRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>)> {
    let user_id = request.user_id.clone();
    let started = state.orchestrator.trigger(request).await?;

    tracing::info!(user_id = %user_id, run_id = %started.run.run_id, "Payment triggered");

    // The run continues in the background
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            run_id: started.run.run_id,
            state: started.run.state,
        }),
    ))
}

/// Status of a run and/or charge.
#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct PaymentStatusResponse {
    pub run: Option<SagaRun>,
    pub charge: Option<ChargeRecord>,
}

/// Look up a payment by run ID or charge ID.
async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PaymentStatusResponse>> {
    if let Some(run) = state.ledger.get_run(&id).await? {
        let charge = match run.charge_id.as_deref() {
            Some(charge_id) => state.ledger.get_charge(charge_id).await?,
            None => None,
        };
        return Ok(Json(PaymentStatusResponse {
            run: Some(run),
            charge,
        }));
    }

    let charge = state
        .ledger
        .get_charge(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", id)))?;
    let run = state.ledger.get_run(&charge.run_id).await?;

    Ok(Json(PaymentStatusResponse {
        run,
        charge: Some(charge),
    }))
}

/// List all charges, newest first.
async fn list_payments(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ChargeRecord>>> {
    Ok(Json(state.ledger.list_charges().await?))
}

#[derive(Serialize)]
struct CancelResponse {
    run_id: String,
    cancelled: bool,
}

/// Request cancellation of an in-flight run.
async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>)> {
    if !state.orchestrator.cancel(&run_id) {
        return Err(AppError::NotFound(format!(
            "Run {} is not in flight",
            run_id
        )));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            run_id,
            cancelled: true,
        }),
    ))
}
