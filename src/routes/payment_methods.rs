// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Payment method routes: attach, list and remove a user's bank accounts at the processor.

use crate::error::{AppError, Result};
use crate::models::{CustomerRecord, PaymentMethodRecord};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/payment-methods", post(attach_payment_method))
        .route("/payment-methods/{user_id}", get(list_payment_methods))
        .route(
            "/payment-methods/{user_id}/{payment_method_id}",
            delete(delete_payment_method),
        )
}

async fn customer_for(state: &AppState, user_id: &str) -> Result<CustomerRecord> {
    state
        .ledger
        .get_customer(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No processor customer for user {}", user_id)))
}

#[derive(Debug, Deserialize, Validate)]
struct AttachRequest {
    #[validate(length(min = 1, max = 128))]
    user_id: String,
    #[validate(length(min = 1))]
    processor_token: String,
}

/// Attach a bank account to the user's customer without making it the default.
async fn attach_payment_method(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AttachRequest>,
) -> Result<(StatusCode, Json<PaymentMethodRecord>)> {
    request
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let customer = customer_for(&state, &request.user_id).await?;
    let method = state
        .processor
        .attach_payment_method(&customer.processor_customer_id, &request.processor_token)
        .await?;
    state.ledger.put_payment_method(&method).await?;

    tracing::info!(
        user_id = %request.user_id,
        payment_method_id = %method.id,
        "Payment method attached"
    );

    Ok((StatusCode::CREATED, Json(method)))
}

async fn list_payment_methods(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<PaymentMethodRecord>>> {
    let customer = customer_for(&state, &user_id).await?;
    let mut methods = state
        .ledger
        .list_payment_methods(&customer.processor_customer_id)
        .await?;
    methods.sort_by(|a, b| b.is_default.cmp(&a.is_default).then(a.created_at.cmp(&b.created_at)));
    Ok(Json(methods))
}

/// Detach at the processor, then forget it locally.
///
/// Removing the default leaves the customer without one; the next payment run
/// attaches the linked account again.
async fn delete_payment_method(
    State(state): State<Arc<AppState>>,
    Path((user_id, payment_method_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let customer = customer_for(&state, &user_id).await?;
    let owned = state
        .ledger
        .list_payment_methods(&customer.processor_customer_id)
        .await?
        .iter()
        .any(|m| m.id == payment_method_id);
    if !owned {
        return Err(AppError::NotFound(format!(
            "Payment method {} not found for user {}",
            payment_method_id, user_id
        )));
    }

    state
        .processor
        .detach_payment_method(&customer.processor_customer_id, &payment_method_id)
        .await?;
    state
        .ledger
        .delete_payment_method(&user_id, &payment_method_id)
        .await?;

    tracing::info!(user_id = %user_id, payment_method_id = %payment_method_id, "Payment method removed");

    Ok(StatusCode::NO_CONTENT)
}
