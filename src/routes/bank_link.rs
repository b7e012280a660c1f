// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bank-link routes: start linking, complete linking, inspect, unlink.

use crate::error::{AppError, Result};
use crate::models::{AccountHealthHint, LinkedAccount};
use crate::ports::PortError;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;
use validator::Validate;

/// Bank-link routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bank-link/link-token", post(create_link_token))
        .route("/bank-link/exchange", post(exchange_public_token))
        .route("/bank-link/processor-token", post(create_processor_token))
        .route(
            "/bank-link/accounts/{user_id}",
            get(get_linked_account).delete(unlink_account),
        )
}

#[derive(Debug, Deserialize, Validate)]
struct LinkTokenRequest {
    #[validate(length(min = 1, max = 128))]
    user_id: String,
}

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct LinkTokenResponse {
    pub link_token: String,
}

/// Create a link token for the client-side linking flow.
async fn create_link_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LinkTokenRequest>,
) -> Result<Json<LinkTokenResponse>> {
    request
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let link_token = state.bank_link.create_link_token(&request.user_id).await?;
    Ok(Json(LinkTokenResponse { link_token }))
}

#[derive(Debug, Deserialize, Validate)]
struct ExchangeRequest {
    #[validate(length(min = 1, max = 128))]
    user_id: String,
    #[validate(length(min = 1))]
    public_token: String,
    #[validate(length(min = 1))]
    account_id: String,
}

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct ExchangeResponse {
    pub user_id: String,
    pub item_id: String,
    pub account_id: String,
}

/// Complete linking: exchange the public token and store the linked account.
///
/// Replaces any account previously linked by the user.
async fn exchange_public_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>> {
    request
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let item = state
        .bank_link
        .exchange_public_token(&request.public_token)
        .await?;

    let account = LinkedAccount {
        user_id: request.user_id,
        access_token: item.access_token,
        account_id: request.account_id,
        item_id: item.item_id,
        linked_at: chrono::Utc::now(),
    };
    state.ledger.put_linked_account(&account).await?;

    tracing::info!(
        user_id = %account.user_id,
        item_id = %account.item_id,
        "Bank account linked"
    );

    Ok(Json(ExchangeResponse {
        user_id: account.user_id,
        item_id: account.item_id,
        account_id: account.account_id,
    }))
}

/// Linked account as shown to clients; the access token never leaves the service.
#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct LinkedAccountResponse {
    pub user_id: String,
    pub account_id: String,
    pub item_id: String,
    #[cfg_attr(feature = "binding-generation", ts(type = "string"))]
    pub linked_at: chrono::DateTime<chrono::Utc>,
    /// Latest provider health signal for the item, if any
    #[cfg_attr(feature = "binding-generation", ts(skip))]
    pub health: Option<AccountHealthHint>,
}

async fn get_linked_account(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<LinkedAccountResponse>> {
    let account = state
        .ledger
        .get_linked_account(&user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No linked account for user {}", user_id)))?;
    let health = state.ledger.get_account_health(&account.item_id).await?;

    Ok(Json(LinkedAccountResponse {
        user_id: account.user_id,
        account_id: account.account_id,
        item_id: account.item_id,
        linked_at: account.linked_at,
        health,
    }))
}

#[derive(Debug, Deserialize, Validate)]
struct ProcessorTokenRequest {
    #[validate(length(min = 1, max = 128))]
    user_id: String,
}

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct ProcessorTokenResponse {
    pub processor_token: String,
}

/// Mint a processor token for the user's linked account.
async fn create_processor_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessorTokenRequest>,
) -> Result<Json<ProcessorTokenResponse>> {
    request
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let account = state
        .bank_link
        .resolve_linked_account(&request.user_id)
        .await?;
    let processor_token = state
        .bank_link
        .mint_processor_token(&account.access_token, &account.account_id)
        .await?;

    Ok(Json(ProcessorTokenResponse { processor_token }))
}

/// Remove the user's linked account at the provider and in the ledger.
async fn unlink_account(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<StatusCode> {
    let account = state
        .ledger
        .get_linked_account(&user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No linked account for user {}", user_id)))?;

    match state.bank_link.remove_item(&account.access_token).await {
        Ok(()) => {}
        // Already gone at the provider
        Err(PortError::Rejected(msg)) | Err(PortError::NotFound(msg)) => {
            tracing::warn!(user_id = %user_id, error = %msg, "Provider refused item removal; unlinking locally");
        }
        Err(e) => return Err(e.into()),
    }

    state.ledger.delete_linked_account(&user_id).await?;
    tracing::info!(user_id = %user_id, item_id = %account.item_id, "Bank account unlinked");

    Ok(StatusCode::NO_CONTENT)
}
