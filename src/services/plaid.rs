// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Plaid API client and the bank-link port built on it.
//!
//! Handles:
//! - Link token creation and public token exchange (account linking)
//! - Stripe bank-account processor tokens
//! - Item removal
//! - Webhook verification key retrieval
//! - Decoding of Plaid webhook payloads

use crate::models::{AccountHealthHint, LinkedAccount};
use crate::ports::{
    BankLinkPort, ExchangedItem, LedgerPort, PortError, WebhookKeySource, WebhookVerificationKey,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_NAME: &str = "ACH Payments";

/// Plaid deployment to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaidEnvironment {
    Sandbox,
    Development,
    Production,
}

impl PlaidEnvironment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Some(Self::Sandbox),
            "development" => Some(Self::Development),
            "production" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn base_url(self) -> &'static str {
        match self {
            Self::Sandbox => "https://sandbox.plaid.com",
            Self::Development => "https://development.plaid.com",
            Self::Production => "https://production.plaid.com",
        }
    }
}

/// Plaid API client.
#[derive(Clone)]
pub struct PlaidClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    secret: String,
}

impl PlaidClient {
    /// Create a new Plaid client with API credentials.
    pub fn new(client_id: String, secret: String, environment: PlaidEnvironment) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: environment.base_url().to_string(),
            client_id,
            secret,
        }
    }

    /// Point the client at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a link token for the Plaid Link flow.
    pub async fn create_link_token(&self, user_id: &str) -> Result<String, PortError> {
        let body = json!({
            "client_name": CLIENT_NAME,
            "language": "en",
            "country_codes": ["US"],
            "products": ["auth"],
            "user": { "client_user_id": user_id },
        });

        let response: LinkTokenResponse = self.post_json("/link/token/create", body).await?;
        Ok(response.link_token)
    }

    /// Exchange a public token for an access token and item ID.
    pub async fn exchange_public_token(&self, public_token: &str) -> Result<ExchangedItem, PortError> {
        let body = json!({ "public_token": public_token });
        let response: ExchangeResponse = self.post_json("/item/public_token/exchange", body).await?;
        Ok(ExchangedItem {
            access_token: response.access_token,
            item_id: response.item_id,
        })
    }

    /// Create a Stripe bank-account token for an account on a linked item.
    pub async fn create_processor_token(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<String, PortError> {
        let body = json!({
            "access_token": access_token,
            "account_id": account_id,
        });

        let response: ProcessorTokenResponse = self
            .post_json("/processor/stripe/bank_account_token/create", body)
            .await?;
        Ok(response.stripe_bank_account_token)
    }

    /// Remove an item, invalidating its access token.
    pub async fn remove_item(&self, access_token: &str) -> Result<(), PortError> {
        let body = json!({ "access_token": access_token });
        let _: Value = self.post_json("/item/remove", body).await?;
        tracing::info!("Plaid item removed");
        Ok(())
    }

    /// Fetch one webhook verification key by key ID.
    pub async fn get_webhook_verification_key(
        &self,
        key_id: &str,
    ) -> Result<WebhookVerificationKey, PortError> {
        let body = json!({ "key_id": key_id });
        let response: VerificationKeyResponse = self
            .post_json("/webhook_verification_key/get", body)
            .await?;
        Ok(response.key)
    }

    /// POST a JSON body with credentials added and parse the JSON response.
    async fn post_json<T: DeserializeOwned>(&self, path: &str, mut body: Value) -> Result<T, PortError> {
        if let Value::Object(map) = &mut body {
            map.insert("client_id".to_string(), Value::String(self.client_id.clone()));
            map.insert("secret".to_string(), Value::String(self.secret.clone()));
        }

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Transient(format!("Plaid request failed: {}", e)))?;

        check_response_json(response).await
    }
}

/// Check response status and parse the JSON body.
async fn check_response_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PortError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| PortError::Transient(format!("Plaid JSON parse error: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<PlaidErrorBody>(&body)
        .map(|e| format!("{}: {}", e.error_code, e.error_message))
        .unwrap_or_else(|_| format!("HTTP {}: {}", status, body));

    if status.as_u16() == 429 {
        tracing::warn!("Plaid rate limit hit (429)");
        return Err(PortError::Transient(detail));
    }

    if status.is_server_error() {
        return Err(PortError::Transient(detail));
    }

    if status.as_u16() == 404 {
        return Err(PortError::NotFound(detail));
    }

    Err(PortError::Rejected(detail))
}

#[async_trait]
impl WebhookKeySource for PlaidClient {
    async fn fetch_verification_keys(
        &self,
        key_ids: &[String],
    ) -> Result<Vec<WebhookVerificationKey>, PortError> {
        let mut keys = Vec::with_capacity(key_ids.len());
        for (i, key_id) in key_ids.iter().enumerate() {
            match self.get_webhook_verification_key(key_id).await {
                Ok(key) => keys.push(key),
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(kid = %key_id, error = %e, "Failed to refresh cached verification key");
                }
            }
        }
        Ok(keys)
    }
}

#[derive(Debug, Deserialize)]
struct LinkTokenResponse {
    link_token: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    item_id: String,
}

#[derive(Debug, Deserialize)]
struct ProcessorTokenResponse {
    stripe_bank_account_token: String,
}

#[derive(Debug, Deserialize)]
struct VerificationKeyResponse {
    key: WebhookVerificationKey,
}

#[derive(Debug, Deserialize)]
struct PlaidErrorBody {
    error_code: String,
    error_message: String,
}

// ─── Bank-link port ───────────────────────────────────────────────

/// `BankLinkPort` backed by Plaid, reading linked accounts from the ledger.
#[derive(Clone)]
pub struct PlaidBankLink {
    client: PlaidClient,
    ledger: Arc<dyn LedgerPort>,
}

impl PlaidBankLink {
    pub fn new(client: PlaidClient, ledger: Arc<dyn LedgerPort>) -> Self {
        Self { client, ledger }
    }
}

#[async_trait]
impl BankLinkPort for PlaidBankLink {
    async fn resolve_linked_account(&self, user_id: &str) -> Result<LinkedAccount, PortError> {
        self.ledger
            .get_linked_account(user_id)
            .await?
            .ok_or_else(|| PortError::NotLinked(user_id.to_string()))
    }

    async fn mint_processor_token(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<String, PortError> {
        self.client
            .create_processor_token(access_token, account_id)
            .await
    }

    async fn create_link_token(&self, user_id: &str) -> Result<String, PortError> {
        self.client.create_link_token(user_id).await
    }

    async fn exchange_public_token(&self, public_token: &str) -> Result<ExchangedItem, PortError> {
        self.client.exchange_public_token(public_token).await
    }

    async fn remove_item(&self, access_token: &str) -> Result<(), PortError> {
        self.client.remove_item(access_token).await
    }
}

// ─── Webhook events ───────────────────────────────────────────────

/// Wire shape of a Plaid webhook body.
#[derive(Debug, Deserialize)]
struct RawBankLinkEvent {
    webhook_type: String,
    webhook_code: String,
    #[serde(default)]
    item_id: Option<String>,
    #[serde(default)]
    error: Option<RawItemError>,
}

#[derive(Debug, Deserialize)]
struct RawItemError {
    #[serde(default)]
    error_code: Option<String>,
}

/// A decoded bank-link webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankLinkEvent {
    /// Any `TRANSACTIONS` webhook (new, updated or removed transactions)
    TransactionsUpdated { item_id: String, code: String },
    /// `ITEM` / `ERROR`: the item needs attention
    ItemError {
        item_id: String,
        error_code: Option<String>,
    },
    /// `ITEM` / `PENDING_EXPIRATION`: consent is about to lapse
    PendingExpiration { item_id: String },
    /// Anything else; acknowledged and ignored
    Unrecognized {
        webhook_type: String,
        webhook_code: String,
    },
}

impl BankLinkEvent {
    /// Decode a raw webhook body.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawBankLinkEvent = serde_json::from_slice(body)?;

        let event = match (raw.webhook_type.as_str(), raw.webhook_code.as_str(), raw.item_id) {
            ("TRANSACTIONS", code, Some(item_id)) => BankLinkEvent::TransactionsUpdated {
                item_id,
                code: code.to_string(),
            },
            ("ITEM", "ERROR", Some(item_id)) => BankLinkEvent::ItemError {
                item_id,
                error_code: raw.error.and_then(|e| e.error_code),
            },
            ("ITEM", "PENDING_EXPIRATION", Some(item_id)) => {
                BankLinkEvent::PendingExpiration { item_id }
            }
            _ => BankLinkEvent::Unrecognized {
                webhook_type: raw.webhook_type,
                webhook_code: raw.webhook_code,
            },
        };
        Ok(event)
    }

    /// Health hint to record for this event, if any.
    pub fn health_hint(&self) -> Option<AccountHealthHint> {
        let now = chrono::Utc::now();
        match self {
            BankLinkEvent::TransactionsUpdated { item_id, code } => Some(AccountHealthHint {
                item_id: item_id.clone(),
                category: "TRANSACTIONS".to_string(),
                code: code.clone(),
                error_code: None,
                received_at: now,
            }),
            BankLinkEvent::ItemError {
                item_id,
                error_code,
            } => Some(AccountHealthHint {
                item_id: item_id.clone(),
                category: "ITEM".to_string(),
                code: "ERROR".to_string(),
                error_code: error_code.clone(),
                received_at: now,
            }),
            BankLinkEvent::PendingExpiration { item_id } => Some(AccountHealthHint {
                item_id: item_id.clone(),
                category: "ITEM".to_string(),
                code: "PENDING_EXPIRATION".to_string(),
                error_code: None,
                received_at: now,
            }),
            BankLinkEvent::Unrecognized { .. } => None,
        }
    }
}
