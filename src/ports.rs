// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Boundaries between the saga and the outside world.
//!
//! The saga only talks to the bank-link provider, the payment processor and
//! durable storage through these traits, so tests can substitute in-process fakes.

use crate::models::{
    AccountHealthHint, ChargeOutcome, ChargeParams, ChargeRecord, ChargeStatus, CustomerRecord,
    LinkedAccount, PaymentMethodRecord, SagaRun,
};
use async_trait::async_trait;
use serde::Deserialize;

/// Errors returned by port implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// The user has no linked bank account.
    #[error("no linked bank account for user {0}")]
    NotLinked(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, timeout, 5xx or rate limit at a provider.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider refused the request; retrying the same request will not help.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    /// Durable storage was unavailable or a write did not commit.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl PortError {
    /// Whether the failure may clear up on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::Transient(_) | PortError::Persistence(_))
    }
}

/// Result of exchanging a bank-link public token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangedItem {
    pub access_token: String,
    pub item_id: String,
}

/// Bank-link provider operations.
#[async_trait]
pub trait BankLinkPort: Send + Sync {
    /// Look up the user's linked account. Fails with `NotLinked` if there is none.
    async fn resolve_linked_account(&self, user_id: &str) -> Result<LinkedAccount, PortError>;

    /// Mint a single-use token the payment processor accepts as a bank account source.
    async fn mint_processor_token(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<String, PortError>;

    /// Create a link token for the client-side linking flow.
    async fn create_link_token(&self, user_id: &str) -> Result<String, PortError>;

    /// Exchange a public token from the linking flow for long-lived credentials.
    async fn exchange_public_token(&self, public_token: &str) -> Result<ExchangedItem, PortError>;

    /// Revoke the item at the provider.
    async fn remove_item(&self, access_token: &str) -> Result<(), PortError>;
}

/// Payment processor operations.
#[async_trait]
pub trait PaymentProcessorPort: Send + Sync {
    /// Find or create the processor customer for `user_id`.
    ///
    /// Implementations must not create a second customer for a user that already has one.
    async fn ensure_customer(
        &self,
        user_id: &str,
        email: Option<&str>,
    ) -> Result<CustomerRecord, PortError>;

    /// Attach the bank account identified by `processor_token` to a customer.
    async fn attach_payment_method(
        &self,
        processor_customer_id: &str,
        processor_token: &str,
    ) -> Result<PaymentMethodRecord, PortError>;

    async fn set_default_payment_method(
        &self,
        processor_customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PortError>;

    /// Create a charge. Two calls with the same idempotency key produce one charge.
    async fn charge(&self, params: &ChargeParams) -> Result<ChargeOutcome, PortError>;

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<PaymentMethodRecord, PortError>;

    /// Remove a payment method from the customer it is attached to.
    async fn detach_payment_method(
        &self,
        processor_customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PortError>;
}

/// Durable storage for everything the saga owns.
#[async_trait]
pub trait LedgerPort: Send + Sync {
    // ─── Linked accounts ───────────────────────────────────────────

    async fn get_linked_account(&self, user_id: &str) -> Result<Option<LinkedAccount>, PortError>;

    /// Store a linked account, replacing any existing one for the user.
    async fn put_linked_account(&self, account: &LinkedAccount) -> Result<(), PortError>;

    /// Returns `true` if a record was removed.
    async fn delete_linked_account(&self, user_id: &str) -> Result<bool, PortError>;

    // ─── Customers ────────────────────────────────────────────────

    async fn get_customer(&self, user_id: &str) -> Result<Option<CustomerRecord>, PortError>;

    /// Atomically insert `customer` unless the user already has one.
    ///
    /// Returns whichever record is stored afterwards.
    async fn insert_customer_if_absent(
        &self,
        customer: CustomerRecord,
    ) -> Result<CustomerRecord, PortError>;

    /// Atomically store `method` as the user's only default payment method.
    async fn set_default_payment_method(
        &self,
        user_id: &str,
        method: &PaymentMethodRecord,
    ) -> Result<CustomerRecord, PortError>;

    async fn list_payment_methods(
        &self,
        processor_customer_id: &str,
    ) -> Result<Vec<PaymentMethodRecord>, PortError>;

    /// Store a non-default payment method.
    async fn put_payment_method(&self, method: &PaymentMethodRecord) -> Result<(), PortError>;

    /// Remove a payment method of `user_id`'s customer, clearing the customer's
    /// default if it pointed at it. Returns `true` if a record was removed.
    async fn delete_payment_method(
        &self,
        user_id: &str,
        payment_method_id: &str,
    ) -> Result<bool, PortError>;

    // ─── Charges ──────────────────────────────────────────────────

    /// Atomically insert `charge` unless its idempotency key is already recorded.
    ///
    /// Returns whichever record is stored for the key afterwards.
    async fn insert_charge_if_absent(&self, charge: ChargeRecord)
        -> Result<ChargeRecord, PortError>;

    async fn get_charge(&self, charge_id: &str) -> Result<Option<ChargeRecord>, PortError>;

    async fn find_charge_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ChargeRecord>, PortError>;

    async fn find_charge_by_processor_id(
        &self,
        processor_charge_id: &str,
    ) -> Result<Option<ChargeRecord>, PortError>;

    /// Move a charge to `status`. A terminal status is never overwritten.
    async fn update_charge_status(
        &self,
        charge_id: &str,
        status: ChargeStatus,
        processor_charge_id: Option<&str>,
    ) -> Result<ChargeRecord, PortError>;

    async fn list_charges(&self) -> Result<Vec<ChargeRecord>, PortError>;

    // ─── Saga runs ────────────────────────────────────────────────

    async fn save_run(&self, run: &SagaRun) -> Result<(), PortError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<SagaRun>, PortError>;

    /// Runs whose state is not terminal.
    async fn list_incomplete_runs(&self) -> Result<Vec<SagaRun>, PortError>;

    // ─── Account health ───────────────────────────────────────────

    async fn record_account_health(&self, hint: &AccountHealthHint) -> Result<(), PortError>;

    async fn get_account_health(
        &self,
        item_id: &str,
    ) -> Result<Option<AccountHealthHint>, PortError>;
}

/// A webhook verification key as published by the bank-link provider (JWK form).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebhookVerificationKey {
    pub kid: String,
    pub alg: String,
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    /// Unix seconds after which the key must no longer be trusted
    #[serde(default)]
    pub expired_at: Option<i64>,
}

/// Source of bank-link webhook verification keys.
#[async_trait]
pub trait WebhookKeySource: Send + Sync {
    /// Fetch keys for `key_ids`. Counts as one upstream fetch regardless of length.
    ///
    /// The first ID is the one being verified; a failure to fetch it is an error.
    async fn fetch_verification_keys(
        &self,
        key_ids: &[String],
    ) -> Result<Vec<WebhookVerificationKey>, PortError>;
}
