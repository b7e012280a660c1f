// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Charge records and the charge request accepted from callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;
use validator::Validate;

/// Lifecycle of a charge.
///
/// Transitions only from `Pending` to a terminal state; terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ChargeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChargeStatus::Pending)
    }

    /// Parse a processor-reported charge status.
    pub fn from_processor(status: &str) -> Self {
        match status {
            "succeeded" | "paid" => ChargeStatus::Succeeded,
            "failed" | "canceled" => ChargeStatus::Failed,
            _ => ChargeStatus::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChargeStatus::Pending => "pending",
            ChargeStatus::Succeeded => "succeeded",
            ChargeStatus::Failed => "failed",
        }
    }
}

/// A debit attempt against a user's bank account, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct ChargeRecord {
    /// Internal charge ID (also used as document ID)
    pub id: String,
    pub user_id: String,
    /// Run that created this record
    pub run_id: String,
    /// Amount in minor units
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    pub bank_account_id: String,
    pub bank_item_id: String,
    pub processor_customer_id: String,
    #[serde(default)]
    pub processor_charge_id: Option<String>,
    /// Key sent to the processor; unique across all charges
    pub idempotency_key: String,
    pub status: ChargeStatus,
    #[cfg_attr(feature = "binding-generation", ts(type = "string"))]
    pub created_at: DateTime<Utc>,
    #[cfg_attr(feature = "binding-generation", ts(type = "string"))]
    pub updated_at: DateTime<Utc>,
}

/// Request to start a payment saga.
#[derive(Debug, Clone, Deserialize, Validate)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct ChargeRequest {
    #[validate(length(min = 1, max = 128, message = "user_id is required"))]
    pub user_id: String,
    /// Amount in minor units
    #[validate(range(min = 1, message = "amount must be positive"))]
    pub amount: i64,
    #[validate(length(equal = 3, message = "currency must be an ISO 4217 code"))]
    pub currency: String,
    #[validate(length(max = 500))]
    #[serde(default)]
    pub description: Option<String>,
    #[validate(email)]
    #[serde(default)]
    pub email: Option<String>,
    /// Expected processor customer; must match the ledger if set
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Payment method to charge instead of the current default
    #[serde(default)]
    pub payment_method_id: Option<String>,
    /// Caller-supplied intent; retried requests with the same value charge once
    #[validate(length(min = 1, max = 255))]
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Processor parameters for a single charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeParams {
    pub processor_customer_id: String,
    pub payment_method_id: String,
    pub amount: i64,
    pub currency: String,
    pub description: Option<String>,
    pub idempotency_key: String,
}

/// Processor response to a charge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub processor_charge_id: String,
    pub status: ChargeStatus,
}
