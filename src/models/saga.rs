// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Persisted saga run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Position of a run in the payment state machine.
///
/// `Recorded`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Started,
    AccountLinked,
    CustomerEnsured,
    PaymentMethodEnsured,
    Charged,
    Recorded,
    Failed,
    Cancelled,
}

impl SagaState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaState::Recorded | SagaState::Failed | SagaState::Cancelled
        )
    }

    /// The step that leaves this state, if any.
    pub fn next_step(self) -> Option<SagaStep> {
        match self {
            SagaState::Started => Some(SagaStep::LinkAccount),
            SagaState::AccountLinked => Some(SagaStep::EnsureCustomer),
            SagaState::CustomerEnsured => Some(SagaStep::EnsurePaymentMethod),
            SagaState::PaymentMethodEnsured => Some(SagaStep::Charge),
            SagaState::Charged => Some(SagaStep::Record),
            SagaState::Recorded | SagaState::Failed | SagaState::Cancelled => None,
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaState::Started => "started",
            SagaState::AccountLinked => "account_linked",
            SagaState::CustomerEnsured => "customer_ensured",
            SagaState::PaymentMethodEnsured => "payment_method_ensured",
            SagaState::Charged => "charged",
            SagaState::Recorded => "recorded",
            SagaState::Failed => "failed",
            SagaState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One of the five saga steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    LinkAccount,
    EnsureCustomer,
    EnsurePaymentMethod,
    Charge,
    Record,
}

impl SagaStep {
    /// State reached when this step succeeds.
    pub fn target_state(self) -> SagaState {
        match self {
            SagaStep::LinkAccount => SagaState::AccountLinked,
            SagaStep::EnsureCustomer => SagaState::CustomerEnsured,
            SagaStep::EnsurePaymentMethod => SagaState::PaymentMethodEnsured,
            SagaStep::Charge => SagaState::Charged,
            SagaStep::Record => SagaState::Recorded,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SagaStep::LinkAccount => "link_account",
            SagaStep::EnsureCustomer => "ensure_customer",
            SagaStep::EnsurePaymentMethod => "ensure_payment_method",
            SagaStep::Charge => "charge",
            SagaStep::Record => "record",
        }
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotLinked,
    TransientProvider,
    Rejected,
    Validation,
    Persistence,
    Reconciliation,
    Cancelled,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct SagaFailure {
    pub step: SagaStep,
    pub kind: FailureKind,
    pub message: String,
}

/// A single payment saga run, persisted after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct SagaRun {
    /// Run ID (also used as document ID)
    pub run_id: String,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Caller-supplied idempotency key, or the run ID when none was given
    pub intent: String,
    #[serde(default)]
    pub requested_customer_id: Option<String>,
    #[serde(default)]
    pub requested_payment_method_id: Option<String>,
    pub state: SagaState,
    #[serde(default)]
    pub failure: Option<SagaFailure>,
    #[serde(default)]
    pub charge_id: Option<String>,
    /// True once `state` is terminal (indexed for crash recovery)
    pub completed: bool,
    /// Number of times the run has been driven from `Started`
    pub attempts: u32,
    #[cfg_attr(feature = "binding-generation", ts(type = "string"))]
    pub created_at: DateTime<Utc>,
    #[cfg_attr(feature = "binding-generation", ts(type = "string"))]
    pub updated_at: DateTime<Utc>,
}

impl SagaRun {
    /// Move to `state`, keeping `completed` and `updated_at` in step.
    pub fn transition(&mut self, state: SagaState) {
        self.state = state;
        self.completed = state.is_terminal();
        self.updated_at = Utc::now();
    }

    /// Record a failure at `step`.
    pub fn fail(&mut self, failure: SagaFailure) {
        self.failure = Some(failure);
        self.transition(SagaState::Failed);
    }
}
