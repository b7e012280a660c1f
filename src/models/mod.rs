// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod account;
pub mod charge;
pub mod customer;
pub mod saga;

pub use account::{AccountHealthHint, LinkedAccount};
pub use charge::{ChargeOutcome, ChargeParams, ChargeRecord, ChargeRequest, ChargeStatus};
pub use customer::{CustomerRecord, PaymentMethodRecord};
pub use saga::{FailureKind, SagaFailure, SagaRun, SagaState, SagaStep};
