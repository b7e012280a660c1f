// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - provider clients and payment policies.

pub mod idempotency;
pub mod plaid;
pub mod retry;
pub mod stripe;
pub mod webhook_verifier;

pub use idempotency::IdempotencyKeyPolicy;
pub use plaid::{BankLinkEvent, PlaidBankLink, PlaidClient, PlaidEnvironment};
pub use retry::RetryPolicy;
pub use stripe::{ProcessorEvent, StripeClient};
pub use webhook_verifier::{VerificationError, WebhookVerifier};
