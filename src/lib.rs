// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! ACH payments: debit a user's linked bank account through a payment processor.
//!
//! This crate provides the backend API that links bank accounts, runs the
//! payment saga for each charge, and ingests provider webhooks.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod ports;
pub mod routes;
pub mod saga;
pub mod services;

use config::Config;
use ports::{BankLinkPort, LedgerPort, PaymentProcessorPort};
use saga::PaymentOrchestrator;
use services::WebhookVerifier;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub ledger: Arc<dyn LedgerPort>,
    pub bank_link: Arc<dyn BankLinkPort>,
    pub processor: Arc<dyn PaymentProcessorPort>,
    pub orchestrator: PaymentOrchestrator,
    pub webhook_verifier: WebhookVerifier,
}
