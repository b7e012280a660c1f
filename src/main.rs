// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! ACH Payments API Server
//!
//! Links users' bank accounts and debits them through the payment processor,
//! one saga run per charge.

use ach_payments::{
    config::{Config, LedgerBackend},
    db::{FirestoreLedger, InMemoryLedger},
    ports::{BankLinkPort, LedgerPort, PaymentProcessorPort, WebhookKeySource},
    saga::{PaymentOrchestrator, PaymentSaga},
    services::{PlaidBankLink, PlaidClient, StripeClient, WebhookVerifier},
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(port = config.port, "Starting ACH Payments API");

    let ledger: Arc<dyn LedgerPort> = match config.ledger_backend {
        LedgerBackend::Firestore => Arc::new(
            FirestoreLedger::new(&config.gcp_project_id)
                .await
                .expect("Failed to connect to Firestore"),
        ),
        LedgerBackend::Memory => {
            tracing::warn!("Using in-memory ledger; state will not survive restarts");
            Arc::new(InMemoryLedger::new())
        }
    };

    let plaid = PlaidClient::new(
        config.plaid_client_id.clone(),
        config.plaid_secret.clone(),
        config.plaid_environment,
    );
    tracing::info!(environment = ?config.plaid_environment, "Plaid client initialized");

    let key_source: Arc<dyn WebhookKeySource> = Arc::new(plaid.clone());
    let bank_link: Arc<dyn BankLinkPort> = Arc::new(PlaidBankLink::new(plaid, ledger.clone()));
    let processor: Arc<dyn PaymentProcessorPort> =
        Arc::new(StripeClient::new(config.stripe_api_key.clone()));

    let saga = PaymentSaga::new(bank_link.clone(), processor.clone(), ledger.clone());
    let orchestrator = PaymentOrchestrator::new(saga, bank_link.clone(), ledger.clone());

    // Pick up runs interrupted by a previous shutdown
    match orchestrator.resume_incomplete().await {
        Ok(resumed) => tracing::info!(count = resumed.len(), "Incomplete payment runs resumed"),
        Err(e) => tracing::error!(error = %e, "Failed to list incomplete payment runs"),
    }

    let webhook_verifier = WebhookVerifier::new(key_source, config.webhook_max_age_secs);

    // Build shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        ledger,
        bank_link,
        processor,
        orchestrator,
        webhook_verifier,
    });

    // Build router
    let app = ach_payments::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ach_payments=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
