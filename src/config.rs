// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Provider secrets are injected as environment variables by the deployment
//! (Cloud Run secret bindings) and read once at startup.

use crate::services::plaid::PlaidEnvironment;
use crate::services::webhook_verifier::DEFAULT_MAX_AGE_SECS;
use std::env;

/// Where the ledger lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Firestore,
    /// Process-local; state is lost on restart
    Memory,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Environment Variables (non-sensitive) ---
    /// GCP project ID
    pub gcp_project_id: String,
    /// Server port
    pub port: u16,
    pub ledger_backend: LedgerBackend,
    /// Plaid client ID (public)
    pub plaid_client_id: String,
    pub plaid_environment: PlaidEnvironment,
    /// Bank-link webhooks older than this are rejected
    pub webhook_max_age_secs: i64,

    // --- Secrets ---
    pub plaid_secret: String,
    pub stripe_api_key: String,
    /// Signing secret for processor webhooks
    pub stripe_webhook_secret: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let ledger_backend = match env::var("LEDGER_BACKEND")
            .unwrap_or_else(|_| "firestore".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "firestore" => LedgerBackend::Firestore,
            "memory" => LedgerBackend::Memory,
            _ => return Err(ConfigError::Invalid("LEDGER_BACKEND")),
        };

        let plaid_environment = match env::var("PLAID_ENV") {
            Ok(value) => {
                PlaidEnvironment::parse(&value).ok_or(ConfigError::Invalid("PLAID_ENV"))?
            }
            Err(_) => PlaidEnvironment::Sandbox,
        };

        Ok(Self {
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            ledger_backend,
            plaid_client_id: env::var("PLAID_CLIENT_ID")
                .map_err(|_| ConfigError::Missing("PLAID_CLIENT_ID"))?,
            plaid_environment,
            webhook_max_age_secs: env::var("WEBHOOK_MAX_AGE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_AGE_SECS),

            plaid_secret: env::var("PLAID_SECRET")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("PLAID_SECRET"))?,
            stripe_api_key: env::var("STRIPE_API_KEY")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("STRIPE_API_KEY"))?,
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?,
        })
    }

    /// Deterministic config for tests.
    pub fn test_default() -> Self {
        Self {
            gcp_project_id: "test-project".to_string(),
            port: 8080,
            ledger_backend: LedgerBackend::Memory,
            plaid_client_id: "test_client_id".to_string(),
            plaid_environment: PlaidEnvironment::Sandbox,
            webhook_max_age_secs: DEFAULT_MAX_AGE_SECS,
            plaid_secret: "test_plaid_secret".to_string(),
            stripe_api_key: "sk_test_key".to_string(),
            stripe_webhook_secret: "whsec_test_secret".to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
