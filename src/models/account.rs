// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bank-link models: linked accounts and account health hints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user's linked bank account at the bank-link provider.
///
/// At most one per user; re-linking replaces the record wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    /// Application user ID (also used as document ID)
    pub user_id: String,
    /// Provider access token for the linked item
    pub access_token: String,
    /// Provider account ID selected during linking
    pub account_id: String,
    /// Provider item ID
    pub item_id: String,
    pub linked_at: DateTime<Utc>,
}

/// Advisory health signal derived from a bank-link webhook.
///
/// Stored keyed by item ID; the latest hint wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountHealthHint {
    pub item_id: String,
    /// Provider webhook category, e.g. "TRANSACTIONS" or "ITEM"
    pub category: String,
    /// Provider webhook code, e.g. "DEFAULT_UPDATE" or "ERROR"
    pub code: String,
    /// Provider error code carried by ITEM/ERROR events
    #[serde(default)]
    pub error_code: Option<String>,
    pub received_at: DateTime<Utc>,
}
