// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Ledger implementations (Firestore and in-memory).

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreLedger;
pub use memory::InMemoryLedger;

/// Collection names as constants.
pub mod collections {
    pub const LINKED_ACCOUNTS: &str = "linked_accounts";
    pub const CUSTOMERS: &str = "customers";
    pub const PAYMENT_METHODS: &str = "payment_methods";
    pub const CHARGES: &str = "charges";
    /// Idempotency key -> charge ID index
    pub const CHARGE_KEYS: &str = "charge_keys";
    pub const SAGA_RUNS: &str = "saga_runs";
    /// Latest health hint per bank-link item
    pub const ACCOUNT_HEALTH: &str = "account_health";
}
