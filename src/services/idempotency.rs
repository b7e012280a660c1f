// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Deterministic idempotency keys for processor requests.

use sha2::{Digest, Sha256};

const KEY_PREFIX: &str = "achchg_";
const CUSTOMER_KEY_PREFIX: &str = "customer-";

/// Derives the key sent with every charge request.
///
/// The key is a pure function of the charge's identity, so any retry or
/// re-entry of the same charge intent reuses it.
pub struct IdempotencyKeyPolicy;

impl IdempotencyKeyPolicy {
    /// Derive the key for charging `amount` minor units of `currency` to
    /// `processor_customer_id` on behalf of `intent`.
    ///
    /// Fields are length-prefixed before hashing so no two distinct inputs
    /// share an encoding. Currency is case-normalized.
    pub fn derive(processor_customer_id: &str, amount: i64, currency: &str, intent: &str) -> String {
        let currency = currency.to_ascii_lowercase();
        let amount = amount.to_string();

        let mut hasher = Sha256::new();
        for field in [processor_customer_id, amount.as_str(), currency.as_str(), intent] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }

        format!("{}{}", KEY_PREFIX, hex::encode(hasher.finalize()))
    }

    /// Key for creating the processor customer of `user_id`.
    ///
    /// One per user, so concurrent first runs create a single customer.
    pub fn customer(user_id: &str) -> String {
        format!("{}{}", CUSTOMER_KEY_PREFIX, user_id)
    }
}
