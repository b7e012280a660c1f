// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Payment-processor customer and payment method records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The user's customer object at the payment processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    /// Application user ID (also used as document ID)
    pub user_id: String,
    /// Processor customer ID (e.g. `cus_...`)
    pub processor_customer_id: String,
    #[serde(default)]
    pub email: Option<String>,
    /// ID of the payment method currently marked default, if any
    #[serde(default)]
    pub default_payment_method_id: Option<String>,
    #[serde(default)]
    pub bank_last4: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
    /// Processor type of the default payment method
    #[serde(default)]
    pub payment_method_type: Option<String>,
    /// True once a bank account verified by the bank-link provider is the default
    #[serde(default)]
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerRecord {
    /// Forget the default payment method after it was removed.
    pub fn clear_default_payment_method(&mut self) {
        self.default_payment_method_id = None;
        self.bank_last4 = None;
        self.bank_name = None;
        self.payment_method_type = None;
        self.verified = false;
        self.updated_at = Utc::now();
    }
}

/// A chargeable instrument attached to a processor customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodRecord {
    /// Processor payment method ID (also used as document ID)
    pub id: String,
    pub processor_customer_id: String,
    /// Processor object type, e.g. "bank_account"
    pub method_type: String,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}
