// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Process-local ledger for development and tests.

use crate::models::{
    AccountHealthHint, ChargeRecord, ChargeStatus, CustomerRecord, LinkedAccount,
    PaymentMethodRecord, SagaRun,
};
use crate::ports::{LedgerPort, PortError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory `LedgerPort`.
///
/// Each table is its own map, so operations for different users never contend.
/// Customer read-modify-write is serialized per user.
#[derive(Default)]
pub struct InMemoryLedger {
    linked_accounts: DashMap<String, LinkedAccount>,
    customers: DashMap<String, CustomerRecord>,
    customer_locks: DashMap<String, Arc<Mutex<()>>>,
    payment_methods: DashMap<String, PaymentMethodRecord>,
    charges: DashMap<String, ChargeRecord>,
    /// idempotency key -> charge ID
    charge_keys: DashMap<String, String>,
    runs: DashMap<String, SagaRun>,
    account_health: DashMap<String, AccountHealthHint>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn customer_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.customer_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl LedgerPort for InMemoryLedger {
    async fn get_linked_account(&self, user_id: &str) -> Result<Option<LinkedAccount>, PortError> {
        Ok(self.linked_accounts.get(user_id).map(|a| a.clone()))
    }

    async fn put_linked_account(&self, account: &LinkedAccount) -> Result<(), PortError> {
        self.linked_accounts
            .insert(account.user_id.clone(), account.clone());
        Ok(())
    }

    async fn delete_linked_account(&self, user_id: &str) -> Result<bool, PortError> {
        Ok(self.linked_accounts.remove(user_id).is_some())
    }

    async fn get_customer(&self, user_id: &str) -> Result<Option<CustomerRecord>, PortError> {
        Ok(self.customers.get(user_id).map(|c| c.clone()))
    }

    async fn insert_customer_if_absent(
        &self,
        customer: CustomerRecord,
    ) -> Result<CustomerRecord, PortError> {
        let lock = self.customer_lock(&customer.user_id);
        let _guard = lock.lock().await;

        match self.customers.entry(customer.user_id.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => Ok(slot.insert(customer).clone()),
        }
    }

    async fn set_default_payment_method(
        &self,
        user_id: &str,
        method: &PaymentMethodRecord,
    ) -> Result<CustomerRecord, PortError> {
        let lock = self.customer_lock(user_id);
        let _guard = lock.lock().await;

        let mut customer = self
            .customers
            .get(user_id)
            .map(|c| c.clone())
            .ok_or_else(|| PortError::NotFound(format!("customer for user {}", user_id)))?;

        if let Some(previous) = customer.default_payment_method_id.as_deref() {
            if previous != method.id {
                if let Some(mut old) = self.payment_methods.get_mut(previous) {
                    old.is_default = false;
                }
            }
        }

        let mut method = method.clone();
        method.is_default = true;
        self.payment_methods.insert(method.id.clone(), method.clone());

        customer.default_payment_method_id = Some(method.id);
        customer.bank_last4 = method.last4;
        customer.bank_name = method.bank_name;
        customer.payment_method_type = Some(method.method_type);
        customer.verified = true;
        customer.updated_at = chrono::Utc::now();
        self.customers.insert(user_id.to_string(), customer.clone());

        Ok(customer)
    }

    async fn list_payment_methods(
        &self,
        processor_customer_id: &str,
    ) -> Result<Vec<PaymentMethodRecord>, PortError> {
        Ok(self
            .payment_methods
            .iter()
            .filter(|m| m.processor_customer_id == processor_customer_id)
            .map(|m| m.clone())
            .collect())
    }

    async fn put_payment_method(&self, method: &PaymentMethodRecord) -> Result<(), PortError> {
        self.payment_methods.insert(
            method.id.clone(),
            PaymentMethodRecord {
                is_default: false,
                ..method.clone()
            },
        );
        Ok(())
    }

    async fn delete_payment_method(
        &self,
        user_id: &str,
        payment_method_id: &str,
    ) -> Result<bool, PortError> {
        let lock = self.customer_lock(user_id);
        let _guard = lock.lock().await;

        let removed = self.payment_methods.remove(payment_method_id).is_some();

        if let Some(mut customer) = self.customers.get_mut(user_id) {
            if customer.default_payment_method_id.as_deref() == Some(payment_method_id) {
                customer.clear_default_payment_method();
            }
        }

        Ok(removed)
    }

    async fn insert_charge_if_absent(
        &self,
        charge: ChargeRecord,
    ) -> Result<ChargeRecord, PortError> {
        match self.charge_keys.entry(charge.idempotency_key.clone()) {
            Entry::Occupied(existing) => self
                .charges
                .get(existing.get())
                .map(|c| c.clone())
                .ok_or_else(|| PortError::Persistence("dangling idempotency key".to_string())),
            Entry::Vacant(slot) => {
                // Insert the record before releasing the key slot
                self.charges.insert(charge.id.clone(), charge.clone());
                slot.insert(charge.id.clone());
                Ok(charge)
            }
        }
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<ChargeRecord>, PortError> {
        Ok(self.charges.get(charge_id).map(|c| c.clone()))
    }

    async fn find_charge_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ChargeRecord>, PortError> {
        let Some(charge_id) = self.charge_keys.get(idempotency_key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.charges.get(&charge_id).map(|c| c.clone()))
    }

    async fn find_charge_by_processor_id(
        &self,
        processor_charge_id: &str,
    ) -> Result<Option<ChargeRecord>, PortError> {
        Ok(self
            .charges
            .iter()
            .find(|c| c.processor_charge_id.as_deref() == Some(processor_charge_id))
            .map(|c| c.clone()))
    }

    async fn update_charge_status(
        &self,
        charge_id: &str,
        status: ChargeStatus,
        processor_charge_id: Option<&str>,
    ) -> Result<ChargeRecord, PortError> {
        let mut charge = self
            .charges
            .get_mut(charge_id)
            .ok_or_else(|| PortError::NotFound(format!("charge {}", charge_id)))?;

        if let Some(id) = processor_charge_id {
            charge.processor_charge_id = Some(id.to_string());
        }
        if !charge.status.is_terminal() {
            charge.status = status;
        }
        charge.updated_at = chrono::Utc::now();

        Ok(charge.clone())
    }

    async fn list_charges(&self) -> Result<Vec<ChargeRecord>, PortError> {
        let mut charges: Vec<ChargeRecord> = self.charges.iter().map(|c| c.clone()).collect();
        charges.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(charges)
    }

    async fn save_run(&self, run: &SagaRun) -> Result<(), PortError> {
        self.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<SagaRun>, PortError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn list_incomplete_runs(&self) -> Result<Vec<SagaRun>, PortError> {
        Ok(self
            .runs
            .iter()
            .filter(|r| !r.completed)
            .map(|r| r.clone())
            .collect())
    }

    async fn record_account_health(&self, hint: &AccountHealthHint) -> Result<(), PortError> {
        self.account_health
            .insert(hint.item_id.clone(), hint.clone());
        Ok(())
    }

    async fn get_account_health(
        &self,
        item_id: &str,
    ) -> Result<Option<AccountHealthHint>, PortError> {
        Ok(self.account_health.get(item_id).map(|h| h.clone()))
    }
}
