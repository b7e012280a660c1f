// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore-backed ledger.
//!
//! Provides durable storage for:
//! - Linked bank accounts (keyed by user ID)
//! - Processor customers and payment methods
//! - Charges, plus an idempotency-key index
//! - Saga runs
//! - Account health hints (keyed by item ID)

use crate::db::collections;
use crate::models::{
    AccountHealthHint, ChargeRecord, ChargeStatus, CustomerRecord, LinkedAccount,
    PaymentMethodRecord, SagaRun,
};
use crate::ports::{LedgerPort, PortError};
use async_trait::async_trait;
use firestore::FirestoreWritePrecondition;
use serde::{Deserialize, Serialize};

/// Index document mapping an idempotency key to its charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargeKey {
    charge_id: String,
}

fn db_error(e: impl std::fmt::Display) -> PortError {
    PortError::Persistence(e.to_string())
}

async fn read_doc<T>(
    db: &firestore::FirestoreDb,
    collection: &str,
    id: &str,
) -> Result<Option<T>, PortError>
where
    T: for<'de> Deserialize<'de> + Send,
{
    db.fluent()
        .select()
        .by_id_in(collection)
        .obj()
        .one(id)
        .await
        .map_err(db_error)
}

/// Firestore ledger client.
#[derive(Clone)]
pub struct FirestoreLedger {
    client: Option<firestore::FirestoreDb>,
}

impl FirestoreLedger {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, PortError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| db_error(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, PortError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| db_error(format!("Failed to connect to Firestore Emulator: {}", e)))?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
        })
    }

    /// Create an offline client. Every operation fails with a persistence error.
    pub fn new_mock() -> Self {
        Self { client: None }
    }

    fn get_client(&self) -> Result<&firestore::FirestoreDb, PortError> {
        self.client
            .as_ref()
            .ok_or_else(|| db_error("Database not connected (offline mode)"))
    }

    /// A handle whose reads are part of `transaction`.
    ///
    /// Reads through it register the documents for conflict detection, so a
    /// concurrent writer of the same document aborts one of the commits.
    fn in_transaction(
        &self,
        transaction: &firestore::FirestoreTransaction<'_>,
    ) -> Result<firestore::FirestoreDb, PortError> {
        Ok(self
            .get_client()?
            .clone_with_consistency_selector(firestore::FirestoreConsistencySelector::Transaction(
                transaction.transaction_id().clone(),
            )))
    }

    async fn get_doc<T>(&self, collection: &str, id: &str) -> Result<Option<T>, PortError>
    where
        T: for<'de> Deserialize<'de> + Send,
    {
        read_doc(self.get_client()?, collection, id).await
    }

    async fn put_doc<T>(&self, collection: &str, id: &str, object: &T) -> Result<(), PortError>
    where
        T: Serialize + for<'de> Deserialize<'de> + Send + Sync,
    {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collection)
            .document_id(id)
            .object(object)
            .execute()
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerPort for FirestoreLedger {
    // ─── Linked Account Operations ───────────────────────────────

    async fn get_linked_account(&self, user_id: &str) -> Result<Option<LinkedAccount>, PortError> {
        self.get_doc(collections::LINKED_ACCOUNTS, user_id).await
    }

    async fn put_linked_account(&self, account: &LinkedAccount) -> Result<(), PortError> {
        self.put_doc(collections::LINKED_ACCOUNTS, &account.user_id, account)
            .await
    }

    async fn delete_linked_account(&self, user_id: &str) -> Result<bool, PortError> {
        let existed = self.get_linked_account(user_id).await?.is_some();
        self.get_client()?
            .fluent()
            .delete()
            .from(collections::LINKED_ACCOUNTS)
            .document_id(user_id)
            .execute()
            .await
            .map_err(db_error)?;
        Ok(existed)
    }

    // ─── Customer Operations ─────────────────────────────────────

    async fn get_customer(&self, user_id: &str) -> Result<Option<CustomerRecord>, PortError> {
        self.get_doc(collections::CUSTOMERS, user_id).await
    }

    async fn insert_customer_if_absent(
        &self,
        customer: CustomerRecord,
    ) -> Result<CustomerRecord, PortError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_error(format!("Failed to begin transaction: {}", e)))?;
        let tx_db = self.in_transaction(&transaction)?;

        let existing: Option<CustomerRecord> =
            read_doc(&tx_db, collections::CUSTOMERS, &customer.user_id).await?;

        if let Some(existing) = existing {
            let _ = transaction.rollback().await;
            return Ok(existing);
        }

        client
            .fluent()
            .update()
            .in_col(collections::CUSTOMERS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(&customer.user_id)
            .object(&customer)
            .add_to_transaction(&mut transaction)
            .map_err(|e| db_error(format!("Failed to add customer to transaction: {}", e)))?;

        if let Err(e) = transaction.commit().await {
            // Lost a race with another writer; the winner's record stands
            if let Some(existing) = self.get_customer(&customer.user_id).await? {
                tracing::info!(
                    user_id = %customer.user_id,
                    customer_id = %existing.processor_customer_id,
                    "Customer record created concurrently"
                );
                return Ok(existing);
            }
            return Err(db_error(format!("Transaction commit failed: {}", e)));
        }

        tracing::info!(
            user_id = %customer.user_id,
            customer_id = %customer.processor_customer_id,
            "Customer record created"
        );

        Ok(customer)
    }

    async fn set_default_payment_method(
        &self,
        user_id: &str,
        method: &PaymentMethodRecord,
    ) -> Result<CustomerRecord, PortError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_error(format!("Failed to begin transaction: {}", e)))?;

        let tx_db = self.in_transaction(&transaction)?;

        let customer: Option<CustomerRecord> =
            read_doc(&tx_db, collections::CUSTOMERS, user_id).await?;
        let Some(mut customer) = customer else {
            let _ = transaction.rollback().await;
            return Err(PortError::NotFound(format!("customer for user {}", user_id)));
        };

        // Clear the flag on the method being replaced
        if let Some(previous_id) = customer.default_payment_method_id.as_deref() {
            if previous_id != method.id {
                let previous: Option<PaymentMethodRecord> =
                    read_doc(&tx_db, collections::PAYMENT_METHODS, previous_id).await?;
                if let Some(mut previous) = previous {
                    previous.is_default = false;
                    client
                        .fluent()
                        .update()
                        .in_col(collections::PAYMENT_METHODS)
                        .document_id(&previous.id)
                        .object(&previous)
                        .add_to_transaction(&mut transaction)
                        .map_err(db_error)?;
                }
            }
        }

        let mut method = method.clone();
        method.is_default = true;
        client
            .fluent()
            .update()
            .in_col(collections::PAYMENT_METHODS)
            .document_id(&method.id)
            .object(&method)
            .add_to_transaction(&mut transaction)
            .map_err(db_error)?;

        customer.default_payment_method_id = Some(method.id.clone());
        customer.bank_last4 = method.last4.clone();
        customer.bank_name = method.bank_name.clone();
        customer.payment_method_type = Some(method.method_type.clone());
        customer.verified = true;
        customer.updated_at = chrono::Utc::now();
        client
            .fluent()
            .update()
            .in_col(collections::CUSTOMERS)
            .document_id(user_id)
            .object(&customer)
            .add_to_transaction(&mut transaction)
            .map_err(db_error)?;

        transaction
            .commit()
            .await
            .map_err(|e| db_error(format!("Transaction commit failed: {}", e)))?;

        Ok(customer)
    }

    async fn list_payment_methods(
        &self,
        processor_customer_id: &str,
    ) -> Result<Vec<PaymentMethodRecord>, PortError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::PAYMENT_METHODS)
            .filter(|q| q.for_all([q.field("processor_customer_id").eq(processor_customer_id)]))
            .obj()
            .query()
            .await
            .map_err(db_error)
    }

    async fn put_payment_method(&self, method: &PaymentMethodRecord) -> Result<(), PortError> {
        let method = PaymentMethodRecord {
            is_default: false,
            ..method.clone()
        };
        self.put_doc(collections::PAYMENT_METHODS, &method.id, &method)
            .await
    }

    async fn delete_payment_method(
        &self,
        user_id: &str,
        payment_method_id: &str,
    ) -> Result<bool, PortError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_error(format!("Failed to begin transaction: {}", e)))?;
        let tx_db = self.in_transaction(&transaction)?;

        let method: Option<PaymentMethodRecord> =
            read_doc(&tx_db, collections::PAYMENT_METHODS, payment_method_id).await?;
        let customer: Option<CustomerRecord> =
            read_doc(&tx_db, collections::CUSTOMERS, user_id).await?;

        client
            .fluent()
            .delete()
            .from(collections::PAYMENT_METHODS)
            .document_id(payment_method_id)
            .add_to_transaction(&mut transaction)
            .map_err(db_error)?;

        if let Some(mut customer) = customer {
            if customer.default_payment_method_id.as_deref() == Some(payment_method_id) {
                customer.clear_default_payment_method();
                client
                    .fluent()
                    .update()
                    .in_col(collections::CUSTOMERS)
                    .document_id(user_id)
                    .object(&customer)
                    .add_to_transaction(&mut transaction)
                    .map_err(db_error)?;
            }
        }

        transaction
            .commit()
            .await
            .map_err(|e| db_error(format!("Transaction commit failed: {}", e)))?;

        Ok(method.is_some())
    }

    // ─── Charge Operations ───────────────────────────────────────

    async fn insert_charge_if_absent(
        &self,
        charge: ChargeRecord,
    ) -> Result<ChargeRecord, PortError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_error(format!("Failed to begin transaction: {}", e)))?;
        let tx_db = self.in_transaction(&transaction)?;

        let existing_key: Option<ChargeKey> =
            read_doc(&tx_db, collections::CHARGE_KEYS, &charge.idempotency_key).await?;

        if let Some(key) = existing_key {
            let _ = transaction.rollback().await;
            return self
                .get_charge(&key.charge_id)
                .await?
                .ok_or_else(|| db_error("dangling idempotency key"));
        }

        client
            .fluent()
            .update()
            .in_col(collections::CHARGES)
            .document_id(&charge.id)
            .object(&charge)
            .add_to_transaction(&mut transaction)
            .map_err(db_error)?;

        // The key document is create-only: a second writer for the same key
        // fails the whole commit, charge document included.
        let key = ChargeKey {
            charge_id: charge.id.clone(),
        };
        client
            .fluent()
            .update()
            .in_col(collections::CHARGE_KEYS)
            .precondition(FirestoreWritePrecondition::Exists(false))
            .document_id(&charge.idempotency_key)
            .object(&key)
            .add_to_transaction(&mut transaction)
            .map_err(db_error)?;

        if let Err(e) = transaction.commit().await {
            if let Some(existing) = self
                .find_charge_by_idempotency_key(&charge.idempotency_key)
                .await?
            {
                tracing::info!(
                    charge_id = %existing.id,
                    "Charge for idempotency key created concurrently"
                );
                return Ok(existing);
            }
            return Err(db_error(format!("Transaction commit failed: {}", e)));
        }

        Ok(charge)
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<ChargeRecord>, PortError> {
        self.get_doc(collections::CHARGES, charge_id).await
    }

    async fn find_charge_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ChargeRecord>, PortError> {
        let key: Option<ChargeKey> = self
            .get_doc(collections::CHARGE_KEYS, idempotency_key)
            .await?;
        match key {
            Some(key) => self.get_charge(&key.charge_id).await,
            None => Ok(None),
        }
    }

    async fn find_charge_by_processor_id(
        &self,
        processor_charge_id: &str,
    ) -> Result<Option<ChargeRecord>, PortError> {
        let charges: Vec<ChargeRecord> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::CHARGES)
            .filter(|q| q.for_all([q.field("processor_charge_id").eq(processor_charge_id)]))
            .limit(1)
            .obj()
            .query()
            .await
            .map_err(db_error)?;
        Ok(charges.into_iter().next())
    }

    async fn update_charge_status(
        &self,
        charge_id: &str,
        status: ChargeStatus,
        processor_charge_id: Option<&str>,
    ) -> Result<ChargeRecord, PortError> {
        let client = self.get_client()?;

        let mut transaction = client
            .begin_transaction()
            .await
            .map_err(|e| db_error(format!("Failed to begin transaction: {}", e)))?;

        let tx_db = self.in_transaction(&transaction)?;

        let charge: Option<ChargeRecord> = read_doc(&tx_db, collections::CHARGES, charge_id).await?;
        let Some(mut charge) = charge else {
            let _ = transaction.rollback().await;
            return Err(PortError::NotFound(format!("charge {}", charge_id)));
        };

        if let Some(id) = processor_charge_id {
            charge.processor_charge_id = Some(id.to_string());
        }
        if !charge.status.is_terminal() {
            charge.status = status;
        }
        charge.updated_at = chrono::Utc::now();

        client
            .fluent()
            .update()
            .in_col(collections::CHARGES)
            .document_id(charge_id)
            .object(&charge)
            .add_to_transaction(&mut transaction)
            .map_err(db_error)?;

        transaction
            .commit()
            .await
            .map_err(|e| db_error(format!("Transaction commit failed: {}", e)))?;

        Ok(charge)
    }

    async fn list_charges(&self) -> Result<Vec<ChargeRecord>, PortError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::CHARGES)
            .order_by([("created_at", firestore::FirestoreQueryDirection::Descending)])
            .obj()
            .query()
            .await
            .map_err(db_error)
    }

    // ─── Saga Run Operations ─────────────────────────────────────

    async fn save_run(&self, run: &SagaRun) -> Result<(), PortError> {
        self.put_doc(collections::SAGA_RUNS, &run.run_id, run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<SagaRun>, PortError> {
        self.get_doc(collections::SAGA_RUNS, run_id).await
    }

    async fn list_incomplete_runs(&self) -> Result<Vec<SagaRun>, PortError> {
        self.get_client()?
            .fluent()
            .select()
            .from(collections::SAGA_RUNS)
            .filter(|q| q.for_all([q.field("completed").eq(false)]))
            .obj()
            .query()
            .await
            .map_err(db_error)
    }

    // ─── Account Health Operations ───────────────────────────────

    async fn record_account_health(&self, hint: &AccountHealthHint) -> Result<(), PortError> {
        self.put_doc(collections::ACCOUNT_HEALTH, &hint.item_id, hint)
            .await
    }

    async fn get_account_health(
        &self,
        item_id: &str,
    ) -> Result<Option<AccountHealthHint>, PortError> {
        self.get_doc(collections::ACCOUNT_HEALTH, item_id).await
    }
}
