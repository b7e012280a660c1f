// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

#![allow(dead_code)]

use ach_payments::config::Config;
use ach_payments::db::{FirestoreLedger, InMemoryLedger};
use ach_payments::models::{
    AccountHealthHint, ChargeOutcome, ChargeParams, ChargeRecord, ChargeRequest, ChargeStatus,
    CustomerRecord, LinkedAccount, PaymentMethodRecord, SagaRun,
};
use ach_payments::ports::{
    BankLinkPort, ExchangedItem, LedgerPort, PaymentProcessorPort, PortError, WebhookKeySource,
    WebhookVerificationKey,
};
use ach_payments::routes::create_router;
use ach_payments::saga::{PaymentOrchestrator, PaymentSaga};
use ach_payments::services::WebhookVerifier;
use ach_payments::AppState;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Check if emulator is available via environment variable.
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Firestore ledger connected to the emulator.
pub async fn test_ledger() -> FirestoreLedger {
    FirestoreLedger::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
}

/// Unique suffix for test isolation against a shared emulator.
pub fn unique_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

pub const USER_ID: &str = "user_1";

pub fn linked_account(user_id: &str) -> LinkedAccount {
    LinkedAccount {
        user_id: user_id.to_string(),
        access_token: format!("access-sandbox-{}", user_id),
        account_id: format!("acc_{}", user_id),
        item_id: format!("item_{}", user_id),
        linked_at: Utc::now(),
    }
}

pub fn charge_request(user_id: &str, amount: i64) -> ChargeRequest {
    ChargeRequest {
        user_id: user_id.to_string(),
        amount,
        currency: "usd".to_string(),
        description: Some("Monthly dues".to_string()),
        email: Some("member@example.com".to_string()),
        customer_id: None,
        payment_method_id: None,
        idempotency_key: None,
    }
}

pub fn new_run(run_id: &str, user_id: &str, intent: &str) -> SagaRun {
    let now = Utc::now();
    SagaRun {
        run_id: run_id.to_string(),
        user_id: user_id.to_string(),
        amount: 1000,
        currency: "usd".to_string(),
        description: None,
        email: None,
        intent: intent.to_string(),
        requested_customer_id: None,
        requested_payment_method_id: None,
        state: ach_payments::models::SagaState::Started,
        failure: None,
        charge_id: None,
        completed: false,
        attempts: 0,
        created_at: now,
        updated_at: now,
    }
}

// ─── Bank link fake ─────────────────────────────────────────────

/// Bank-link provider with accounts held in memory.
#[derive(Default)]
pub struct FakeBankLink {
    accounts: Mutex<HashMap<String, LinkedAccount>>,
    pub resolve_calls: AtomicU32,
    pub mint_calls: AtomicU32,
    pub removed_tokens: Mutex<Vec<String>>,
}

impl FakeBankLink {
    pub fn link(&self, account: LinkedAccount) {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.user_id.clone(), account);
    }

    pub fn mint_count(&self) -> u32 {
        self.mint_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BankLinkPort for FakeBankLink {
    async fn resolve_linked_account(&self, user_id: &str) -> Result<LinkedAccount, PortError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.accounts
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .ok_or_else(|| PortError::NotLinked(user_id.to_string()))
    }

    async fn mint_processor_token(
        &self,
        _access_token: &str,
        account_id: &str,
    ) -> Result<String, PortError> {
        let n = self.mint_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("btok_{}_{}", account_id, n))
    }

    async fn create_link_token(&self, user_id: &str) -> Result<String, PortError> {
        Ok(format!("link-sandbox-{}", user_id))
    }

    async fn exchange_public_token(&self, public_token: &str) -> Result<ExchangedItem, PortError> {
        if public_token == "bad-token" {
            return Err(PortError::Rejected("INVALID_PUBLIC_TOKEN".to_string()));
        }
        Ok(ExchangedItem {
            access_token: format!("access-{}", public_token),
            item_id: format!("item-{}", public_token),
        })
    }

    async fn remove_item(&self, access_token: &str) -> Result<(), PortError> {
        self.removed_tokens
            .lock()
            .unwrap()
            .push(access_token.to_string());
        Ok(())
    }
}

// ─── Processor fake ─────────────────────────────────────────────

/// Payment processor that dedups charges on the idempotency key.
pub struct FakeProcessor {
    customers: Mutex<HashMap<String, CustomerRecord>>,
    methods: Mutex<HashMap<String, PaymentMethodRecord>>,
    charges_by_key: Mutex<HashMap<String, ChargeOutcome>>,
    pub customers_created: AtomicU32,
    pub attach_calls: AtomicU32,
    pub set_default_calls: AtomicU32,
    pub detach_calls: AtomicU32,
    pub charge_calls: AtomicU32,
    pub charge_keys_seen: Mutex<Vec<String>>,
    /// Fail this many upcoming charge calls with a transient error
    pub charge_transient_failures: AtomicU32,
    pub reject_charges: AtomicBool,
    pub charge_status: Mutex<ChargeStatus>,
    /// When set, `retrieve_payment_method` answers with a transient error
    pub retrieve_unavailable: AtomicBool,
    /// When set, `ensure_customer` waits for a permit
    customer_gate: Mutex<Option<Arc<Semaphore>>>,
    /// When set, `charge` waits for a permit
    charge_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for FakeProcessor {
    fn default() -> Self {
        Self {
            customers: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            charges_by_key: Mutex::new(HashMap::new()),
            customers_created: AtomicU32::new(0),
            attach_calls: AtomicU32::new(0),
            set_default_calls: AtomicU32::new(0),
            detach_calls: AtomicU32::new(0),
            charge_calls: AtomicU32::new(0),
            charge_keys_seen: Mutex::new(Vec::new()),
            charge_transient_failures: AtomicU32::new(0),
            reject_charges: AtomicBool::new(false),
            charge_status: Mutex::new(ChargeStatus::Succeeded),
            retrieve_unavailable: AtomicBool::new(false),
            customer_gate: Mutex::new(None),
            charge_gate: Mutex::new(None),
        }
    }
}

impl FakeProcessor {
    /// Number of distinct charges the processor has created.
    pub fn charges_created(&self) -> usize {
        self.charges_by_key.lock().unwrap().len()
    }

    pub fn charge_count(&self) -> u32 {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn attach_count(&self) -> u32 {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn customer_count(&self) -> u32 {
        self.customers_created.load(Ordering::SeqCst)
    }

    pub fn fail_next_charges(&self, n: u32) {
        self.charge_transient_failures.store(n, Ordering::SeqCst);
    }

    /// Register a customer as already existing at the processor.
    pub fn seed_customer(&self, customer: CustomerRecord) {
        self.customers
            .lock()
            .unwrap()
            .insert(customer.user_id.clone(), customer);
    }

    pub fn seed_method(&self, method: PaymentMethodRecord) {
        self.methods
            .lock()
            .unwrap()
            .insert(method.id.clone(), method);
    }

    /// Block `charge` until permits are added to the returned semaphore.
    pub fn gate_charges(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.charge_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Block `ensure_customer` until permits are added to the returned semaphore.
    pub fn gate_customers(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.customer_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl PaymentProcessorPort for FakeProcessor {
    async fn ensure_customer(
        &self,
        user_id: &str,
        email: Option<&str>,
    ) -> Result<CustomerRecord, PortError> {
        let gate = self.customer_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        let mut customers = self.customers.lock().unwrap();
        if let Some(existing) = customers.get(user_id) {
            return Ok(existing.clone());
        }

        let n = self.customers_created.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let customer = CustomerRecord {
            user_id: user_id.to_string(),
            processor_customer_id: format!("cus_{}_{}", user_id, n),
            email: email.map(str::to_string),
            default_payment_method_id: None,
            bank_last4: None,
            bank_name: None,
            payment_method_type: None,
            verified: false,
            created_at: now,
            updated_at: now,
        };
        customers.insert(user_id.to_string(), customer.clone());
        Ok(customer)
    }

    async fn attach_payment_method(
        &self,
        processor_customer_id: &str,
        processor_token: &str,
    ) -> Result<PaymentMethodRecord, PortError> {
        let n = self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let method = PaymentMethodRecord {
            id: format!("ba_{}", n),
            processor_customer_id: processor_customer_id.to_string(),
            method_type: "bank_account".to_string(),
            last4: Some("6789".to_string()),
            bank_name: Some(format!("Bank for {}", processor_token)),
            is_default: false,
            created_at: Utc::now(),
        };
        self.methods
            .lock()
            .unwrap()
            .insert(method.id.clone(), method.clone());
        Ok(method)
    }

    async fn set_default_payment_method(
        &self,
        _processor_customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PortError> {
        self.set_default_calls.fetch_add(1, Ordering::SeqCst);
        if !self.methods.lock().unwrap().contains_key(payment_method_id) {
            return Err(PortError::NotFound(payment_method_id.to_string()));
        }
        Ok(())
    }

    async fn charge(&self, params: &ChargeParams) -> Result<ChargeOutcome, PortError> {
        let gate = self.charge_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        self.charge_keys_seen
            .lock()
            .unwrap()
            .push(params.idempotency_key.clone());

        if self
            .charge_transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PortError::Transient("processor timeout".to_string()));
        }

        if self.reject_charges.load(Ordering::SeqCst) {
            return Err(PortError::Rejected("account_closed".to_string()));
        }

        let status = *self.charge_status.lock().unwrap();
        let mut charges = self.charges_by_key.lock().unwrap();
        let next_id = charges.len();
        let outcome = charges
            .entry(params.idempotency_key.clone())
            .or_insert_with(|| ChargeOutcome {
                processor_charge_id: format!("ch_{}", next_id),
                status,
            })
            .clone();
        Ok(outcome)
    }

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<PaymentMethodRecord, PortError> {
        if self.retrieve_unavailable.load(Ordering::SeqCst) {
            return Err(PortError::Transient("503 Service Unavailable".to_string()));
        }
        self.methods
            .lock()
            .unwrap()
            .get(payment_method_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(payment_method_id.to_string()))
    }

    async fn detach_payment_method(
        &self,
        _processor_customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PortError> {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        self.methods
            .lock()
            .unwrap()
            .remove(payment_method_id)
            .map(|_| ())
            .ok_or_else(|| PortError::NotFound(payment_method_id.to_string()))
    }
}

// ─── Ledger wrapper with failure injection ──────────────────────

/// Ledger that can be told to fail charge status writes.
pub struct FlakyLedger {
    pub inner: Arc<InMemoryLedger>,
    pub fail_charge_updates: AtomicU32,
    pub charge_update_calls: AtomicU32,
}

impl FlakyLedger {
    pub fn new(inner: Arc<InMemoryLedger>) -> Self {
        Self {
            inner,
            fail_charge_updates: AtomicU32::new(0),
            charge_update_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LedgerPort for FlakyLedger {
    async fn get_linked_account(&self, user_id: &str) -> Result<Option<LinkedAccount>, PortError> {
        self.inner.get_linked_account(user_id).await
    }

    async fn put_linked_account(&self, account: &LinkedAccount) -> Result<(), PortError> {
        self.inner.put_linked_account(account).await
    }

    async fn delete_linked_account(&self, user_id: &str) -> Result<bool, PortError> {
        self.inner.delete_linked_account(user_id).await
    }

    async fn get_customer(&self, user_id: &str) -> Result<Option<CustomerRecord>, PortError> {
        self.inner.get_customer(user_id).await
    }

    async fn insert_customer_if_absent(
        &self,
        customer: CustomerRecord,
    ) -> Result<CustomerRecord, PortError> {
        self.inner.insert_customer_if_absent(customer).await
    }

    async fn set_default_payment_method(
        &self,
        user_id: &str,
        method: &PaymentMethodRecord,
    ) -> Result<CustomerRecord, PortError> {
        self.inner.set_default_payment_method(user_id, method).await
    }

    async fn list_payment_methods(
        &self,
        processor_customer_id: &str,
    ) -> Result<Vec<PaymentMethodRecord>, PortError> {
        self.inner.list_payment_methods(processor_customer_id).await
    }

    async fn put_payment_method(&self, method: &PaymentMethodRecord) -> Result<(), PortError> {
        self.inner.put_payment_method(method).await
    }

    async fn delete_payment_method(
        &self,
        user_id: &str,
        payment_method_id: &str,
    ) -> Result<bool, PortError> {
        self.inner
            .delete_payment_method(user_id, payment_method_id)
            .await
    }

    async fn insert_charge_if_absent(
        &self,
        charge: ChargeRecord,
    ) -> Result<ChargeRecord, PortError> {
        self.inner.insert_charge_if_absent(charge).await
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<ChargeRecord>, PortError> {
        self.inner.get_charge(charge_id).await
    }

    async fn find_charge_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ChargeRecord>, PortError> {
        self.inner.find_charge_by_idempotency_key(idempotency_key).await
    }

    async fn find_charge_by_processor_id(
        &self,
        processor_charge_id: &str,
    ) -> Result<Option<ChargeRecord>, PortError> {
        self.inner.find_charge_by_processor_id(processor_charge_id).await
    }

    async fn update_charge_status(
        &self,
        charge_id: &str,
        status: ChargeStatus,
        processor_charge_id: Option<&str>,
    ) -> Result<ChargeRecord, PortError> {
        self.charge_update_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_charge_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PortError::Persistence("ledger unavailable".to_string()));
        }
        self.inner
            .update_charge_status(charge_id, status, processor_charge_id)
            .await
    }

    async fn list_charges(&self) -> Result<Vec<ChargeRecord>, PortError> {
        self.inner.list_charges().await
    }

    async fn save_run(&self, run: &SagaRun) -> Result<(), PortError> {
        self.inner.save_run(run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<SagaRun>, PortError> {
        self.inner.get_run(run_id).await
    }

    async fn list_incomplete_runs(&self) -> Result<Vec<SagaRun>, PortError> {
        self.inner.list_incomplete_runs().await
    }

    async fn record_account_health(&self, hint: &AccountHealthHint) -> Result<(), PortError> {
        self.inner.record_account_health(hint).await
    }

    async fn get_account_health(
        &self,
        item_id: &str,
    ) -> Result<Option<AccountHealthHint>, PortError> {
        self.inner.get_account_health(item_id).await
    }
}

// ─── Webhook signing ────────────────────────────────────────────

/// An ES256 key pair for signing test webhooks.
pub struct TestSigningKey {
    pub kid: String,
    pkcs8: Vec<u8>,
    pub jwk: WebhookVerificationKey,
}

impl TestSigningKey {
    pub fn generate(kid: &str) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .expect("generate P-256 key");
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .expect("parse P-256 key");

        // Uncompressed point: 0x04 || x || y
        let public = pair.public_key().as_ref();
        let jwk = WebhookVerificationKey {
            kid: kid.to_string(),
            alg: "ES256".to_string(),
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(&public[1..33]),
            y: URL_SAFE_NO_PAD.encode(&public[33..65]),
            created_at: Some(Utc::now().timestamp()),
            expired_at: None,
        };

        Self {
            kid: kid.to_string(),
            pkcs8: pkcs8.as_ref().to_vec(),
            jwk,
        }
    }

    /// Sign a verification JWT for `body` issued at `iat`.
    pub fn sign(&self, body: &[u8], iat: i64) -> String {
        self.sign_with_kid(&self.kid, body, iat)
    }

    /// Sign with this key but claim a different key ID.
    pub fn sign_with_kid(&self, kid: &str, body: &[u8], iat: i64) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        let claims = serde_json::json!({
            "iat": iat,
            "request_body_sha256": hex::encode(Sha256::digest(body)),
        });
        encode(&header, &claims, &EncodingKey::from_ec_der(&self.pkcs8)).expect("sign webhook")
    }
}

/// Key source serving a fixed set of keys and counting fetches.
#[derive(Default)]
pub struct FakeKeySource {
    keys: Mutex<HashMap<String, WebhookVerificationKey>>,
    pub fetch_calls: AtomicU32,
    pub requested: Mutex<Vec<Vec<String>>>,
    pub unavailable: AtomicBool,
}

impl FakeKeySource {
    pub fn with_key(key: &WebhookVerificationKey) -> Self {
        let source = Self::default();
        source.publish(key.clone());
        source
    }

    pub fn publish(&self, key: WebhookVerificationKey) {
        self.keys.lock().unwrap().insert(key.kid.clone(), key);
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebhookKeySource for FakeKeySource {
    async fn fetch_verification_keys(
        &self,
        key_ids: &[String],
    ) -> Result<Vec<WebhookVerificationKey>, PortError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(key_ids.to_vec());

        // Give concurrent callers a chance to pile up behind the fetch
        tokio::time::sleep(Duration::from_millis(10)).await;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PortError::Transient("key endpoint down".to_string()));
        }

        let keys = self.keys.lock().unwrap();
        if !keys.contains_key(&key_ids[0]) {
            return Err(PortError::Rejected(format!("unknown key_id {}", key_ids[0])));
        }
        Ok(key_ids.iter().filter_map(|id| keys.get(id).cloned()).collect())
    }
}

// ─── App wiring ─────────────────────────────────────────────────

/// Everything a test needs to drive the app and inspect its collaborators.
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub ledger: Arc<InMemoryLedger>,
    pub bank_link: Arc<FakeBankLink>,
    pub processor: Arc<FakeProcessor>,
    pub key_source: Arc<FakeKeySource>,
    pub signing_key: TestSigningKey,
}

/// Build the saga over fakes sharing `ledger`.
pub fn test_saga(
    bank_link: Arc<FakeBankLink>,
    processor: Arc<FakeProcessor>,
    ledger: Arc<dyn LedgerPort>,
) -> PaymentSaga {
    PaymentSaga::new(bank_link, processor, ledger)
}

/// Create a test app with in-memory ledger and fake providers.
pub fn create_test_app() -> TestApp {
    let config = Config::test_default();
    let ledger = Arc::new(InMemoryLedger::new());
    let bank_link = Arc::new(FakeBankLink::default());
    let processor = Arc::new(FakeProcessor::default());
    let signing_key = TestSigningKey::generate("key_1");
    let key_source = Arc::new(FakeKeySource::with_key(&signing_key.jwk));

    let saga = test_saga(bank_link.clone(), processor.clone(), ledger.clone());
    let orchestrator = PaymentOrchestrator::new(saga, bank_link.clone(), ledger.clone());
    let webhook_verifier = WebhookVerifier::new(key_source.clone(), config.webhook_max_age_secs);

    let state = Arc::new(AppState {
        config,
        ledger: ledger.clone(),
        bank_link: bank_link.clone(),
        processor: processor.clone(),
        orchestrator,
        webhook_verifier,
    });

    TestApp {
        router: create_router(state.clone()),
        state,
        ledger,
        bank_link,
        processor,
        key_source,
        signing_key,
    }
}

/// Wait until the run reaches a terminal state in the ledger.
pub async fn wait_for_completion(ledger: &dyn LedgerPort, run_id: &str) -> SagaRun {
    for _ in 0..500 {
        if let Some(run) = ledger.get_run(run_id).await.unwrap() {
            if run.completed {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} did not complete", run_id);
}
