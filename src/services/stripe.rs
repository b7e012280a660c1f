// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Stripe API client implementing the payment processor port.
//!
//! Also verifies `Stripe-Signature` headers and decodes webhook events.

use crate::models::{
    ChargeOutcome, ChargeParams, ChargeStatus, CustomerRecord, PaymentMethodRecord,
};
use crate::ports::{PaymentProcessorPort, PortError};
use crate::services::webhook_verifier::VerificationError;
use crate::services::IdempotencyKeyPolicy;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Header carrying the processor webhook signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Default tolerance between the signed timestamp and now.
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Stripe API client.
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl StripeClient {
    pub fn new(api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: "https://api.stripe.com/v1".to_string(),
            api_key,
        }
    }

    /// Point the client at a different API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn find_customer_by_user(&self, user_id: &str) -> Result<Option<StripeCustomer>, PortError> {
        let query = format!("metadata['user_id']:'{}'", user_id.replace('\'', "\\'"));
        let url = format!("{}/customers/search", self.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("query", query.as_str()), ("limit", "1")])
            .send()
            .await
            .map_err(|e| PortError::Transient(format!("Stripe request failed: {}", e)))?;

        let list: StripeList<StripeCustomer> = check_response_json(response).await?;
        Ok(list.data.into_iter().next())
    }

    /// Send a form-encoded request and parse the JSON response.
    async fn send_form<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, PortError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.api_key);

        if !form.is_empty() {
            request = request.form(form);
        }
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PortError::Transient(format!("Stripe request failed: {}", e)))?;

        check_response_json(response).await
    }
}

/// Check response status and parse the JSON body.
async fn check_response_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PortError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| PortError::Transient(format!("Stripe JSON parse error: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<StripeErrorResponse>(&body)
        .map(|e| {
            format!(
                "{}: {}",
                e.error.code.as_deref().unwrap_or(&e.error.error_type),
                e.error.message.unwrap_or_default()
            )
        })
        .unwrap_or_else(|_| format!("HTTP {}: {}", status, body));

    match status.as_u16() {
        429 => {
            tracing::warn!("Stripe rate limit hit (429)");
            Err(PortError::Transient(detail))
        }
        // Concurrent request with the same idempotency key still in progress
        409 => Err(PortError::Transient(detail)),
        404 => Err(PortError::NotFound(detail)),
        s if s >= 500 => Err(PortError::Transient(detail)),
        _ => Err(PortError::Rejected(detail)),
    }
}

#[async_trait]
impl PaymentProcessorPort for StripeClient {
    async fn ensure_customer(
        &self,
        user_id: &str,
        email: Option<&str>,
    ) -> Result<CustomerRecord, PortError> {
        let customer = match self.find_customer_by_user(user_id).await? {
            Some(existing) => {
                tracing::debug!(user_id, customer_id = %existing.id, "Found existing Stripe customer");
                existing
            }
            None => {
                let mut form = vec![("metadata[user_id]", user_id.to_string())];
                if let Some(email) = email {
                    form.push(("email", email.to_string()));
                }
                let idempotency_key = IdempotencyKeyPolicy::customer(user_id);
                let created: StripeCustomer = self
                    .send_form(Method::POST, "/customers", &form, Some(&idempotency_key))
                    .await?;
                tracing::info!(user_id, customer_id = %created.id, "Created Stripe customer");
                created
            }
        };

        let now = Utc::now();
        Ok(CustomerRecord {
            user_id: user_id.to_string(),
            processor_customer_id: customer.id,
            email: customer.email.or_else(|| email.map(str::to_string)),
            default_payment_method_id: customer.default_source,
            bank_last4: None,
            bank_name: None,
            payment_method_type: None,
            verified: false,
            created_at: now,
            updated_at: now,
        })
    }

    async fn attach_payment_method(
        &self,
        processor_customer_id: &str,
        processor_token: &str,
    ) -> Result<PaymentMethodRecord, PortError> {
        let path = format!("/customers/{}/sources", processor_customer_id);
        let form = [("source", processor_token.to_string())];
        let source: StripeBankAccount = self.send_form(Method::POST, &path, &form, None).await?;

        Ok(PaymentMethodRecord {
            id: source.id,
            processor_customer_id: processor_customer_id.to_string(),
            method_type: source.object,
            last4: source.last4,
            bank_name: source.bank_name,
            is_default: false,
            created_at: Utc::now(),
        })
    }

    async fn set_default_payment_method(
        &self,
        processor_customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PortError> {
        let path = format!("/customers/{}", processor_customer_id);
        let form = [("default_source", payment_method_id.to_string())];
        let _: StripeCustomer = self.send_form(Method::POST, &path, &form, None).await?;
        Ok(())
    }

    async fn charge(&self, params: &ChargeParams) -> Result<ChargeOutcome, PortError> {
        let mut form = vec![
            ("amount", params.amount.to_string()),
            ("currency", params.currency.to_ascii_lowercase()),
            ("customer", params.processor_customer_id.clone()),
            ("source", params.payment_method_id.clone()),
        ];
        if let Some(description) = &params.description {
            form.push(("description", description.clone()));
        }

        let charge: StripeCharge = self
            .send_form(Method::POST, "/charges", &form, Some(&params.idempotency_key))
            .await?;

        Ok(ChargeOutcome {
            processor_charge_id: charge.id,
            status: ChargeStatus::from_processor(&charge.status),
        })
    }

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> Result<PaymentMethodRecord, PortError> {
        let path = format!("/payment_methods/{}", payment_method_id);
        let method: StripePaymentMethod = self.send_form(Method::GET, &path, &[], None).await?;

        let customer = method
            .customer
            .ok_or_else(|| PortError::NotFound(format!("{} is not attached", payment_method_id)))?;
        let bank = method.us_bank_account.unwrap_or_default();

        Ok(PaymentMethodRecord {
            id: method.id,
            processor_customer_id: customer,
            method_type: method.method_type,
            last4: bank.last4,
            bank_name: bank.bank_name,
            is_default: false,
            created_at: Utc::now(),
        })
    }

    async fn detach_payment_method(
        &self,
        processor_customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), PortError> {
        let path = format!(
            "/customers/{}/sources/{}",
            processor_customer_id, payment_method_id
        );
        let deleted: StripeDeleted = self.send_form(Method::DELETE, &path, &[], None).await?;
        tracing::info!(
            customer_id = processor_customer_id,
            payment_method_id = %deleted.id,
            "Detached payment method"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    default_source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeBankAccount {
    id: String,
    object: String,
    #[serde(default)]
    last4: Option<String>,
    #[serde(default)]
    bank_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeDeleted {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeCharge {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethod {
    id: String,
    #[serde(rename = "type")]
    method_type: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    us_bank_account: Option<StripeBankDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct StripeBankDetails {
    #[serde(default)]
    last4: Option<String>,
    #[serde(default)]
    bank_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ─── Webhooks ─────────────────────────────────────────────────────

/// Verify a `Stripe-Signature` header (`t=...,v1=...[,v1=...]`) as of `now`.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), VerificationError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", ts)) => timestamp = ts.parse().ok(),
            Some(("v1", sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        VerificationError::MalformedSignature("missing signature timestamp".to_string())
    })?;
    if signatures.is_empty() {
        return Err(VerificationError::MalformedSignature(
            "missing v1 signature".to_string(),
        ));
    }

    let expected = compute_signature(secret, timestamp, payload)?;
    let valid = signatures.iter().any(|sig| {
        hex::decode(sig)
            .map(|sig| bool::from(sig.as_slice().ct_eq(expected.as_slice())))
            .unwrap_or(false)
    });
    if !valid {
        return Err(VerificationError::BadSignature);
    }

    let age_secs = now - timestamp;
    if age_secs.abs() > tolerance_secs {
        return Err(VerificationError::StaleWebhook { age_secs });
    }

    Ok(())
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`.
pub fn compute_signature(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<Vec<u8>, VerificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| VerificationError::MalformedSignature(format!("invalid secret: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Charge object carried by `charge.*` events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChargeEventData {
    pub object: ChargeObject,
}

/// A decoded processor webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ProcessorEvent {
    #[serde(rename = "charge.succeeded")]
    ChargeSucceeded { data: ChargeEventData },
    #[serde(rename = "charge.failed")]
    ChargeFailed { data: ChargeEventData },
    #[serde(other)]
    Unrecognized,
}

impl ProcessorEvent {
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}
