// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bank-link webhook authentication.
//!
//! Each webhook carries an ES256-signed JWT whose claims bind the issue time and
//! the SHA-256 of the request body. Verification keys are fetched by key ID on
//! first use and cached for the life of the process.

use crate::ports::{PortError, WebhookKeySource, WebhookVerificationKey};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};

/// Header carrying the signed verification JWT.
pub const VERIFICATION_HEADER: &str = "plaid-verification";

/// Webhooks issued longer ago than this are rejected.
pub const DEFAULT_MAX_AGE_SECS: i64 = 300;

/// After a fetch that did not yield the requested key ID, further unknown key
/// IDs are refused without a fetch for this long.
pub const UNKNOWN_KID_REFRESH_INTERVAL_SECS: i64 = 10;

/// Reasons a webhook fails verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("malformed verification token: {0}")]
    MalformedSignature(String),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unknown or expired verification key: {0}")]
    UnknownOrExpiredKey(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("webhook is stale ({age_secs}s old)")]
    StaleWebhook { age_secs: i64 },

    #[error("request body does not match signed digest")]
    BodyMismatch,

    /// The key set could not be fetched; the sender should retry.
    #[error("verification keys unavailable: {0}")]
    KeysUnavailable(String),
}

impl VerificationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VerificationError::KeysUnavailable(_))
    }
}

#[derive(Clone)]
struct CachedKey {
    decoding_key: Arc<DecodingKey>,
    /// Unix seconds; set once the provider reports the key expired
    expires_at: Option<i64>,
}

impl CachedKey {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The JWT header fields we act on, read before any key lookup.
#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

impl TokenHeader {
    fn parse(token: &str) -> Result<Self, VerificationError> {
        let mut segments = token.split('.');
        let (Some(header), Some(_), Some(_), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(VerificationError::MalformedSignature(
                "expected three JWT segments".to_string(),
            ));
        };

        let json = URL_SAFE_NO_PAD.decode(header).map_err(|e| {
            VerificationError::MalformedSignature(format!("invalid JWT header encoding: {e}"))
        })?;
        serde_json::from_slice(&json)
            .map_err(|e| VerificationError::MalformedSignature(format!("invalid JWT header: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct WebhookClaims {
    iat: i64,
    request_body_sha256: String,
}

/// Verifier for bank-link webhooks with a per-key-ID cache.
pub struct WebhookVerifier {
    key_source: Arc<dyn WebhookKeySource>,
    max_age_secs: i64,
    keys: RwLock<HashMap<String, CachedKey>>,
    /// One in-flight fetch per key ID; entries live only while a fetch is pending
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Unix seconds of the last fetch that did not produce the requested key
    last_unknown_refresh: AtomicI64,
}

impl WebhookVerifier {
    pub fn new(key_source: Arc<dyn WebhookKeySource>, max_age_secs: i64) -> Self {
        Self {
            key_source,
            max_age_secs,
            keys: RwLock::new(HashMap::new()),
            refresh_locks: DashMap::new(),
            last_unknown_refresh: AtomicI64::new(i64::MIN),
        }
    }

    /// Verify `token` (the verification header value) against the raw request body.
    pub async fn verify(&self, token: &str, body: &[u8]) -> Result<(), VerificationError> {
        self.verify_at(token, body, chrono::Utc::now().timestamp())
            .await
    }

    /// Verify as of `now` (Unix seconds).
    pub async fn verify_at(
        &self,
        token: &str,
        body: &[u8],
        now: i64,
    ) -> Result<(), VerificationError> {
        let header = TokenHeader::parse(token)?;

        if header.alg != "ES256" {
            return Err(VerificationError::UnsupportedAlgorithm(header.alg));
        }

        let kid = header
            .kid
            .filter(|kid| !kid.trim().is_empty())
            .ok_or_else(|| VerificationError::MalformedSignature("missing JWT kid".to_string()))?;

        let key = self.key_for_kid(&kid, now).await?;
        if key.is_expired(now) {
            tracing::warn!(kid = %kid, "Webhook signed with expired key");
            return Err(VerificationError::UnknownOrExpiredKey(kid));
        }

        let mut validation = Validation::new(Algorithm::ES256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;

        let claims = decode::<WebhookClaims>(token, key.decoding_key.as_ref(), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => VerificationError::BadSignature,
                ErrorKind::InvalidAlgorithm => {
                    VerificationError::UnsupportedAlgorithm("ES256 header mismatch".to_string())
                }
                _ => VerificationError::MalformedSignature(format!("JWT decode failed: {e}")),
            })?
            .claims;

        let age_secs = now - claims.iat;
        if age_secs > self.max_age_secs {
            return Err(VerificationError::StaleWebhook { age_secs });
        }

        let digest = hex::encode(Sha256::digest(body));
        let matches: bool = digest
            .as_bytes()
            .ct_eq(claims.request_body_sha256.as_bytes())
            .into();
        if !matches {
            return Err(VerificationError::BodyMismatch);
        }

        Ok(())
    }

    /// Number of keys currently cached.
    pub async fn cached_key_count(&self) -> usize {
        self.keys.read().await.len()
    }

    /// Number of key IDs with a fetch in progress.
    pub fn pending_refresh_count(&self) -> usize {
        self.refresh_locks.len()
    }

    async fn key_for_kid(&self, kid: &str, now: i64) -> Result<CachedKey, VerificationError> {
        if let Some(key) = self.lookup_cached_key(kid).await {
            return Ok(key);
        }

        let last_miss = self.last_unknown_refresh.load(Ordering::SeqCst);
        if now.saturating_sub(last_miss) < UNKNOWN_KID_REFRESH_INTERVAL_SECS {
            tracing::debug!(kid = %kid, "Unknown kid inside refresh interval; not fetching");
            return Err(VerificationError::UnknownOrExpiredKey(kid.to_string()));
        }

        let lock = self
            .refresh_locks
            .entry(kid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.refresh_if_missing(kid, now).await
        };

        drop(lock);
        self.refresh_locks
            .remove_if(kid, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn refresh_if_missing(&self, kid: &str, now: i64) -> Result<CachedKey, VerificationError> {
        // Another request may have fetched the key while we waited
        if let Some(key) = self.lookup_cached_key(kid).await {
            return Ok(key);
        }

        let refreshed = self.refresh_keys(kid).await;
        let found = match refreshed {
            Ok(()) => self.lookup_cached_key(kid).await,
            Err(VerificationError::UnknownOrExpiredKey(_)) => None,
            Err(e) => return Err(e),
        };

        found.ok_or_else(|| {
            self.last_unknown_refresh.store(now, Ordering::SeqCst);
            VerificationError::UnknownOrExpiredKey(kid.to_string())
        })
    }

    async fn lookup_cached_key(&self, kid: &str) -> Option<CachedKey> {
        self.keys.read().await.get(kid).cloned()
    }

    /// Fetch `kid` plus every cached key not yet known to be expired, and merge the result.
    async fn refresh_keys(&self, kid: &str) -> Result<(), VerificationError> {
        let mut key_ids = vec![kid.to_string()];
        {
            let keys = self.keys.read().await;
            key_ids.extend(
                keys.iter()
                    .filter(|(id, key)| id.as_str() != kid && key.expires_at.is_none())
                    .map(|(id, _)| id.clone()),
            );
        }

        tracing::debug!(kid = %kid, key_count = key_ids.len(), "Fetching webhook verification keys");

        let fetched = self
            .key_source
            .fetch_verification_keys(&key_ids)
            .await
            .map_err(|e| match e {
                PortError::NotFound(_) | PortError::Rejected(_) => {
                    VerificationError::UnknownOrExpiredKey(kid.to_string())
                }
                other => VerificationError::KeysUnavailable(other.to_string()),
            })?;

        let mut keys = self.keys.write().await;
        for jwk in fetched {
            match decoding_key_from_jwk(&jwk) {
                Ok(decoding_key) => {
                    if jwk.expired_at.is_some() {
                        tracing::info!(kid = %jwk.kid, "Webhook verification key marked expired");
                    }
                    keys.insert(
                        jwk.kid.clone(),
                        CachedKey {
                            decoding_key: Arc::new(decoding_key),
                            expires_at: jwk.expired_at,
                        },
                    );
                }
                Err(reason) => {
                    tracing::warn!(kid = %jwk.kid, reason = %reason, "Skipping unusable verification key");
                }
            }
        }

        Ok(())
    }
}

fn decoding_key_from_jwk(jwk: &WebhookVerificationKey) -> Result<DecodingKey, String> {
    if jwk.kty != "EC" || jwk.crv != "P-256" {
        return Err(format!("unexpected key type {}/{}", jwk.kty, jwk.crv));
    }
    if jwk.alg != "ES256" {
        return Err(format!("unexpected key alg {}", jwk.alg));
    }
    DecodingKey::from_ec_components(&jwk.x, &jwk.y).map_err(|e| e.to_string())
}
