// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Exponential back-off retry policies for port calls.

use crate::ports::PortError;
use std::future::Future;
use std::time::Duration;

/// Back-off schedule for retrying a failed operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// `None` retries until the operation succeeds or fails permanently.
    pub maximum_attempts: Option<u32>,
}

impl RetryPolicy {
    /// A single attempt.
    pub const NO_RETRY: Self = Self {
        initial_interval: Duration::from_secs(1),
        backoff_coefficient: 2.0,
        maximum_interval: Duration::from_secs(100),
        maximum_attempts: Some(1),
    };

    /// Policy for individual saga steps.
    pub const THREE_ATTEMPTS: Self = Self {
        initial_interval: Duration::from_secs(1),
        backoff_coefficient: 2.0,
        maximum_interval: Duration::from_secs(60),
        maximum_attempts: Some(3),
    };

    /// Policy for re-driving a whole run after a crash or exhausted step.
    pub const UNBOUNDED: Self = Self {
        initial_interval: Duration::from_secs(1),
        backoff_coefficient: 2.0,
        maximum_interval: Duration::from_secs(100),
        maximum_attempts: None,
    };

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let cap = self.maximum_interval.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.maximum_interval;
        }
        Duration::from_secs_f64(secs)
    }

    /// Whether another attempt may follow the given (1-based) attempt.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        self.maximum_attempts.is_none_or(|max| attempt < max)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts are exhausted.
    ///
    /// Only errors with [`PortError::is_retryable`] are retried. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, PortError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PortError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.allows_retry_after(attempt) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(operation, attempt, error = %e, "Retry attempts exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
