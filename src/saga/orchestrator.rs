// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Starts, tracks, cancels and resumes payment saga runs.

use super::{CancelFlag, PaymentSaga, SagaError};
use crate::models::{ChargeRecord, ChargeRequest, SagaRun, SagaState};
use crate::ports::{BankLinkPort, LedgerPort, PortError};
use crate::services::RetryPolicy;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use validator::Validate;

/// Reasons a trigger is rejected before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("user {0} has no linked bank account")]
    NotLinked(String),

    /// Another run for the same user has not finished.
    #[error("payment run {run_id} already in flight for user")]
    AlreadyInFlight { run_id: String },

    #[error("failed to persist run: {0}")]
    Persistence(String),
}

/// A run accepted by [`PaymentOrchestrator::trigger`].
pub struct StartedRun {
    pub run: SagaRun,
    /// Resolves when the run reaches a terminal state. Dropping it detaches the run.
    pub task: JoinHandle<Result<ChargeRecord, SagaError>>,
}

struct InFlight {
    run_id: String,
    cancel: CancelFlag,
}

/// Releases a user's in-flight slot when the run's task ends.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, InFlight>>,
    user_id: String,
    run_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.user_id, |_, entry| entry.run_id == self.run_id);
    }
}

/// Entry point for payment runs.
///
/// At most one run is in flight per user within this process.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    saga: Arc<PaymentSaga>,
    bank_link: Arc<dyn BankLinkPort>,
    ledger: Arc<dyn LedgerPort>,
    in_flight: Arc<DashMap<String, InFlight>>,
    recovery_policy: RetryPolicy,
}

impl PaymentOrchestrator {
    pub fn new(
        saga: PaymentSaga,
        bank_link: Arc<dyn BankLinkPort>,
        ledger: Arc<dyn LedgerPort>,
    ) -> Self {
        Self {
            saga: Arc::new(saga),
            bank_link,
            ledger,
            in_flight: Arc::new(DashMap::new()),
            recovery_policy: RetryPolicy::UNBOUNDED,
        }
    }

    /// Validate `request`, persist a new run and start it in the background.
    ///
    /// Returns as soon as the run is recorded in state `Started`.
    pub async fn trigger(&self, request: ChargeRequest) -> Result<StartedRun, TriggerError> {
        request
            .validate()
            .map_err(|e| TriggerError::Validation(e.to_string()))?;

        match self.bank_link.resolve_linked_account(&request.user_id).await {
            Ok(_) => {}
            Err(PortError::NotLinked(user_id)) => return Err(TriggerError::NotLinked(user_id)),
            // The saga's first step retries this
            Err(e) => {
                tracing::warn!(user_id = %request.user_id, error = %e, "Linked account pre-check failed");
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelFlag::new();
        let guard = self.reserve(&request.user_id, &run_id, cancel.clone())?;

        let now = Utc::now();
        let run = SagaRun {
            run_id: run_id.clone(),
            user_id: request.user_id.clone(),
            amount: request.amount,
            currency: request.currency.to_ascii_lowercase(),
            description: request.description,
            email: request.email,
            intent: request.idempotency_key.unwrap_or_else(|| run_id.clone()),
            requested_customer_id: request.customer_id,
            requested_payment_method_id: request.payment_method_id,
            state: SagaState::Started,
            failure: None,
            charge_id: None,
            completed: false,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };

        // Dropping the guard on failure releases the slot
        self.ledger
            .save_run(&run)
            .await
            .map_err(|e| TriggerError::Persistence(e.to_string()))?;

        tracing::info!(
            run_id = %run.run_id,
            user_id = %run.user_id,
            amount = run.amount,
            currency = %run.currency,
            "Payment run started"
        );

        let saga = self.saga.clone();
        let mut task_run = run.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            saga.execute(&mut task_run, &cancel).await
        });

        Ok(StartedRun { run, task })
    }

    /// Request cancellation of a run. Takes effect before its next step.
    ///
    /// Returns `false` if the run is not in flight in this process.
    pub fn cancel(&self, run_id: &str) -> bool {
        let found = self
            .in_flight
            .iter()
            .find(|entry| entry.run_id == run_id)
            .map(|entry| entry.cancel.clone());

        match found {
            Some(cancel) => {
                cancel.cancel();
                tracing::info!(run_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// The run currently in flight for `user_id`, if any.
    pub fn in_flight_run(&self, user_id: &str) -> Option<String> {
        self.in_flight.get(user_id).map(|entry| entry.run_id.clone())
    }

    /// Re-drive every run the ledger holds as incomplete.
    ///
    /// Each run is retried from `Started` under the unbounded policy until it
    /// finishes or fails for a reason a retry cannot fix.
    pub async fn resume_incomplete(&self) -> Result<Vec<StartedRun>, PortError> {
        let runs = self.ledger.list_incomplete_runs().await?;
        let mut resumed = Vec::with_capacity(runs.len());

        for run in runs {
            let cancel = CancelFlag::new();
            let guard = match self.reserve(&run.user_id, &run.run_id, cancel.clone()) {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::warn!(
                        run_id = %run.run_id,
                        user_id = %run.user_id,
                        "Skipping resume; another run for the user is in flight"
                    );
                    continue;
                }
            };

            tracing::info!(
                run_id = %run.run_id,
                user_id = %run.user_id,
                state = %run.state,
                "Resuming incomplete payment run"
            );

            let this = self.clone();
            let mut task_run = run.clone();
            let task = tokio::spawn(async move {
                let _guard = guard;
                this.drive_until_settled(&mut task_run, &cancel).await
            });
            resumed.push(StartedRun { run, task });
        }

        Ok(resumed)
    }

    async fn drive_until_settled(
        &self,
        run: &mut SagaRun,
        cancel: &CancelFlag,
    ) -> Result<ChargeRecord, SagaError> {
        let mut attempt = 1;
        loop {
            match self.saga.execute(run, cancel).await {
                Err(e) if e.is_resumable() && self.recovery_policy.allows_retry_after(attempt) => {
                    let delay = self.recovery_policy.delay_after(attempt);
                    tracing::warn!(
                        run_id = %run.run_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Run failed; re-driving from start"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn reserve(
        &self,
        user_id: &str,
        run_id: &str,
        cancel: CancelFlag,
    ) -> Result<InFlightGuard, TriggerError> {
        match self.in_flight.entry(user_id.to_string()) {
            Entry::Occupied(existing) => {
                tracing::info!(
                    user_id,
                    run_id = %existing.get().run_id,
                    "Rejecting trigger; run already in flight"
                );
                Err(TriggerError::AlreadyInFlight {
                    run_id: existing.get().run_id.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    run_id: run_id.to_string(),
                    cancel,
                });
                Ok(InFlightGuard {
                    in_flight: self.in_flight.clone(),
                    user_id: user_id.to_string(),
                    run_id: run_id.to_string(),
                })
            }
        }
    }
}
