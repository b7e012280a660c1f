// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Payment saga: link account, ensure customer, ensure payment method, charge, record.
//!
//! A run always re-enters from `Started`. Every step is idempotent against the
//! ledger and the processor, so repeating completed steps is a cheap no-op and
//! resumption after a crash never duplicates side effects.

pub mod orchestrator;

pub use orchestrator::{PaymentOrchestrator, StartedRun, TriggerError};

use crate::models::{
    ChargeParams, ChargeRecord, ChargeStatus, CustomerRecord, FailureKind, LinkedAccount,
    PaymentMethodRecord, SagaFailure, SagaRun, SagaState, SagaStep,
};
use crate::ports::{BankLinkPort, LedgerPort, PaymentProcessorPort, PortError};
use crate::services::{IdempotencyKeyPolicy, RetryPolicy};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a run ended, when it did not reach `Recorded`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SagaError {
    #[error("user {user_id} has no linked bank account")]
    NotLinked { user_id: String },

    #[error("invalid request: {0}")]
    Validation(String),

    /// A step failed permanently or exhausted its retries.
    #[error("step {step} failed: {cause}")]
    StepFailed { step: SagaStep, cause: PortError },

    /// The processor charged but the ledger write did not land.
    #[error("charge {charge_id} succeeded at the processor but was not recorded: {cause}")]
    Reconciliation {
        charge_id: String,
        processor_charge_id: String,
        cause: PortError,
    },

    #[error("run cancelled before {step}")]
    Cancelled { step: SagaStep },
}

impl SagaError {
    /// Failure record to persist on the run.
    pub fn failure(&self, step: SagaStep) -> SagaFailure {
        let kind = match self {
            SagaError::NotLinked { .. } => FailureKind::NotLinked,
            SagaError::Validation(_) => FailureKind::Validation,
            SagaError::StepFailed { cause, .. } => match cause {
                PortError::NotLinked(_) => FailureKind::NotLinked,
                PortError::Transient(_) => FailureKind::TransientProvider,
                PortError::Persistence(_) => FailureKind::Persistence,
                PortError::Rejected(_) | PortError::NotFound(_) => FailureKind::Rejected,
            },
            SagaError::Reconciliation { .. } => FailureKind::Reconciliation,
            SagaError::Cancelled { .. } => FailureKind::Cancelled,
        };
        SagaFailure {
            step,
            kind,
            message: self.to_string(),
        }
    }

    /// Whether re-driving the run from `Started` could succeed.
    pub fn is_resumable(&self) -> bool {
        matches!(self, SagaError::StepFailed { cause, .. } if cause.is_retryable())
    }
}

/// Cooperative cancellation flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Values produced by earlier steps of the current pass.
#[derive(Default)]
struct SagaContext {
    account: Option<LinkedAccount>,
    customer: Option<CustomerRecord>,
    payment_method: Option<PaymentMethodRecord>,
    charge: Option<ChargeRecord>,
}

impl SagaContext {
    fn account(&self) -> Result<&LinkedAccount, SagaError> {
        self.account
            .as_ref()
            .ok_or_else(|| SagaError::Validation("linked account not resolved".to_string()))
    }

    fn customer(&self) -> Result<&CustomerRecord, SagaError> {
        self.customer
            .as_ref()
            .ok_or_else(|| SagaError::Validation("customer not ensured".to_string()))
    }

    fn payment_method(&self) -> Result<&PaymentMethodRecord, SagaError> {
        self.payment_method
            .as_ref()
            .ok_or_else(|| SagaError::Validation("payment method not ensured".to_string()))
    }

    fn charge(&self) -> Result<&ChargeRecord, SagaError> {
        self.charge
            .as_ref()
            .ok_or_else(|| SagaError::Validation("charge not created".to_string()))
    }
}

/// Drives a single run through the payment state machine.
pub struct PaymentSaga {
    bank_link: Arc<dyn BankLinkPort>,
    processor: Arc<dyn PaymentProcessorPort>,
    ledger: Arc<dyn LedgerPort>,
    step_policy: RetryPolicy,
}

impl PaymentSaga {
    pub fn new(
        bank_link: Arc<dyn BankLinkPort>,
        processor: Arc<dyn PaymentProcessorPort>,
        ledger: Arc<dyn LedgerPort>,
    ) -> Self {
        Self {
            bank_link,
            processor,
            ledger,
            step_policy: RetryPolicy::THREE_ATTEMPTS,
        }
    }

    /// Drive `run` from `Started` to a terminal state.
    ///
    /// The run is persisted after every transition. On success the recorded
    /// charge is returned.
    pub async fn execute(
        &self,
        run: &mut SagaRun,
        cancel: &CancelFlag,
    ) -> Result<ChargeRecord, SagaError> {
        run.failure = None;
        run.attempts += 1;
        run.transition(SagaState::Started);
        self.persist(run).await?;

        let mut ctx = SagaContext::default();

        while let Some(step) = run.state.next_step() {
            // A processor charge is always followed by its ledger write
            if cancel.is_cancelled() && step != SagaStep::Record {
                tracing::info!(run_id = %run.run_id, step = %step, "Run cancelled between steps");
                let error = SagaError::Cancelled { step };
                run.failure = Some(error.failure(step));
                run.transition(SagaState::Cancelled);
                self.persist(run).await?;
                return Err(error);
            }

            tracing::debug!(run_id = %run.run_id, user_id = %run.user_id, step = %step, "Running saga step");

            let result = match step {
                SagaStep::LinkAccount => self.link_account(run, &mut ctx).await,
                SagaStep::EnsureCustomer => self.ensure_customer(run, &mut ctx).await,
                SagaStep::EnsurePaymentMethod => self.ensure_payment_method(run, &mut ctx).await,
                SagaStep::Charge => self.charge(run, &mut ctx).await,
                SagaStep::Record => self.record(&mut ctx).await,
            };

            if let Err(error) = result {
                if let SagaError::Reconciliation {
                    charge_id,
                    processor_charge_id,
                    cause,
                } = &error
                {
                    tracing::error!(
                        alert = "reconciliation",
                        run_id = %run.run_id,
                        user_id = %run.user_id,
                        charge_id = %charge_id,
                        processor_charge_id = %processor_charge_id,
                        error = %cause,
                        "Processor charge not recorded in ledger"
                    );
                } else {
                    tracing::warn!(
                        run_id = %run.run_id,
                        user_id = %run.user_id,
                        step = %step,
                        error = %error,
                        "Saga step failed"
                    );
                }
                run.fail(error.failure(step));
                // Best effort; the original error is what the caller needs
                if let Err(e) = self.persist(run).await {
                    tracing::error!(run_id = %run.run_id, error = %e, "Failed to persist failed run");
                }
                return Err(error);
            }

            run.transition(step.target_state());
            if let Some(charge) = &ctx.charge {
                run.charge_id = Some(charge.id.clone());
            }
            self.persist(run).await?;
        }

        let charge = ctx.charge.ok_or_else(|| {
            SagaError::Validation("run recorded without a charge".to_string())
        })?;

        tracing::info!(
            run_id = %run.run_id,
            user_id = %run.user_id,
            charge_id = %charge.id,
            status = charge.status.as_str(),
            "Payment saga complete"
        );

        Ok(charge)
    }

    async fn persist(&self, run: &SagaRun) -> Result<(), SagaError> {
        let step = run
            .state
            .next_step()
            .unwrap_or(SagaStep::Record);
        self.step_policy
            .retry("save_run", || self.ledger.save_run(run))
            .await
            .map_err(|cause| SagaError::StepFailed { step, cause })
    }

    /// Step 1: resolve the user's linked bank account.
    async fn link_account(&self, run: &SagaRun, ctx: &mut SagaContext) -> Result<(), SagaError> {
        let account = self
            .step_policy
            .retry("resolve_linked_account", || {
                self.bank_link.resolve_linked_account(&run.user_id)
            })
            .await
            .map_err(|cause| match cause {
                PortError::NotLinked(_) => SagaError::NotLinked {
                    user_id: run.user_id.clone(),
                },
                cause => SagaError::StepFailed {
                    step: SagaStep::LinkAccount,
                    cause,
                },
            })?;

        ctx.account = Some(account);
        Ok(())
    }

    /// Step 2: make sure exactly one processor customer exists for the user.
    async fn ensure_customer(&self, run: &SagaRun, ctx: &mut SagaContext) -> Result<(), SagaError> {
        let step_failed = |cause| SagaError::StepFailed {
            step: SagaStep::EnsureCustomer,
            cause,
        };

        let existing = self
            .step_policy
            .retry("get_customer", || self.ledger.get_customer(&run.user_id))
            .await
            .map_err(step_failed)?;

        let customer = match existing {
            Some(customer) => customer,
            None => {
                let created = self
                    .step_policy
                    .retry("ensure_customer", || {
                        self.processor
                            .ensure_customer(&run.user_id, run.email.as_deref())
                    })
                    .await
                    .map_err(step_failed)?;

                let stored = self
                    .step_policy
                    .retry("insert_customer", || {
                        self.ledger.insert_customer_if_absent(created.clone())
                    })
                    .await
                    .map_err(step_failed)?;

                if stored.processor_customer_id != created.processor_customer_id {
                    tracing::warn!(
                        user_id = %run.user_id,
                        kept = %stored.processor_customer_id,
                        orphaned = %created.processor_customer_id,
                        "Concurrent customer creation; keeping first record"
                    );
                }
                stored
            }
        };

        if let Some(requested) = run.requested_customer_id.as_deref() {
            if requested != customer.processor_customer_id {
                return Err(SagaError::Validation(format!(
                    "customer {} does not belong to user {}",
                    requested, run.user_id
                )));
            }
        }

        ctx.customer = Some(customer);
        Ok(())
    }

    /// Step 3: make sure the customer has a usable default payment method.
    async fn ensure_payment_method(
        &self,
        run: &SagaRun,
        ctx: &mut SagaContext,
    ) -> Result<(), SagaError> {
        let step_failed = |cause| SagaError::StepFailed {
            step: SagaStep::EnsurePaymentMethod,
            cause,
        };
        let customer = ctx.customer()?.clone();
        let candidate = run
            .requested_payment_method_id
            .clone()
            .or_else(|| customer.default_payment_method_id.clone());

        if let Some(candidate) = candidate {
            match self
                .step_policy
                .retry("retrieve_payment_method", || {
                    self.processor.retrieve_payment_method(&candidate)
                })
                .await
            {
                Ok(method) if method.processor_customer_id == customer.processor_customer_id => {
                    let method = if customer.default_payment_method_id.as_deref()
                        == Some(method.id.as_str())
                    {
                        PaymentMethodRecord {
                            is_default: true,
                            ..method
                        }
                    } else {
                        self.make_default(&customer, method).await?
                    };
                    ctx.payment_method = Some(method);
                    return Ok(());
                }
                Ok(method) => {
                    tracing::warn!(
                        payment_method_id = %method.id,
                        customer_id = %customer.processor_customer_id,
                        "Payment method belongs to another customer; attaching a new one"
                    );
                }
                Err(e) => {
                    tracing::info!(
                        payment_method_id = %candidate,
                        error = %e,
                        "Existing payment method unusable; attaching a new one"
                    );
                }
            }
        }

        let account = ctx.account()?.clone();
        let token = self
            .step_policy
            .retry("mint_processor_token", || {
                self.bank_link
                    .mint_processor_token(&account.access_token, &account.account_id)
            })
            .await
            .map_err(step_failed)?;

        let attached = self
            .step_policy
            .retry("attach_payment_method", || {
                self.processor
                    .attach_payment_method(&customer.processor_customer_id, &token)
            })
            .await
            .map_err(step_failed)?;

        tracing::info!(
            customer_id = %customer.processor_customer_id,
            payment_method_id = %attached.id,
            "Attached bank account"
        );

        ctx.payment_method = Some(self.make_default(&customer, attached).await?);
        Ok(())
    }

    /// Set `method` as the only default, at the processor and in the ledger.
    async fn make_default(
        &self,
        customer: &CustomerRecord,
        method: PaymentMethodRecord,
    ) -> Result<PaymentMethodRecord, SagaError> {
        let step_failed = |cause| SagaError::StepFailed {
            step: SagaStep::EnsurePaymentMethod,
            cause,
        };

        self.step_policy
            .retry("set_default_payment_method", || {
                self.processor
                    .set_default_payment_method(&customer.processor_customer_id, &method.id)
            })
            .await
            .map_err(step_failed)?;

        self.step_policy
            .retry("store_default_payment_method", || {
                self.ledger
                    .set_default_payment_method(&customer.user_id, &method)
            })
            .await
            .map_err(step_failed)?;

        Ok(PaymentMethodRecord {
            is_default: true,
            ..method
        })
    }

    /// Step 4: charge once per idempotency key.
    async fn charge(&self, run: &SagaRun, ctx: &mut SagaContext) -> Result<(), SagaError> {
        let step_failed = |cause| SagaError::StepFailed {
            step: SagaStep::Charge,
            cause,
        };
        let customer = ctx.customer()?.clone();
        let account = ctx.account()?.clone();
        let method = ctx.payment_method()?.clone();

        let idempotency_key = IdempotencyKeyPolicy::derive(
            &customer.processor_customer_id,
            run.amount,
            &run.currency,
            &run.intent,
        );

        let now = Utc::now();
        let pending = ChargeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: run.user_id.clone(),
            run_id: run.run_id.clone(),
            amount: run.amount,
            currency: run.currency.to_ascii_lowercase(),
            description: run.description.clone(),
            bank_account_id: account.account_id.clone(),
            bank_item_id: account.item_id.clone(),
            processor_customer_id: customer.processor_customer_id.clone(),
            processor_charge_id: None,
            idempotency_key: idempotency_key.clone(),
            status: ChargeStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let record = self
            .step_policy
            .retry("insert_charge", || {
                self.ledger.insert_charge_if_absent(pending.clone())
            })
            .await
            .map_err(step_failed)?;

        if record.status.is_terminal() {
            tracing::info!(
                run_id = %run.run_id,
                charge_id = %record.id,
                status = record.status.as_str(),
                "Charge already settled for this intent; skipping processor call"
            );
            ctx.charge = Some(record);
            return Ok(());
        }

        let params = ChargeParams {
            processor_customer_id: customer.processor_customer_id.clone(),
            payment_method_id: method.id.clone(),
            amount: run.amount,
            currency: run.currency.to_ascii_lowercase(),
            description: run.description.clone(),
            idempotency_key,
        };

        let outcome = match self
            .step_policy
            .retry("charge", || self.processor.charge(&params))
            .await
        {
            Ok(outcome) => outcome,
            Err(cause @ PortError::Rejected(_)) => {
                // Nothing was charged; close out the pending record
                if let Err(e) = self
                    .ledger
                    .update_charge_status(&record.id, ChargeStatus::Failed, None)
                    .await
                {
                    tracing::warn!(charge_id = %record.id, error = %e, "Failed to mark rejected charge");
                }
                return Err(step_failed(cause));
            }
            Err(cause) => return Err(step_failed(cause)),
        };

        tracing::info!(
            run_id = %run.run_id,
            charge_id = %record.id,
            processor_charge_id = %outcome.processor_charge_id,
            status = outcome.status.as_str(),
            "Processor charge created"
        );

        ctx.charge = Some(ChargeRecord {
            processor_charge_id: Some(outcome.processor_charge_id),
            status: outcome.status,
            ..record
        });
        Ok(())
    }

    /// Step 5: write the processor outcome to the ledger. Never retried.
    async fn record(&self, ctx: &mut SagaContext) -> Result<(), SagaError> {
        let charge = ctx.charge()?.clone();

        let stored = RetryPolicy::NO_RETRY
            .retry("record_charge", || {
                self.ledger.update_charge_status(
                    &charge.id,
                    charge.status,
                    charge.processor_charge_id.as_deref(),
                )
            })
            .await
            .map_err(|cause| SagaError::Reconciliation {
                charge_id: charge.id.clone(),
                processor_charge_id: charge.processor_charge_id.clone().unwrap_or_default(),
                cause,
            })?;

        ctx.charge = Some(stored);
        Ok(())
    }
}
