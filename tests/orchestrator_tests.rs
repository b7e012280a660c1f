// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Orchestrator tests: triggering, per-user exclusivity, cancellation, resume.

use ach_payments::models::{ChargeStatus, SagaState, SagaStep};
use ach_payments::ports::LedgerPort;
use ach_payments::saga::{SagaError, TriggerError};
use std::sync::atomic::Ordering;
use std::time::Duration;

mod common;

use common::{charge_request, create_test_app, linked_account, new_run, USER_ID};

#[tokio::test]
async fn test_trigger_persists_started_run_and_completes() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));

    let started = app
        .state
        .orchestrator
        .trigger(charge_request(USER_ID, 2500))
        .await
        .unwrap();

    assert_eq!(started.run.state, SagaState::Started);
    assert_eq!(started.run.amount, 2500);
    assert!(app
        .ledger
        .get_run(&started.run.run_id)
        .await
        .unwrap()
        .is_some());

    let charge = started.task.await.unwrap().unwrap();
    assert_eq!(charge.status, ChargeStatus::Succeeded);
    assert_eq!(charge.run_id, started.run.run_id);

    let run = app
        .ledger
        .get_run(&started.run.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, SagaState::Recorded);
    assert!(run.completed);

    // Slot released once the task finishes
    assert!(app.state.orchestrator.in_flight_run(USER_ID).is_none());
}

#[tokio::test]
async fn test_second_trigger_for_same_user_is_rejected() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));
    let gate = app.processor.gate_charges();

    let first = app
        .state
        .orchestrator
        .trigger(charge_request(USER_ID, 1000))
        .await
        .unwrap();

    let second = app
        .state
        .orchestrator
        .trigger(charge_request(USER_ID, 1000))
        .await;

    match second {
        Err(TriggerError::AlreadyInFlight { run_id }) => assert_eq!(run_id, first.run.run_id),
        other => panic!("expected AlreadyInFlight, got {:?}", other.map(|s| s.run)),
    }
    assert_eq!(
        app.state.orchestrator.in_flight_run(USER_ID),
        Some(first.run.run_id.clone())
    );

    gate.add_permits(1);
    first.task.await.unwrap().unwrap();

    // A new run is accepted once the first has finished
    let third = app
        .state
        .orchestrator
        .trigger(charge_request(USER_ID, 1000))
        .await
        .unwrap();
    gate.add_permits(1);
    third.task.await.unwrap().unwrap();

    assert_eq!(app.processor.charges_created(), 2);
}

#[tokio::test]
async fn test_concurrent_triggers_admit_exactly_one() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));
    let gate = app.processor.gate_charges();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = app.state.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.trigger(charge_request(USER_ID, 1000)).await
        }));
    }

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(started) => accepted.push(started),
            Err(TriggerError::AlreadyInFlight { .. }) => rejected += 1,
            Err(e) => panic!("unexpected trigger error: {}", e),
        }
    }

    assert_eq!(accepted.len(), 1);
    assert_eq!(rejected, 7);

    gate.add_permits(1);
    for started in accepted {
        started.task.await.unwrap().unwrap();
    }
    assert_eq!(app.processor.charges_created(), 1);
}

#[tokio::test]
async fn test_different_users_run_concurrently() {
    let app = create_test_app();
    app.bank_link.link(linked_account("user_a"));
    app.bank_link.link(linked_account("user_b"));
    let gate = app.processor.gate_charges();

    let a = app
        .state
        .orchestrator
        .trigger(charge_request("user_a", 1000))
        .await
        .unwrap();
    let b = app
        .state
        .orchestrator
        .trigger(charge_request("user_b", 1000))
        .await
        .unwrap();

    assert!(app.state.orchestrator.in_flight_run("user_a").is_some());
    assert!(app.state.orchestrator.in_flight_run("user_b").is_some());

    gate.add_permits(2);
    let charge_a = a.task.await.unwrap().unwrap();
    let charge_b = b.task.await.unwrap().unwrap();

    assert_ne!(charge_a.processor_customer_id, charge_b.processor_customer_id);
    assert_eq!(app.processor.customer_count(), 2);
}

#[tokio::test]
async fn test_unlinked_user_is_rejected_synchronously() {
    let app = create_test_app();

    let result = app
        .state
        .orchestrator
        .trigger(charge_request("stranger", 1000))
        .await;

    assert!(matches!(result, Err(TriggerError::NotLinked(ref u)) if u == "stranger"));
    assert!(app.ledger.list_incomplete_runs().await.unwrap().is_empty());
    assert!(app.state.orchestrator.in_flight_run("stranger").is_none());
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));

    let mut request = charge_request(USER_ID, 0);
    let result = app.state.orchestrator.trigger(request.clone()).await;
    assert!(matches!(result, Err(TriggerError::Validation(_))));

    request.amount = 1000;
    request.currency = "dollars".to_string();
    let result = app.state.orchestrator.trigger(request).await;
    assert!(matches!(result, Err(TriggerError::Validation(_))));

    assert!(app.state.orchestrator.in_flight_run(USER_ID).is_none());
}

#[tokio::test]
async fn test_caller_idempotency_key_dedups_across_triggers() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));

    let mut request = charge_request(USER_ID, 1000);
    request.idempotency_key = Some("invoice_42".to_string());

    let first = app
        .state
        .orchestrator
        .trigger(request.clone())
        .await
        .unwrap();
    let first_charge = first.task.await.unwrap().unwrap();

    let second = app.state.orchestrator.trigger(request).await.unwrap();
    let second_charge = second.task.await.unwrap().unwrap();

    assert_ne!(first.run.run_id, second.run.run_id);
    assert_eq!(first_charge.id, second_charge.id);
    assert_eq!(app.processor.charges_created(), 1);
}

#[tokio::test]
async fn test_cancel_takes_effect_before_next_step() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));
    let gate = app.processor.gate_customers();

    let started = app
        .state
        .orchestrator
        .trigger(charge_request(USER_ID, 1000))
        .await
        .unwrap();

    // Let the run get past step 1 and block in customer creation
    loop {
        let run = app.ledger.get_run(&started.run.run_id).await.unwrap();
        if run.is_some_and(|r| r.state == SagaState::AccountLinked) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(app.state.orchestrator.cancel(&started.run.run_id));
    gate.add_permits(1);

    let err = started.task.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        SagaError::Cancelled {
            step: SagaStep::EnsurePaymentMethod
        }
    );

    let run = app
        .ledger
        .get_run(&started.run.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.state, SagaState::Cancelled);
    assert_eq!(app.processor.charge_count(), 0);
    assert!(app.state.orchestrator.in_flight_run(USER_ID).is_none());
}

#[tokio::test]
async fn test_cancel_unknown_run_returns_false() {
    let app = create_test_app();
    assert!(!app.state.orchestrator.cancel("no_such_run"));
}

#[tokio::test]
async fn test_resume_incomplete_finishes_interrupted_runs() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));
    app.bank_link.link(linked_account("user_2"));

    let mut interrupted = new_run("run_crashed", USER_ID, "order_1");
    interrupted.state = SagaState::CustomerEnsured;
    interrupted.attempts = 1;
    app.ledger.save_run(&interrupted).await.unwrap();

    let mut finished = new_run("run_done", "user_2", "order_2");
    finished.state = SagaState::Recorded;
    finished.completed = true;
    app.ledger.save_run(&finished).await.unwrap();

    let resumed = app.state.orchestrator.resume_incomplete().await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].run.run_id, "run_crashed");

    for started in resumed {
        started.task.await.unwrap().unwrap();
    }

    let run = app.ledger.get_run("run_crashed").await.unwrap().unwrap();
    assert_eq!(run.state, SagaState::Recorded);
    assert_eq!(run.attempts, 2);
    assert!(app.ledger.list_incomplete_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_skips_user_with_run_in_flight() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));
    let gate = app.processor.gate_charges();

    let live = app
        .state
        .orchestrator
        .trigger(charge_request(USER_ID, 1000))
        .await
        .unwrap();

    let mut stale = new_run("run_stale", USER_ID, "order_stale");
    stale.state = SagaState::AccountLinked;
    app.ledger.save_run(&stale).await.unwrap();

    let resumed = app.state.orchestrator.resume_incomplete().await.unwrap();
    assert!(resumed.is_empty());

    gate.add_permits(1);
    live.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resume_redrives_after_exhausted_step() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));

    // One more failure than a single pass tolerates
    app.processor.fail_next_charges(4);

    let run = new_run("run_flaky", USER_ID, "order_1");
    app.ledger.save_run(&run).await.unwrap();

    let resumed = app.state.orchestrator.resume_incomplete().await.unwrap();
    assert_eq!(resumed.len(), 1);

    let charge = resumed
        .into_iter()
        .next()
        .unwrap()
        .task
        .await
        .unwrap()
        .unwrap();

    assert_eq!(charge.status, ChargeStatus::Succeeded);
    assert_eq!(app.processor.charge_count(), 5);
    assert_eq!(app.processor.charges_created(), 1);

    let stored = app.ledger.get_run("run_flaky").await.unwrap().unwrap();
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.state, SagaState::Recorded);
}

#[tokio::test]
async fn test_resume_stops_on_permanent_failure() {
    let app = create_test_app();
    app.bank_link.link(linked_account(USER_ID));
    app.processor.reject_charges.store(true, Ordering::SeqCst);

    let run = new_run("run_rejected", USER_ID, "order_1");
    app.ledger.save_run(&run).await.unwrap();

    let resumed = app.state.orchestrator.resume_incomplete().await.unwrap();
    let err = resumed
        .into_iter()
        .next()
        .unwrap()
        .task
        .await
        .unwrap()
        .unwrap_err();

    assert!(!err.is_resumable());
    let stored = app.ledger.get_run("run_rejected").await.unwrap().unwrap();
    assert_eq!(stored.state, SagaState::Failed);
    assert_eq!(stored.attempts, 1);
}
