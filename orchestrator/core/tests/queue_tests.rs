// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{attempted_step, step, submission, worker, worker_config, ScriptedExecutor};
use paygate_core::application::{
    CancelRunUseCase, OrchestrationRepositories, StandardCancelRunUseCase, TickOutcome,
};
use paygate_core::domain::repository::{RunQueue, RunRepository};
use paygate_core::domain::run::{
    EnqueueOutcome, LeaseDisposition, QueueStatus, RunId, RunStatus, LEASE_EXHAUSTED, LEASE_EXPIRED,
};
use paygate_core::infrastructure::repositories::InMemoryOrchestrationStore;
use paygate_core::infrastructure::EventBus;

#[tokio::test]
async fn test_duplicate_enqueue_keeps_single_run_and_entry() {
    let store = InMemoryOrchestrationStore::new();
    let first = submission("run_dup", vec![step("forecast", &["weather"])]);
    let mut second = first.clone();
    second.steps.push(step("extra", &["weather"]));

    assert_eq!(store.enqueue(&first).await.unwrap(), EnqueueOutcome::Accepted);
    assert_eq!(store.enqueue(&second).await.unwrap(), EnqueueOutcome::AlreadyExists);

    let entry = store.find_entry(&RunId::from("run_dup")).await.unwrap().unwrap();
    assert_eq!(entry.submission, first);
    assert_eq!(entry.attempts, 0);
    assert_eq!(store.list_recent(10).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_enqueues_accept_once() {
    let store = InMemoryOrchestrationStore::new();
    let run = submission("run_race", vec![step("forecast", &["weather"])]);

    let outcomes: Vec<EnqueueOutcome> = join_all((0..16).map(|_| {
        let store = store.clone();
        let run = run.clone();
        tokio::spawn(async move { store.enqueue(&run).await.unwrap() })
    }))
    .await
    .into_iter()
    .map(|joined| joined.unwrap())
    .collect();

    let accepted = outcomes.iter().filter(|o| **o == EnqueueOutcome::Accepted).count();
    let existing = outcomes.iter().filter(|o| **o == EnqueueOutcome::AlreadyExists).count();
    assert_eq!(accepted, 1);
    assert_eq!(existing, 15);
    let entry = store.find_entry(&RunId::from("run_race")).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 0);
    assert_eq!(entry.queue_status, QueueStatus::Queued);
    assert_eq!(store.list_recent(10).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let store = InMemoryOrchestrationStore::new();
    for i in 0..5 {
        store
            .enqueue(&submission(&format!("run_{}", i), vec![step("only", &["svc"])]))
            .await
            .unwrap();
    }

    let claims = join_all((0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next().await.unwrap() })
    }))
    .await;

    let claimed: Vec<RunId> = claims
        .into_iter()
        .filter_map(|joined| joined.unwrap())
        .map(|claim| claim.run_id)
        .collect();
    let unique: HashSet<&RunId> = claimed.iter().collect();

    assert_eq!(claimed.len(), 5);
    assert_eq!(unique.len(), 5);
    for run_id in &claimed {
        let run = store.find_by_id(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
    }
}

#[tokio::test]
async fn test_cancel_before_claim_finalizes_without_attempts() {
    let repositories = OrchestrationRepositories::in_memory();
    let cancel = StandardCancelRunUseCase::new(repositories.runs.clone(), Arc::new(EventBus::new(8)));
    repositories
        .queue
        .enqueue(&submission("run_early", vec![step("forecast", &["weather"])]))
        .await
        .unwrap();

    let record = cancel.cancel(&RunId::from("run_early")).await.unwrap();

    assert_eq!(record.run_status, RunStatus::Cancelled);
    assert!(repositories.queue.claim_next().await.unwrap().is_none());
    let run = repositories.runs.find_by_id(&RunId::from("run_early")).await.unwrap().unwrap();
    assert!(!run.ok);
    assert_eq!(run.error_message.as_deref(), Some("CANCELLED"));
    assert!(repositories.runs.step_outcomes(&run.run_id).await.unwrap().is_empty());
    let entry = repositories.queue.find_entry(&run.run_id).await.unwrap().unwrap();
    assert_eq!(entry.queue_status, QueueStatus::Cancelled);

    // cancelling again is a no-op success
    let again = cancel.cancel(&RunId::from("run_early")).await.unwrap();
    assert_eq!(again.run_status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_expired_lease_is_requeued_and_old_claim_fenced() {
    let store = InMemoryOrchestrationStore::new();
    store
        .enqueue(&submission("run_lease", vec![step("only", &["svc"])]))
        .await
        .unwrap();
    let stale = store.claim_next().await.unwrap().unwrap();

    let reclaimed = store.reclaim_expired(Duration::ZERO, 5).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].disposition, LeaseDisposition::Requeued);

    let entry = store.find_entry(&stale.run_id).await.unwrap().unwrap();
    assert_eq!(entry.queue_status, QueueStatus::Queued);
    assert_eq!(entry.last_error.as_deref(), Some(LEASE_EXPIRED));
    // run status never moves backwards
    let run = store.find_by_id(&stale.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let fresh = store.claim_next().await.unwrap().unwrap();
    assert_eq!(fresh.claim_token, stale.claim_token + 1);
    assert!(store.fail(&stale, "late").await.unwrap_err().is_conflict());
    assert!(store.requeue(&stale, "late", Duration::ZERO).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn test_lease_exhaustion_fails_run() {
    let store = InMemoryOrchestrationStore::new();
    store
        .enqueue(&submission("run_stuck", vec![step("only", &["svc"])]))
        .await
        .unwrap();
    store.claim_next().await.unwrap().unwrap();

    let reclaimed = store.reclaim_expired(Duration::ZERO, 1).await.unwrap();

    assert_eq!(reclaimed[0].disposition, LeaseDisposition::Failed);
    let run = store.find_by_id(&RunId::from("run_stuck")).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some(LEASE_EXHAUSTED));
    assert!(store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lease_of_cancel_requested_run_is_cancelled() {
    let store = InMemoryOrchestrationStore::new();
    store
        .enqueue(&submission("run_abandoned", vec![step("only", &["svc"])]))
        .await
        .unwrap();
    store.claim_next().await.unwrap().unwrap();
    store.request_cancellation(&RunId::from("run_abandoned")).await.unwrap();

    let reclaimed = store.reclaim_expired(Duration::ZERO, 5).await.unwrap();

    assert_eq!(reclaimed[0].disposition, LeaseDisposition::Cancelled);
    let run = store.find_by_id(&RunId::from("run_abandoned")).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let entry = store.find_entry(&run.run_id).await.unwrap().unwrap();
    assert_eq!(entry.queue_status, QueueStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_after_reclaim_keeps_history_of_earlier_claim() {
    let repositories = OrchestrationRepositories::in_memory();
    let cancel = StandardCancelRunUseCase::new(repositories.runs.clone(), Arc::new(EventBus::new(8)));
    let run_id = RunId::from("run_handoff");
    repositories
        .queue
        .enqueue(&submission(
            "run_handoff",
            vec![step("forecast", &["weather"]), step("fly", &["flights"])],
        ))
        .await
        .unwrap();
    let first = repositories.queue.claim_next().await.unwrap().unwrap();
    repositories
        .runs
        .record_step(&first, &attempted_step("run_handoff", "forecast", 0, "weather"))
        .await
        .unwrap();
    let reclaimed = repositories.queue.reclaim_expired(Duration::ZERO, 5).await.unwrap();
    assert_eq!(reclaimed[0].disposition, LeaseDisposition::Requeued);
    cancel.cancel(&run_id).await.unwrap();

    let executor = ScriptedExecutor::new();
    let outcome = worker(&repositories, executor.clone(), worker_config()).run_once().await.unwrap();

    assert!(matches!(outcome, TickOutcome::Processed { status: RunStatus::Cancelled, .. }));
    assert!(executor.calls().is_empty());
    let steps = repositories.runs.step_outcomes(&run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step_id, "forecast");
    assert_eq!(steps[0].attempts.len(), 1);
    let run = repositories.runs.find_by_id(&run_id).await.unwrap().unwrap();
    let output = run.run_output.unwrap();
    assert_eq!(output.steps.len(), 1);
    assert_eq!(output.final_step_id.as_deref(), Some("forecast"));
}

#[tokio::test]
async fn test_fresh_lease_is_not_reclaimed() {
    let store = InMemoryOrchestrationStore::new();
    store
        .enqueue(&submission("run_busy", vec![step("only", &["svc"])]))
        .await
        .unwrap();
    store.claim_next().await.unwrap().unwrap();

    assert!(store.reclaim_expired(Duration::from_secs(300), 5).await.unwrap().is_empty());
}
