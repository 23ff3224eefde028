// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the queue and run repositories defined
//! in the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve orchestration aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresRunQueue** - `FOR UPDATE SKIP LOCKED` claiming, requeue, lease reclaim
//! - **PostgresRunRepository** - Run records, step outcomes and attempts
//!
//! ## In-Memory Store
//!
//! - **InMemoryOrchestrationStore** - implements both traits over one shared
//!   state behind a single mutex, so claim is a compare-and-swap on
//!   `queue_status` and finalization is atomic.

pub mod postgres_run;
pub mod postgres_run_queue;

pub use postgres_run::PostgresRunRepository;
pub use postgres_run_queue::PostgresRunQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::projection::RunListItem;
use crate::domain::repository::{CancellationOutcome, RepositoryError, RunQueue, RunRepository};
use crate::domain::run::{
    CancellationDisposition, ClaimedRun, EnqueueOutcome, LeaseDisposition, QueueEntry, QueueStatus,
    ReclaimedLease, Run, RunId, RunResult, RunStatus, RunSubmission, RunTermination, StepOutcome,
    LEASE_EXHAUSTED, LEASE_EXPIRED,
};

struct QueuedJob {
    seq: u64,
    entry: QueueEntry,
}

#[derive(Default)]
struct StoreState {
    next_seq: u64,
    runs: HashMap<RunId, Run>,
    queue: HashMap<RunId, QueuedJob>,
    steps: HashMap<RunId, Vec<StepOutcome>>,
}

impl StoreState {
    /// Queue entry for `claim`, provided the claim still holds the lease.
    fn fenced(&mut self, claim: &ClaimedRun) -> Result<&mut QueuedJob, RepositoryError> {
        match self.queue.get_mut(&claim.run_id) {
            Some(job)
                if job.entry.queue_status == QueueStatus::Running
                    && job.entry.attempts == claim.claim_token =>
            {
                Ok(job)
            }
            Some(_) => Err(RepositoryError::lease_lost(&claim.run_id)),
            None => Err(RepositoryError::NotFound(format!("queue entry {}", claim.run_id))),
        }
    }

    fn run_mut(&mut self, run_id: &RunId) -> Result<&mut Run, RepositoryError> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("run {}", run_id)))
    }

    fn steps_of(&self, run_id: &RunId) -> Vec<StepOutcome> {
        self.steps.get(run_id).cloned().unwrap_or_default()
    }

    fn upsert_step(&mut self, run_id: &RunId, step: &StepOutcome) {
        let steps = self.steps.entry(run_id.clone()).or_default();
        match steps.iter_mut().find(|s| s.step_id == step.step_id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        steps.sort_by_key(|s| s.step_index);
    }

    fn release(entry: &mut QueueEntry, status: QueueStatus, error: Option<&str>, now: DateTime<Utc>) {
        entry.queue_status = status;
        entry.locked_at = None;
        if let Some(error) = error {
            entry.last_error = Some(error.to_string());
        }
        entry.updated_at = now;
    }
}

/// Process-local queue and run store.
#[derive(Clone, Default)]
pub struct InMemoryOrchestrationStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryOrchestrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(delay)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(window)).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl RunQueue for InMemoryOrchestrationStore {
    async fn enqueue(&self, submission: &RunSubmission) -> Result<EnqueueOutcome, RepositoryError> {
        let mut state = self.state.lock();
        if state.runs.contains_key(&submission.run_id) {
            return Ok(EnqueueOutcome::AlreadyExists);
        }

        let now = Utc::now();
        let seq = state.next_seq;
        state.next_seq += 1;

        state.runs.insert(
            submission.run_id.clone(),
            Run::queued(submission.run_id.clone(), submission.workflow_id.clone(), now),
        );
        state.queue.insert(
            submission.run_id.clone(),
            QueuedJob {
                seq,
                entry: QueueEntry {
                    run_id: submission.run_id.clone(),
                    workflow_id: submission.workflow_id.clone(),
                    submission: submission.clone(),
                    queue_status: QueueStatus::Queued,
                    attempts: 0,
                    available_at: now,
                    locked_at: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                },
            },
        );
        Ok(EnqueueOutcome::Accepted)
    }

    async fn claim_next(&self) -> Result<Option<ClaimedRun>, RepositoryError> {
        let mut state = self.state.lock();
        let now = Utc::now();

        loop {
            let candidate = state
                .queue
                .values()
                .filter(|job| job.entry.queue_status == QueueStatus::Queued && job.entry.available_at <= now)
                .min_by_key(|job| (job.entry.available_at, job.seq))
                .map(|job| job.entry.run_id.clone());

            let Some(run_id) = candidate else {
                return Ok(None);
            };

            let run_status = state.runs.get(&run_id).map(|r| r.status);
            if let Some(status) = run_status.filter(|s| s.is_terminal()) {
                // Finalized behind the queue's back; retire the entry and look again.
                let mirrored = QueueStatus::parse(status.as_str()).unwrap_or(QueueStatus::Cancelled);
                if let Some(job) = state.queue.get_mut(&run_id) {
                    StoreState::release(&mut job.entry, mirrored, None, now);
                }
                continue;
            }

            let job = state
                .queue
                .get_mut(&run_id)
                .ok_or_else(|| RepositoryError::NotFound(format!("queue entry {}", run_id)))?;
            job.entry.queue_status = QueueStatus::Running;
            job.entry.attempts += 1;
            job.entry.locked_at = Some(now);
            job.entry.updated_at = now;
            let claimed = ClaimedRun {
                run_id: job.entry.run_id.clone(),
                workflow_id: job.entry.workflow_id.clone(),
                submission: job.entry.submission.clone(),
                claim_token: job.entry.attempts,
            };

            state
                .run_mut(&run_id)?
                .start(now)
                .map_err(|e| RepositoryError::Conflict(e.to_string()))?;

            return Ok(Some(claimed));
        }
    }

    async fn requeue(&self, claim: &ClaimedRun, error: &str, delay: Duration) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let job = state.fenced(claim)?;
        StoreState::release(&mut job.entry, QueueStatus::Queued, Some(error), now);
        job.entry.available_at = after(now, delay);
        Ok(())
    }

    async fn fail(&self, claim: &ClaimedRun, error: &str) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        state.fenced(claim)?;

        let output = crate::domain::run::RunOutput::from_steps(&state.steps_of(&claim.run_id));
        let run = state.run_mut(&claim.run_id)?;
        run.fail(error, now)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        run.run_output = Some(output);

        let job = state.fenced(claim)?;
        StoreState::release(&mut job.entry, QueueStatus::Failed, Some(error), now);
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_claim_attempts: u32,
    ) -> Result<Vec<ReclaimedLease>, RepositoryError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Utc::now();
        let cutoff = before(now, lease_timeout);

        let mut expired: Vec<(u64, RunId)> = state
            .queue
            .values()
            .filter(|job| {
                job.entry.queue_status == QueueStatus::Running
                    && job.entry.locked_at.map(|at| at <= cutoff).unwrap_or(true)
            })
            .map(|job| (job.seq, job.entry.run_id.clone()))
            .collect();
        expired.sort();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (_, run_id) in expired {
            let steps = state.steps_of(&run_id);
            let Some(run) = state.runs.get_mut(&run_id) else {
                continue;
            };
            let attempts = state.queue.get(&run_id).map(|j| j.entry.attempts).unwrap_or(0);

            let disposition = if run.cancel_requested {
                let result = RunResult {
                    run_id: run.run_id.clone(),
                    workflow_id: run.workflow_id.clone(),
                    termination: RunTermination::Cancelled,
                    steps,
                };
                if let Err(e) = run.finalize(&result, now) {
                    tracing::warn!(run_id = %run_id, error = %e, "Cancelled lease on a terminal run");
                }
                LeaseDisposition::Cancelled
            } else if attempts >= max_claim_attempts {
                if let Err(e) = run.fail(LEASE_EXHAUSTED, now) {
                    tracing::warn!(run_id = %run_id, error = %e, "Exhausted lease on a terminal run");
                }
                run.run_output = Some(crate::domain::run::RunOutput::from_steps(&steps));
                LeaseDisposition::Failed
            } else {
                LeaseDisposition::Requeued
            };

            if let Some(job) = state.queue.get_mut(&run_id) {
                match disposition {
                    LeaseDisposition::Cancelled => {
                        StoreState::release(&mut job.entry, QueueStatus::Cancelled, Some(LEASE_EXPIRED), now)
                    }
                    LeaseDisposition::Failed => {
                        StoreState::release(&mut job.entry, QueueStatus::Failed, Some(LEASE_EXHAUSTED), now)
                    }
                    LeaseDisposition::Requeued => {
                        StoreState::release(&mut job.entry, QueueStatus::Queued, Some(LEASE_EXPIRED), now);
                        job.entry.available_at = now;
                    }
                }
            }

            reclaimed.push(ReclaimedLease {
                run_id,
                claim_attempts: attempts,
                disposition,
            });
        }

        Ok(reclaimed)
    }

    async fn find_entry(&self, run_id: &RunId) -> Result<Option<QueueEntry>, RepositoryError> {
        Ok(self.state.lock().queue.get(run_id).map(|job| job.entry.clone()))
    }
}

#[async_trait]
impl RunRepository for InMemoryOrchestrationStore {
    async fn find_by_id(&self, run_id: &RunId) -> Result<Option<Run>, RepositoryError> {
        Ok(self.state.lock().runs.get(run_id).cloned())
    }

    async fn is_cancellation_requested(&self, run_id: &RunId) -> Result<bool, RepositoryError> {
        self.state
            .lock()
            .runs
            .get(run_id)
            .map(|run| run.cancel_requested)
            .ok_or_else(|| RepositoryError::NotFound(format!("run {}", run_id)))
    }

    async fn request_cancellation(&self, run_id: &RunId) -> Result<Option<CancellationOutcome>, RepositoryError> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let Some(run) = state.runs.get_mut(run_id) else {
            return Ok(None);
        };
        let disposition = run.request_cancellation(now);
        let run = run.clone();

        if disposition == CancellationDisposition::CancelledBeforeClaim {
            if let Some(job) = state.queue.get_mut(run_id) {
                StoreState::release(&mut job.entry, QueueStatus::Cancelled, None, now);
            }
        }

        Ok(Some(CancellationOutcome { run, disposition }))
    }

    async fn record_step(&self, claim: &ClaimedRun, step: &StepOutcome) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        state.fenced(claim)?;
        state.upsert_step(&claim.run_id, step);
        Ok(())
    }

    async fn finalize(&self, claim: &ClaimedRun, result: &RunResult) -> Result<Run, RepositoryError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        state.fenced(claim)?;

        let mut run = state
            .runs
            .get(&claim.run_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("run {}", claim.run_id)))?;
        run.finalize(result, now)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;

        // Steps this claim never reached keep the rows an earlier claim wrote.
        for step in &result.steps {
            state.upsert_step(&claim.run_id, step);
        }
        run.run_output = Some(crate::domain::run::RunOutput::from_steps(&state.steps_of(&claim.run_id)));
        state.runs.insert(claim.run_id.clone(), run.clone());

        let job = state.fenced(claim)?;
        StoreState::release(&mut job.entry, result.termination.into(), None, now);

        Ok(run)
    }

    async fn step_outcomes(&self, run_id: &RunId) -> Result<Vec<StepOutcome>, RepositoryError> {
        Ok(self.state.lock().steps_of(run_id))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<RunListItem>, RepositoryError> {
        let state = self.state.lock();

        let mut runs: Vec<(&Run, u64)> = state
            .runs
            .values()
            .map(|run| (run, state.queue.get(&run.run_id).map(|j| j.seq).unwrap_or(0)))
            .collect();
        runs.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at).then(b.1.cmp(&a.1)));

        Ok(runs
            .into_iter()
            .take(limit)
            .map(|(run, _)| {
                let steps = state.steps.get(&run.run_id);
                RunListItem {
                    run_id: run.run_id.clone(),
                    workflow_id: run.workflow_id.clone(),
                    status: run.status,
                    ok: run.ok,
                    cancel_requested: run.cancel_requested,
                    error_message: run.error_message.clone(),
                    created_at: run.created_at,
                    started_at: run.started_at,
                    completed_at: run.completed_at,
                    step_count: steps.map(|s| s.len() as u64).unwrap_or(0),
                    attempt_count: steps
                        .map(|s| s.iter().map(|step| step.attempts.len() as u64).sum())
                        .unwrap_or(0),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::{Candidate, StepSpec, WorkflowId};
    use serde_json::json;

    fn submission(run_id: &str) -> RunSubmission {
        RunSubmission {
            run_id: RunId::from(run_id),
            workflow_id: WorkflowId::from("wf"),
            steps: vec![StepSpec {
                step_id: "s1".to_string(),
                payload: json!({}),
                candidates: vec![Candidate {
                    service_id: "svc".to_string(),
                    payment_proof: format!("0x{}", "0".repeat(64)),
                }],
                retry_policy: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let store = InMemoryOrchestrationStore::new();
        assert_eq!(store.enqueue(&submission("r1")).await.unwrap(), EnqueueOutcome::Accepted);
        assert_eq!(store.enqueue(&submission("r1")).await.unwrap(), EnqueueOutcome::AlreadyExists);
        assert_eq!(store.list_recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_order_and_run_transition() {
        let store = InMemoryOrchestrationStore::new();
        store.enqueue(&submission("first")).await.unwrap();
        store.enqueue(&submission("second")).await.unwrap();

        let claim = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claim.run_id.as_str(), "first");
        assert_eq!(claim.claim_token, 1);

        let run = store.find_by_id(&claim.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        let entry = store.find_entry(&claim.run_id).await.unwrap().unwrap();
        assert_eq!(entry.queue_status, QueueStatus::Running);
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn test_stale_claim_is_fenced_after_reclaim() {
        let store = InMemoryOrchestrationStore::new();
        store.enqueue(&submission("r1")).await.unwrap();
        let stale = store.claim_next().await.unwrap().unwrap();

        let reclaimed = store.reclaim_expired(Duration::ZERO, 5).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].disposition, LeaseDisposition::Requeued);

        let fresh = store.claim_next().await.unwrap().unwrap();
        assert_eq!(fresh.claim_token, 2);

        let result = RunResult {
            run_id: stale.run_id.clone(),
            workflow_id: stale.workflow_id.clone(),
            termination: RunTermination::Completed,
            steps: vec![],
        };
        let err = store.finalize(&stale, &result).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.finalize(&fresh, &result).await.is_ok());
    }

    #[tokio::test]
    async fn test_requeue_with_delay_hides_entry() {
        let store = InMemoryOrchestrationStore::new();
        store.enqueue(&submission("r1")).await.unwrap();
        let claim = store.claim_next().await.unwrap().unwrap();

        store.requeue(&claim, "db hiccup", Duration::from_secs(60)).await.unwrap();
        assert!(store.claim_next().await.unwrap().is_none());

        let entry = store.find_entry(&claim.run_id).await.unwrap().unwrap();
        assert_eq!(entry.queue_status, QueueStatus::Queued);
        assert_eq!(entry.last_error.as_deref(), Some("db hiccup"));
        // run status never moves backwards
        let run = store.find_by_id(&claim.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }
}
