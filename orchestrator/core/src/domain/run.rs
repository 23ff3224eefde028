// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Orchestration Run Aggregate
//!
//! A **Run** is one submitted multi-step workflow execution. It is created
//! together with its [`QueueEntry`] at submission time, claimed by exactly one
//! worker, and finalized into one of three terminal states.
//!
//! ```text
//! queued ──claim──▶ running ──▶ completed | failed | cancelled
//!    └──────────── cancel (pre-claim) ──────────────▶ cancelled
//! ```
//!
//! Status only ever moves toward a terminal state; once terminal, the Run,
//! its StepOutcomes and Attempts are immutable.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Run / QueueEntry / Step / Attempt value types and transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::retry_policy::RetryPolicyOverride;

/// Client-supplied unique run key (idempotency key for submission).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-side status. Mirrors the run's terminal states plus `queued`/`running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Running => "running",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(QueueStatus::Queued),
            "running" => Some(QueueStatus::Running),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            "cancelled" => Some(QueueStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled)
    }
}

impl From<RunTermination> for QueueStatus {
    fn from(termination: RunTermination) -> Self {
        match termination {
            RunTermination::Completed => QueueStatus::Completed,
            RunTermination::Failed => QueueStatus::Failed,
            RunTermination::Cancelled => QueueStatus::Cancelled,
        }
    }
}

/// One provider option for a step, tried in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub service_id: String,
    /// Opaque payment proof forwarded untouched to the Execute capability.
    #[serde(alias = "paymentTxHash")]
    pub payment_proof: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub step_id: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicyOverride>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Submission payload. Stored verbatim on the queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSubmission {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub steps: Vec<StepSpec>,
}

/// Deterministic downstream idempotency key for one attempt.
///
/// `candidate_index` and `retry_index` are zero-based; the rendered key is
/// one-based so it reads naturally in downstream logs. Retries and worker
/// restarts re-derive the same key for the same logical attempt.
pub fn request_id(run_id: &RunId, step_id: &str, candidate_index: usize, retry_index: u32) -> String {
    format!(
        "{}_{}_{}_a{}",
        run_id.as_str(),
        step_id,
        candidate_index + 1,
        retry_index + 1
    )
}

/// One execution try of one candidate. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    /// 1-based position within the step.
    pub attempt_index: u32,
    pub service_id: String,
    pub request_id: String,
    pub payment_proof: String,
    pub ok: bool,
    pub status_code: u16,
    pub error_code: Option<String>,
    pub response: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    /// 0-based submission position, used to keep persisted steps in order.
    pub step_index: u32,
    pub succeeded: bool,
    pub chosen_service_id: Option<String>,
    pub attempts: Vec<Attempt>,
}

impl StepOutcome {
    pub fn new(step_id: impl Into<String>, step_index: u32) -> Self {
        Self {
            step_id: step_id.into(),
            step_index,
            succeeded: false,
            chosen_service_id: None,
            attempts: Vec::new(),
        }
    }

    pub fn next_attempt_index(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn mark_succeeded(&mut self, service_id: &str) {
        self.succeeded = true;
        self.chosen_service_id = Some(service_id.to_string());
    }

    /// Response body of the attempt that made this step succeed.
    pub fn successful_response(&self) -> Option<&serde_json::Value> {
        if !self.succeeded {
            return None;
        }
        self.attempts.iter().rev().find(|a| a.ok).map(|a| &a.response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTermination {
    Completed,
    Failed,
    Cancelled,
}

impl From<RunTermination> for RunStatus {
    fn from(termination: RunTermination) -> Self {
        match termination {
            RunTermination::Completed => RunStatus::Completed,
            RunTermination::Failed => RunStatus::Failed,
            RunTermination::Cancelled => RunStatus::Cancelled,
        }
    }
}

pub const ORCHESTRATION_FAILED: &str = "ORCHESTRATION_FAILED";
pub const CANCELLED: &str = "CANCELLED";

/// Everything the step executor produced for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub termination: RunTermination,
    pub steps: Vec<StepOutcome>,
}

impl RunResult {
    pub fn ok(&self) -> bool {
        self.termination == RunTermination::Completed
    }

    pub fn status(&self) -> RunStatus {
        self.termination.into()
    }

    pub fn error_message(&self) -> Option<String> {
        match self.termination {
            RunTermination::Completed => None,
            RunTermination::Failed => Some(ORCHESTRATION_FAILED.to_string()),
            RunTermination::Cancelled => Some(CANCELLED.to_string()),
        }
    }

    pub fn output(&self) -> RunOutput {
        RunOutput::from_steps(&self.steps)
    }

    pub fn attempt_count(&self) -> usize {
        self.steps.iter().map(|s| s.attempts.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutputSummary {
    pub step_id: String,
    pub succeeded: bool,
    pub chosen_service_id: Option<String>,
    pub attempt_count: usize,
    pub output: Option<serde_json::Value>,
}

/// Structured output derived from the step outcomes of a finalized run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub steps: Vec<StepOutputSummary>,
    pub final_step_id: Option<String>,
    pub final_output: Option<serde_json::Value>,
}

impl RunOutput {
    pub fn from_steps(steps: &[StepOutcome]) -> Self {
        let summaries: Vec<StepOutputSummary> = steps
            .iter()
            .map(|step| StepOutputSummary {
                step_id: step.step_id.clone(),
                succeeded: step.succeeded,
                chosen_service_id: step.chosen_service_id.clone(),
                attempt_count: step.attempts.len(),
                output: step.successful_response().cloned(),
            })
            .collect();

        let last_success = summaries.iter().rev().find(|s| s.succeeded);

        Self {
            final_step_id: last_success.map(|s| s.step_id.clone()),
            final_output: last_success.and_then(|s| s.output.clone()),
            steps: summaries,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("run {run_id} cannot move from {from} to {to}")]
    Invalid {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
}

/// The durable Run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub ok: bool,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub run_output: Option<RunOutput>,
}

/// What a cancellation request did to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationDisposition {
    /// Queued run finalized synchronously; no step will ever execute.
    CancelledBeforeClaim,
    /// Running run flagged; the executor stops before its next attempt.
    Flagged,
    /// Run already terminal; nothing changed.
    AlreadyTerminal,
}

impl Run {
    pub fn queued(run_id: RunId, workflow_id: WorkflowId, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            workflow_id,
            status: RunStatus::Queued,
            ok: false,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            run_output: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Claim-time transition. Re-claiming a `running` run (lease expiry,
    /// worker-internal failure) keeps the original `started_at`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), RunTransitionError> {
        match self.status {
            RunStatus::Queued | RunStatus::Running => {
                self.status = RunStatus::Running;
                self.started_at.get_or_insert(now);
                self.error_message = None;
                Ok(())
            }
            from => Err(RunTransitionError::Invalid {
                run_id: self.run_id.clone(),
                from,
                to: RunStatus::Running,
            }),
        }
    }

    pub fn request_cancellation(&mut self, now: DateTime<Utc>) -> CancellationDisposition {
        match self.status {
            RunStatus::Queued => {
                self.cancel_requested = true;
                self.status = RunStatus::Cancelled;
                self.completed_at = Some(now);
                self.error_message = Some(CANCELLED.to_string());
                CancellationDisposition::CancelledBeforeClaim
            }
            RunStatus::Running => {
                self.cancel_requested = true;
                CancellationDisposition::Flagged
            }
            _ => CancellationDisposition::AlreadyTerminal,
        }
    }

    pub fn finalize(&mut self, result: &RunResult, now: DateTime<Utc>) -> Result<(), RunTransitionError> {
        let to = result.status();
        if self.is_terminal() {
            return Err(RunTransitionError::Invalid {
                run_id: self.run_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.ok = result.ok();
        self.started_at.get_or_insert(now);
        self.completed_at = Some(now);
        self.error_message = result.error_message();
        self.run_output = Some(result.output());
        Ok(())
    }

    /// Worker gave up on the run without an executor result.
    pub fn fail(&mut self, error_message: &str, now: DateTime<Utc>) -> Result<(), RunTransitionError> {
        if self.is_terminal() {
            return Err(RunTransitionError::Invalid {
                run_id: self.run_id.clone(),
                from: self.status,
                to: RunStatus::Failed,
            });
        }
        self.status = RunStatus::Failed;
        self.ok = false;
        self.completed_at = Some(now);
        self.error_message = Some(error_message.to_string());
        Ok(())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Durable job-queue row backing a Run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub submission: RunSubmission,
    pub queue_status: QueueStatus,
    /// Number of times the entry has been claimed.
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job handed to exactly one worker by `RunQueue::claim_next`.
///
/// `claim_token` is the entry's claim count at the moment of the claim. Every
/// later write for this job is fenced on it, so a worker whose lease was
/// reclaimed cannot overwrite the state written by the next claimer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedRun {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub submission: RunSubmission,
    pub claim_token: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationRecord {
    pub run_id: RunId,
    pub run_status: RunStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseDisposition {
    Requeued,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimedLease {
    pub run_id: RunId,
    pub claim_attempts: u32,
    pub disposition: LeaseDisposition,
}

pub const LEASE_EXPIRED: &str = "lease expired";
pub const LEASE_EXHAUSTED: &str = "LEASE_EXHAUSTED";
