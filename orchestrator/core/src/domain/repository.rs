// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the orchestration aggregates. Interfaces live in
//! the domain layer and are implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Owns | Implementations |
//! |-------|------|----------------|
//! | `RunQueue` | `QueueEntry` (claiming, requeue, lease reclaim) | `InMemoryOrchestrationStore`, `PostgresRunQueue` |
//! | `RunRepository` | `Run`, `StepOutcome`, `Attempt` | `InMemoryOrchestrationStore`, `PostgresRunRepository` |
//!
//! ## Lease fencing
//!
//! Every write made on behalf of a claimed job carries the [`ClaimedRun`]
//! handed out by `claim_next`. The write only applies while the queue entry is
//! still `running` with the same claim count; otherwise it fails with
//! [`RepositoryError::Conflict`] and changes nothing.
//!
//! ## Storage Backend Abstraction
//!
//! Concrete implementations are selected at startup from configuration
//! (`paygate-config.yaml`). The in-memory store is for development and tests;
//! PostgreSQL is the durable production backend.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::projection::RunListItem;
use crate::domain::run::{
    CancellationDisposition, ClaimedRun, EnqueueOutcome, QueueEntry, ReclaimedLease, Run, RunId,
    RunResult, RunSubmission, StepOutcome,
};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

/// Durable job queue with idempotent enqueue and exactly-once claim.
#[async_trait]
pub trait RunQueue: Send + Sync {
    /// Create the Run (`queued`) and its QueueEntry atomically. A second call
    /// for the same run id changes nothing and reports `AlreadyExists`.
    async fn enqueue(&self, submission: &RunSubmission) -> Result<EnqueueOutcome, RepositoryError>;

    /// Claim the oldest eligible queued entry. At most one concurrent caller
    /// obtains any given entry.
    async fn claim_next(&self) -> Result<Option<ClaimedRun>, RepositoryError>;

    /// Hand the job back to the queue after a worker-internal failure.
    async fn requeue(&self, claim: &ClaimedRun, error: &str, delay: Duration) -> Result<(), RepositoryError>;

    /// Give up on the job: queue entry and run both become `failed`.
    async fn fail(&self, claim: &ClaimedRun, error: &str) -> Result<(), RepositoryError>;

    /// Resolve entries left `running` longer than `lease_timeout`.
    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_claim_attempts: u32,
    ) -> Result<Vec<ReclaimedLease>, RepositoryError>;

    async fn find_entry(&self, run_id: &RunId) -> Result<Option<QueueEntry>, RepositoryError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancellationOutcome {
    /// The run after the request was applied.
    pub run: Run,
    pub disposition: CancellationDisposition,
}

/// Run records plus their step and attempt history.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn find_by_id(&self, run_id: &RunId) -> Result<Option<Run>, RepositoryError>;

    async fn is_cancellation_requested(&self, run_id: &RunId) -> Result<bool, RepositoryError>;

    /// Flag the run for cancellation. A run that is still `queued` is
    /// finalized `cancelled` together with its queue entry in the same write.
    /// Returns `None` when the run does not exist.
    async fn request_cancellation(&self, run_id: &RunId) -> Result<Option<CancellationOutcome>, RepositoryError>;

    /// Incremental write of one step that reached a terminal state, replacing
    /// any earlier rows for the same step.
    async fn record_step(&self, claim: &ClaimedRun, step: &StepOutcome) -> Result<(), RepositoryError>;

    /// Terminal write: run, queue entry and the result's step rows in one
    /// transaction. Rows for steps the result does not mention are kept.
    async fn finalize(&self, claim: &ClaimedRun, result: &RunResult) -> Result<Run, RepositoryError>;

    /// Persisted steps in submission order, attempts in attempt order.
    async fn step_outcomes(&self, run_id: &RunId) -> Result<Vec<StepOutcome>, RepositoryError>;

    /// Most recently created runs first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<RunListItem>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub const LEASE_LOST: &str = "lease lost";

impl RepositoryError {
    pub fn lease_lost(run_id: &RunId) -> Self {
        RepositoryError::Conflict(format!("{} for run {}", LEASE_LOST, run_id))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict(_))
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
