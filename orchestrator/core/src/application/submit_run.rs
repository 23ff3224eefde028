// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Submit Run Use Case
//!
//! Validates a run submission and idempotently enqueues it.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Synchronous admission of runs into the durable queue
//! - **Collaborators:**
//!   - Domain: RunSubmission, validation rules
//!   - Infrastructure: RunQueue, EventBus

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::domain::events::OrchestrationEvent;
use crate::domain::repository::{RepositoryError, RunQueue};
use crate::domain::run::{EnqueueOutcome, RunId, RunStatus, RunSubmission, WorkflowId};
use crate::domain::validation::{validate_submission, ValidationError};
use crate::infrastructure::event_bus::EventBus;

/// Accepted submission response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedRun {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitRunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The run id is already known; nothing was changed.
    #[error("run {0} already exists")]
    Conflict(RunId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[async_trait]
pub trait SubmitRunUseCase: Send + Sync {
    /// # Errors
    ///
    /// - Validation: malformed submission, nothing enqueued
    /// - Conflict: duplicate run id
    /// - Repository: queue write failed
    async fn submit(&self, submission: RunSubmission) -> Result<AcceptedRun, SubmitRunError>;
}

pub struct StandardSubmitRunUseCase {
    queue: Arc<dyn RunQueue>,
    event_bus: Arc<EventBus>,
}

impl StandardSubmitRunUseCase {
    pub fn new(queue: Arc<dyn RunQueue>, event_bus: Arc<EventBus>) -> Self {
        Self { queue, event_bus }
    }
}

#[async_trait]
impl SubmitRunUseCase for StandardSubmitRunUseCase {
    async fn submit(&self, submission: RunSubmission) -> Result<AcceptedRun, SubmitRunError> {
        // Step 1: Reject malformed input before touching storage
        validate_submission(&submission)?;

        // Step 2: Idempotent enqueue
        match self.queue.enqueue(&submission).await? {
            EnqueueOutcome::AlreadyExists => {
                info!(run_id = %submission.run_id, "Duplicate run submission ignored");
                metrics::counter!("paygate_runs_submitted_total", "outcome" => "duplicate").increment(1);
                Err(SubmitRunError::Conflict(submission.run_id))
            }
            EnqueueOutcome::Accepted => {
                info!(
                    run_id = %submission.run_id,
                    workflow_id = %submission.workflow_id,
                    steps = submission.steps.len(),
                    "Run enqueued"
                );
                metrics::counter!("paygate_runs_submitted_total", "outcome" => "accepted").increment(1);

                // Step 3: Publish domain event
                self.event_bus.publish(OrchestrationEvent::RunEnqueued {
                    run_id: submission.run_id.clone(),
                    workflow_id: submission.workflow_id.clone(),
                    step_count: submission.steps.len(),
                    enqueued_at: Utc::now(),
                });

                Ok(AcceptedRun {
                    run_id: submission.run_id,
                    workflow_id: submission.workflow_id,
                    status: RunStatus::Queued,
                })
            }
        }
    }
}
