// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::{LeaseDisposition, RunId, RunStatus, WorkflowId};

/// Orchestration lifecycle events published while runs move through the queue
/// and the step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    RunEnqueued {
        run_id: RunId,
        workflow_id: WorkflowId,
        step_count: usize,
        enqueued_at: DateTime<Utc>,
    },
    RunClaimed {
        run_id: RunId,
        claim_attempts: u32,
        claimed_at: DateTime<Utc>,
    },
    AttemptRecorded {
        run_id: RunId,
        step_id: String,
        attempt_index: u32,
        service_id: String,
        request_id: String,
        ok: bool,
        status_code: u16,
        latency_ms: u64,
    },
    StepCompleted {
        run_id: RunId,
        step_id: String,
        succeeded: bool,
        chosen_service_id: Option<String>,
        attempt_count: usize,
    },
    RunCompleted {
        run_id: RunId,
        final_step_id: Option<String>,
        completed_at: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        error_message: String,
        failed_at: DateTime<Utc>,
    },
    RunCancelled {
        run_id: RunId,
        /// Status the run was in when cancellation took effect.
        previous_status: RunStatus,
        cancelled_at: DateTime<Utc>,
    },
    LeaseReclaimed {
        run_id: RunId,
        claim_attempts: u32,
        disposition: LeaseDisposition,
        reclaimed_at: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            OrchestrationEvent::RunEnqueued { run_id, .. }
            | OrchestrationEvent::RunClaimed { run_id, .. }
            | OrchestrationEvent::AttemptRecorded { run_id, .. }
            | OrchestrationEvent::StepCompleted { run_id, .. }
            | OrchestrationEvent::RunCompleted { run_id, .. }
            | OrchestrationEvent::RunFailed { run_id, .. }
            | OrchestrationEvent::RunCancelled { run_id, .. }
            | OrchestrationEvent::LeaseReclaimed { run_id, .. } => run_id,
        }
    }

    /// True for events after which nothing else is published for the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationEvent::RunCompleted { .. }
                | OrchestrationEvent::RunFailed { .. }
                | OrchestrationEvent::RunCancelled { .. }
        )
    }
}
