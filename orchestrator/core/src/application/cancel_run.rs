// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cancel Run Use Case
//!
//! Cooperative cancellation. A queued run is finalized `cancelled` on the
//! spot; a running run is only flagged and the step executor stops before its
//! next attempt.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::domain::events::OrchestrationEvent;
use crate::domain::repository::{RepositoryError, RunRepository};
use crate::domain::run::{CancellationDisposition, CancellationRecord, RunId, RunStatus};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum CancelRunError {
    #[error("run {0} not found")]
    NotFound(RunId),

    /// Completed or failed runs cannot be cancelled.
    #[error("run {run_id} is already {status}")]
    AlreadyTerminal { run_id: RunId, status: RunStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[async_trait]
pub trait CancelRunUseCase: Send + Sync {
    /// Cancelling an already-cancelled run succeeds without changing anything.
    async fn cancel(&self, run_id: &RunId) -> Result<CancellationRecord, CancelRunError>;
}

pub struct StandardCancelRunUseCase {
    runs: Arc<dyn RunRepository>,
    event_bus: Arc<EventBus>,
}

impl StandardCancelRunUseCase {
    pub fn new(runs: Arc<dyn RunRepository>, event_bus: Arc<EventBus>) -> Self {
        Self { runs, event_bus }
    }
}

#[async_trait]
impl CancelRunUseCase for StandardCancelRunUseCase {
    async fn cancel(&self, run_id: &RunId) -> Result<CancellationRecord, CancelRunError> {
        let outcome = self
            .runs
            .request_cancellation(run_id)
            .await?
            .ok_or_else(|| CancelRunError::NotFound(run_id.clone()))?;

        let run = outcome.run;
        match outcome.disposition {
            CancellationDisposition::AlreadyTerminal if run.status != RunStatus::Cancelled => {
                return Err(CancelRunError::AlreadyTerminal {
                    run_id: run.run_id,
                    status: run.status,
                });
            }
            CancellationDisposition::AlreadyTerminal => {}
            CancellationDisposition::CancelledBeforeClaim => {
                info!(run_id = %run_id, "Queued run cancelled before claim");
                metrics::counter!("paygate_runs_cancelled_total", "phase" => "queued").increment(1);
                self.event_bus.publish(OrchestrationEvent::RunCancelled {
                    run_id: run_id.clone(),
                    previous_status: RunStatus::Queued,
                    cancelled_at: Utc::now(),
                });
            }
            CancellationDisposition::Flagged => {
                info!(run_id = %run_id, "Cancellation requested for running run");
                metrics::counter!("paygate_runs_cancelled_total", "phase" => "requested").increment(1);
            }
        }

        Ok(CancellationRecord {
            run_id: run.run_id,
            run_status: run.status,
            cancel_requested: run.cancel_requested,
        })
    }
}
