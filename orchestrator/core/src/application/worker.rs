// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Orchestrator Worker - background loop that drains the run queue
//!
//! Each tick reclaims expired leases, claims at most one run, executes it and
//! finalizes it. An in-flight guard keeps ticks from overlapping, so a single
//! worker never processes two runs concurrently; several workers (or
//! processes) can share one queue because claims are exclusive.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Queue consumption, lease recovery, run finalization

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use async_trait::async_trait;

use crate::application::step_executor::{ExecutionHooks, StepExecutor};
use crate::domain::config::WorkerConfig;
use crate::domain::events::OrchestrationEvent;
use crate::domain::repository::{RepositoryError, RunQueue, RunRepository};
use crate::domain::run::{
    ClaimedRun, LeaseDisposition, Run, RunId, RunStatus, StepOutcome, LEASE_EXHAUSTED,
};
use crate::infrastructure::event_bus::EventBus;

/// Worker loop settings
#[derive(Debug, Clone)]
pub struct OrchestratorWorkerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    /// A claim older than this is considered abandoned.
    pub lease_timeout: Duration,
    /// Delay before a run whose finalization failed becomes claimable again.
    pub retry_delay: Duration,
    pub max_claim_attempts: u32,
}

impl Default for OrchestratorWorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for OrchestratorWorkerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            enabled: config.enabled,
            poll_interval: config.poll_interval(),
            lease_timeout: config.lease_timeout(),
            retry_delay: config.retry_delay(),
            max_claim_attempts: config.max_claim_attempts,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still in flight.
    Skipped,
    /// Nothing claimable.
    Idle,
    Processed { run_id: RunId, status: RunStatus },
}

/// Connects the step executor to durable state for one claim.
struct RepositoryHooks<'a> {
    runs: &'a dyn RunRepository,
    claim: &'a ClaimedRun,
}

#[async_trait]
impl ExecutionHooks for RepositoryHooks<'_> {
    async fn should_continue(&self, run_id: &RunId) -> bool {
        match self.runs.is_cancellation_requested(run_id).await {
            Ok(requested) => !requested,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Cancellation check failed, continuing");
                true
            }
        }
    }

    async fn step_completed(&self, run_id: &RunId, step: &StepOutcome) {
        if let Err(e) = self.runs.record_step(self.claim, step).await {
            // finalize rewrites every step it ran, so a missed write here is repaired there
            warn!(run_id = %run_id, step_id = %step.step_id, error = %e, "Failed to persist step outcome");
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OrchestratorWorker {
    queue: Arc<dyn RunQueue>,
    runs: Arc<dyn RunRepository>,
    step_executor: StepExecutor,
    event_bus: Arc<EventBus>,
    config: OrchestratorWorkerConfig,
    in_flight: AtomicBool,
}

impl OrchestratorWorker {
    pub fn new(
        queue: Arc<dyn RunQueue>,
        runs: Arc<dyn RunRepository>,
        step_executor: StepExecutor,
        event_bus: Arc<EventBus>,
        config: OrchestratorWorkerConfig,
    ) -> Self {
        Self {
            queue,
            runs,
            step_executor,
            event_bus,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Start the worker loop; it stops when `shutdown` is cancelled.
    ///
    /// A run being processed when shutdown arrives is finished first.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Orchestrator worker is disabled");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_timeout_ms = self.config.lease_timeout.as_millis() as u64,
            max_claim_attempts = self.config.max_claim_attempts,
            "Starting orchestrator worker"
        );

        let mut tick = interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.run_once().await {
                        Ok(TickOutcome::Processed { run_id, status }) => {
                            debug!(run_id = %run_id, status = %status, "Worker tick processed a run");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            metrics::counter!("paygate_worker_tick_failures_total").increment(1);
                            warn!("Orchestrator worker tick failed: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping orchestrator worker");
                    break;
                }
            }
        }

        info!("Orchestrator worker stopped");
    }

    /// One poll: reclaim expired leases, claim a run, execute and finalize it.
    pub async fn run_once(&self) -> Result<TickOutcome, RepositoryError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(TickOutcome::Skipped);
        }
        let _guard = InFlight(&self.in_flight);

        self.reclaim_expired().await?;

        let Some(claim) = self.queue.claim_next().await? else {
            return Ok(TickOutcome::Idle);
        };

        info!(run_id = %claim.run_id, claim_attempts = claim.claim_token, "Claimed run");
        metrics::counter!("paygate_runs_claimed_total").increment(1);
        self.event_bus.publish(OrchestrationEvent::RunClaimed {
            run_id: claim.run_id.clone(),
            claim_attempts: claim.claim_token,
            claimed_at: Utc::now(),
        });

        let status = self.process(&claim).await?;
        Ok(TickOutcome::Processed {
            run_id: claim.run_id,
            status,
        })
    }

    async fn reclaim_expired(&self) -> Result<(), RepositoryError> {
        let reclaimed = self
            .queue
            .reclaim_expired(self.config.lease_timeout, self.config.max_claim_attempts)
            .await?;

        for lease in reclaimed {
            warn!(
                run_id = %lease.run_id,
                claim_attempts = lease.claim_attempts,
                disposition = ?lease.disposition,
                "Reclaimed expired lease"
            );
            let disposition = match lease.disposition {
                LeaseDisposition::Requeued => "requeued",
                LeaseDisposition::Failed => "failed",
                LeaseDisposition::Cancelled => "cancelled",
            };
            metrics::counter!("paygate_leases_reclaimed_total", "disposition" => disposition).increment(1);
            self.event_bus.publish(OrchestrationEvent::LeaseReclaimed {
                run_id: lease.run_id,
                claim_attempts: lease.claim_attempts,
                disposition: lease.disposition,
                reclaimed_at: Utc::now(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self, claim), fields(run_id = %claim.run_id, claim_attempts = claim.claim_token))]
    async fn process(&self, claim: &ClaimedRun) -> Result<RunStatus, RepositoryError> {
        let started = tokio::time::Instant::now();
        let hooks = RepositoryHooks {
            runs: self.runs.as_ref(),
            claim,
        };
        let result = self.step_executor.execute(&claim.submission, &hooks).await;

        match self.runs.finalize(claim, &result).await {
            Ok(run) => {
                let status = run.status;
                info!(
                    run_id = %run.run_id,
                    status = %status,
                    attempts = result.attempt_count(),
                    "Run finalized"
                );
                metrics::counter!("paygate_runs_finalized_total", "status" => status.as_str()).increment(1);
                metrics::histogram!("paygate_run_duration_ms").record(started.elapsed().as_millis() as f64);
                self.publish_final(&run);
                Ok(status)
            }
            Err(e) if e.is_conflict() => {
                // Someone else owns the run now; their write wins.
                warn!(run_id = %claim.run_id, error = %e, "Lease lost before finalization, discarding result");
                Err(e)
            }
            Err(e) => {
                error!(run_id = %claim.run_id, error = %e, "Failed to finalize run");
                self.release_after_failure(claim, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Put a claim back after an infrastructure failure, or give up on it
    /// once it has used all its claim attempts.
    async fn release_after_failure(&self, claim: &ClaimedRun, error: &str) {
        let released = if claim.claim_token >= self.config.max_claim_attempts {
            self.queue
                .fail(claim, &format!("{}: {}", LEASE_EXHAUSTED, error))
                .await
        } else {
            self.queue.requeue(claim, error, self.config.retry_delay).await
        };

        if let Err(e) = released {
            // The lease will expire and be reclaimed.
            warn!(run_id = %claim.run_id, error = %e, "Failed to release claim");
        }
    }

    fn publish_final(&self, run: &Run) {
        let now = run.completed_at.unwrap_or_else(Utc::now);
        let event = match run.status {
            RunStatus::Completed => OrchestrationEvent::RunCompleted {
                run_id: run.run_id.clone(),
                final_step_id: run.run_output.as_ref().and_then(|o| o.final_step_id.clone()),
                completed_at: now,
            },
            RunStatus::Cancelled => OrchestrationEvent::RunCancelled {
                run_id: run.run_id.clone(),
                previous_status: RunStatus::Running,
                cancelled_at: now,
            },
            _ => OrchestrationEvent::RunFailed {
                run_id: run.run_id.clone(),
                error_message: run.error_message.clone().unwrap_or_default(),
                failed_at: now,
            },
        };
        self.event_bus.publish(event);
    }
}
