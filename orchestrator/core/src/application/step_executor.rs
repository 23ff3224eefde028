// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Step Executor
//!
//! Sequential state machine that runs a claimed run's steps against their
//! ranked candidates.
//!
//! ```text
//! for step in steps:                    (fail-fast: stop at first failed step)
//!   for candidate in step.candidates:   (fallback)
//!     loop:
//!       cancellation requested? -> stop, run is cancelled
//!       execute attempt
//!       ok?           -> step succeeded, next step
//!       should_retry? -> sleep(backoff), same candidate
//!       else          -> next candidate
//! ```
//!
//! Steps and candidates never run in parallel. Cancellation is checked only
//! before an attempt is issued, so an in-flight attempt always completes and
//! is recorded.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::events::OrchestrationEvent;
use crate::domain::execute::{AttemptResult, CandidateExecutor, ExecuteRequest};
use crate::domain::retry_policy::{attempt_error_code, RetryPolicy};
use crate::domain::run::{
    request_id, Attempt, RunId, RunResult, RunSubmission, RunTermination, StepOutcome, StepSpec,
};
use crate::infrastructure::event_bus::EventBus;

/// Callbacks into the run's durable state while it executes.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    /// Polled before every attempt; `false` means cancellation was requested.
    async fn should_continue(&self, run_id: &RunId) -> bool;

    /// A step reached a terminal state (including interruption by cancellation).
    async fn step_completed(&self, run_id: &RunId, step: &StepOutcome);
}

/// Hooks for runs that cannot be cancelled and are not persisted step by step.
pub struct AlwaysContinue;

#[async_trait]
impl ExecutionHooks for AlwaysContinue {
    async fn should_continue(&self, _run_id: &RunId) -> bool {
        true
    }

    async fn step_completed(&self, _run_id: &RunId, _step: &StepOutcome) {}
}

enum StepEnd {
    Finished(StepOutcome),
    Cancelled(StepOutcome),
}

pub struct StepExecutor {
    executor: Arc<dyn CandidateExecutor>,
    retry_defaults: RetryPolicy,
    attempt_timeout: Option<Duration>,
    event_bus: Arc<EventBus>,
}

impl StepExecutor {
    pub fn new(executor: Arc<dyn CandidateExecutor>, event_bus: Arc<EventBus>) -> Self {
        Self {
            executor,
            retry_defaults: RetryPolicy::default(),
            attempt_timeout: None,
            event_bus,
        }
    }

    /// Policy a step starts from before its own override is applied.
    pub fn with_retry_defaults(mut self, retry_defaults: RetryPolicy) -> Self {
        self.retry_defaults = retry_defaults;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Option<Duration>) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    fn policy_for(&self, step: &StepSpec) -> RetryPolicy {
        match &step.retry_policy {
            Some(overrides) => self.retry_defaults.with_override(overrides),
            None => self.retry_defaults.clone(),
        }
    }

    pub async fn execute(&self, submission: &RunSubmission, hooks: &dyn ExecutionHooks) -> RunResult {
        let run_id = &submission.run_id;
        let mut steps = Vec::with_capacity(submission.steps.len());

        for (step_index, spec) in submission.steps.iter().enumerate() {
            match self.execute_step(run_id, step_index as u32, spec, hooks).await {
                StepEnd::Cancelled(outcome) => {
                    info!(run_id = %run_id, step_id = %spec.step_id, "Cancellation observed, stopping run");
                    // A step interrupted before its first attempt was never reached.
                    if !outcome.attempts.is_empty() {
                        hooks.step_completed(run_id, &outcome).await;
                        steps.push(outcome);
                    }
                    return self.result(submission, RunTermination::Cancelled, steps);
                }
                StepEnd::Finished(outcome) => {
                    hooks.step_completed(run_id, &outcome).await;
                    self.event_bus.publish(OrchestrationEvent::StepCompleted {
                        run_id: run_id.clone(),
                        step_id: outcome.step_id.clone(),
                        succeeded: outcome.succeeded,
                        chosen_service_id: outcome.chosen_service_id.clone(),
                        attempt_count: outcome.attempts.len(),
                    });

                    let succeeded = outcome.succeeded;
                    steps.push(outcome);
                    if !succeeded {
                        info!(run_id = %run_id, step_id = %spec.step_id, "Step exhausted all candidates");
                        return self.result(submission, RunTermination::Failed, steps);
                    }
                }
            }
        }

        self.result(submission, RunTermination::Completed, steps)
    }

    fn result(&self, submission: &RunSubmission, termination: RunTermination, steps: Vec<StepOutcome>) -> RunResult {
        RunResult {
            run_id: submission.run_id.clone(),
            workflow_id: submission.workflow_id.clone(),
            termination,
            steps,
        }
    }

    async fn execute_step(
        &self,
        run_id: &RunId,
        step_index: u32,
        spec: &StepSpec,
        hooks: &dyn ExecutionHooks,
    ) -> StepEnd {
        let policy = self.policy_for(spec);
        let mut outcome = StepOutcome::new(spec.step_id.clone(), step_index);

        for (candidate_index, candidate) in spec.candidates.iter().enumerate() {
            let mut retries = 0u32;

            loop {
                if !hooks.should_continue(run_id).await {
                    return StepEnd::Cancelled(outcome);
                }

                let request = ExecuteRequest {
                    service_id: candidate.service_id.clone(),
                    request_id: request_id(run_id, &spec.step_id, candidate_index, retries),
                    payment_proof: candidate.payment_proof.clone(),
                    payload: spec.payload.clone(),
                };

                let started_at = Utc::now();
                let clock = tokio::time::Instant::now();
                let result = self.call(request.clone()).await;
                let latency_ms = clock.elapsed().as_millis().min(u64::MAX as u128) as u64;

                let attempt = Attempt {
                    attempt_index: outcome.next_attempt_index(),
                    service_id: request.service_id,
                    request_id: request.request_id,
                    payment_proof: request.payment_proof,
                    ok: result.ok,
                    status_code: result.status_code,
                    error_code: attempt_error_code(&result.response).map(str::to_string),
                    response: result.response.clone(),
                    started_at,
                    completed_at: Utc::now(),
                    latency_ms,
                };
                self.observe(run_id, &spec.step_id, &attempt);
                outcome.attempts.push(attempt);

                if result.ok {
                    outcome.mark_succeeded(&candidate.service_id);
                    return StepEnd::Finished(outcome);
                }

                if !policy.should_retry(&result, retries) {
                    debug!(
                        run_id = %run_id,
                        step_id = %spec.step_id,
                        service_id = %candidate.service_id,
                        retries,
                        "Candidate exhausted, falling back"
                    );
                    if candidate_index + 1 < spec.candidates.len() {
                        metrics::counter!("paygate_candidate_fallbacks_total").increment(1);
                    }
                    break;
                }

                retries += 1;
                let delay = policy.delay_ms(retries);
                debug!(
                    run_id = %run_id,
                    step_id = %spec.step_id,
                    service_id = %candidate.service_id,
                    retry = retries,
                    delay_ms = delay,
                    "Retrying candidate after backoff"
                );
                metrics::counter!("paygate_attempt_retries_total").increment(1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        StepEnd::Finished(outcome)
    }

    async fn call(&self, request: ExecuteRequest) -> AttemptResult {
        match self.attempt_timeout {
            None => self.executor.execute(request).await,
            Some(limit) => {
                let request_id = request.request_id.clone();
                match tokio::time::timeout(limit, self.executor.execute(request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(request_id = %request_id, timeout_ms = limit.as_millis() as u64, "Attempt timed out");
                        AttemptResult::timed_out(limit.as_millis() as u64)
                    }
                }
            }
        }
    }

    fn observe(&self, run_id: &RunId, step_id: &str, attempt: &Attempt) {
        let outcome = if attempt.ok { "ok" } else { "error" };
        metrics::counter!("paygate_attempts_total", "outcome" => outcome).increment(1);
        metrics::histogram!("paygate_attempt_latency_ms").record(attempt.latency_ms as f64);

        debug!(
            run_id = %run_id,
            step_id = %step_id,
            request_id = %attempt.request_id,
            status_code = attempt.status_code,
            ok = attempt.ok,
            latency_ms = attempt.latency_ms,
            "Attempt recorded"
        );

        self.event_bus.publish(OrchestrationEvent::AttemptRecorded {
            run_id: run_id.clone(),
            step_id: step_id.to_string(),
            attempt_index: attempt.attempt_index,
            service_id: attempt.service_id.clone(),
            request_id: attempt.request_id.clone(),
            ok: attempt.ok,
            status_code: attempt.status_code,
            latency_ms: attempt.latency_ms,
        });
    }
}
