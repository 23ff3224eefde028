// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use paygate_core::application::{
    OrchestrationRepositories, OrchestratorWorker, OrchestratorWorkerConfig, StepExecutor,
};
use paygate_core::domain::execute::{AttemptResult, CandidateExecutor, ExecuteRequest};
use paygate_core::domain::retry_policy::RetryPolicyOverride;
use paygate_core::domain::run::{
    request_id, Attempt, Candidate, RunId, RunSubmission, StepOutcome, StepSpec, WorkflowId,
};
use paygate_core::infrastructure::EventBus;

pub fn proof(fill: char) -> String {
    format!("0x{}", fill.to_string().repeat(64))
}

pub fn step(step_id: &str, services: &[&str]) -> StepSpec {
    StepSpec {
        step_id: step_id.to_string(),
        payload: json!({ "step": step_id }),
        candidates: services
            .iter()
            .map(|service_id| Candidate {
                service_id: service_id.to_string(),
                payment_proof: proof('a'),
            })
            .collect(),
        retry_policy: None,
    }
}

pub fn with_retry(mut spec: StepSpec, retry: RetryPolicyOverride) -> StepSpec {
    spec.retry_policy = Some(retry);
    spec
}

pub fn immediate_retries(max_retries: i64) -> RetryPolicyOverride {
    RetryPolicyOverride {
        max_retries: Some(max_retries),
        backoff_ms: Some(0),
        ..Default::default()
    }
}

pub fn submission(run_id: &str, steps: Vec<StepSpec>) -> RunSubmission {
    RunSubmission {
        run_id: RunId::from(run_id),
        workflow_id: WorkflowId::from("trip-planner"),
        steps,
    }
}

/// A step that succeeded on its first candidate, as a worker would persist it.
pub fn attempted_step(run_id: &str, step_id: &str, step_index: u32, service_id: &str) -> StepOutcome {
    let now = chrono::Utc::now();
    StepOutcome {
        step_id: step_id.to_string(),
        step_index,
        succeeded: true,
        chosen_service_id: Some(service_id.to_string()),
        attempts: vec![Attempt {
            attempt_index: 1,
            service_id: service_id.to_string(),
            request_id: request_id(&RunId::from(run_id), step_id, 0, 0),
            payment_proof: proof('a'),
            ok: true,
            status_code: 200,
            error_code: None,
            response: json!({ "step": step_id }),
            started_at: now,
            completed_at: now,
            latency_ms: 0,
        }],
    }
}

pub fn ok(body: Value) -> AttemptResult {
    AttemptResult::success(200, body)
}

pub fn err(status_code: u16) -> AttemptResult {
    AttemptResult::failure(status_code, json!({ "ok": false }))
}

/// Per-service scripted answers. The last answer of a script repeats.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Vec<AttemptResult>>>,
    calls: Mutex<Vec<(tokio::time::Instant, ExecuteRequest)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(self: &Arc<Self>, service_id: &str, answers: Vec<AttemptResult>) -> Arc<Self> {
        self.scripts.lock().insert(service_id.to_string(), answers);
        self.clone()
    }

    pub fn calls(&self) -> Vec<ExecuteRequest> {
        self.calls.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
        self.calls.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, r)| r.request_id.clone()).collect()
    }
}

#[async_trait]
impl CandidateExecutor for ScriptedExecutor {
    async fn execute(&self, request: ExecuteRequest) -> AttemptResult {
        self.calls.lock().push((tokio::time::Instant::now(), request.clone()));
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&request.service_id) {
            Some(answers) if answers.len() > 1 => answers.remove(0),
            Some(answers) if !answers.is_empty() => answers[0].clone(),
            _ => AttemptResult::failure(404, json!({ "error": { "code": "SERVICE_NOT_FOUND" } })),
        }
    }
}

pub fn worker_config() -> OrchestratorWorkerConfig {
    OrchestratorWorkerConfig {
        enabled: true,
        poll_interval: Duration::from_millis(100),
        lease_timeout: Duration::from_secs(300),
        retry_delay: Duration::from_millis(0),
        max_claim_attempts: 5,
    }
}

pub fn worker(
    repositories: &OrchestrationRepositories,
    executor: Arc<dyn CandidateExecutor>,
    config: OrchestratorWorkerConfig,
) -> OrchestratorWorker {
    let event_bus = Arc::new(EventBus::new(256));
    OrchestratorWorker::new(
        repositories.queue.clone(),
        repositories.runs.clone(),
        StepExecutor::new(executor, event_bus.clone()),
        event_bus,
        config,
    )
}
