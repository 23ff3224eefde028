// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Read-only projections over Run / StepOutcome / Attempt, consumed by the
//! reporting endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::retry_policy::attempt_error_code;
use crate::domain::run::{Run, RunId, RunOutput, RunStatus, StepOutcome, WorkflowId};

pub const DEFAULT_LIST_LIMIT: usize = 30;
pub const MAX_LIST_LIMIT: usize = 200;

/// Clamp a caller-supplied page size into `1..=MAX_LIST_LIMIT`.
pub fn clamp_list_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunListItem {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub ok: bool,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub step_count: u64,
    pub attempt_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedProvider {
    pub step_id: String,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub ok: bool,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub step_count: usize,
    pub successful_steps: usize,
    pub attempt_count: usize,
    pub selected_providers: Vec<SelectedProvider>,
    pub run_output: Option<RunOutput>,
}

impl RunSummary {
    pub fn build(run: &Run, steps: &[StepOutcome]) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            status: run.status,
            ok: run.ok,
            cancel_requested: run.cancel_requested,
            error_message: run.error_message.clone(),
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_ms: run.duration_ms(),
            step_count: steps.len(),
            successful_steps: steps.iter().filter(|s| s.succeeded).count(),
            attempt_count: steps.iter().map(|s| s.attempts.len()).sum(),
            selected_providers: steps
                .iter()
                .filter_map(|s| {
                    s.chosen_service_id.as_ref().map(|service_id| SelectedProvider {
                        step_id: s.step_id.clone(),
                        service_id: service_id.clone(),
                    })
                })
                .collect(),
            run_output: run.run_output.clone(),
        }
    }
}

/// One (step, attempt) row. Steps without attempts still produce a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRow {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub run_status: RunStatus,
    pub step_id: String,
    pub step_index: u32,
    pub step_succeeded: bool,
    pub chosen_service_id: Option<String>,
    pub attempt_index: Option<u32>,
    pub service_id: Option<String>,
    pub request_id: Option<String>,
    pub ok: Option<bool>,
    pub status_code: Option<u16>,
    pub error_code: Option<String>,
    pub latency_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response: Option<serde_json::Value>,
}

pub fn build_timeline(run: &Run, steps: &[StepOutcome]) -> Vec<TimelineRow> {
    let mut rows = Vec::new();
    for step in steps {
        let base = TimelineRow {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            run_status: run.status,
            step_id: step.step_id.clone(),
            step_index: step.step_index,
            step_succeeded: step.succeeded,
            chosen_service_id: step.chosen_service_id.clone(),
            attempt_index: None,
            service_id: None,
            request_id: None,
            ok: None,
            status_code: None,
            error_code: None,
            latency_ms: None,
            started_at: None,
            completed_at: None,
            response: None,
        };

        if step.attempts.is_empty() {
            rows.push(base);
            continue;
        }

        for attempt in &step.attempts {
            rows.push(TimelineRow {
                attempt_index: Some(attempt.attempt_index),
                service_id: Some(attempt.service_id.clone()),
                request_id: Some(attempt.request_id.clone()),
                ok: Some(attempt.ok),
                status_code: Some(attempt.status_code),
                error_code: attempt
                    .error_code
                    .clone()
                    .or_else(|| attempt_error_code(&attempt.response).map(str::to_string)),
                latency_ms: Some(attempt.latency_ms),
                started_at: Some(attempt.started_at),
                completed_at: Some(attempt.completed_at),
                response: Some(attempt.response.clone()),
                ..base.clone()
            });
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_limit_clamping() {
        assert_eq!(clamp_list_limit(None), 30);
        assert_eq!(clamp_list_limit(Some(0)), 1);
        assert_eq!(clamp_list_limit(Some(50)), 50);
        assert_eq!(clamp_list_limit(Some(5000)), 200);
    }
}
