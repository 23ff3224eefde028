// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Submission validation.
//!
//! Malformed submissions are rejected synchronously, before anything is
//! enqueued. All issues are collected rather than stopping at the first.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use crate::domain::retry_policy::RetryPolicyOverride;
use crate::domain::run::RunSubmission;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_STEPS: usize = 10;
pub const MAX_RETRIES_LIMIT: i64 = 5;
pub const MAX_BACKOFF_MS_LIMIT: i64 = 10_000;
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
pub const MAX_BACKOFF_CAP_MS_LIMIT: i64 = 60_000;
pub const MAX_RETRYABLE_CODES: usize = 20;

static PAYMENT_PROOF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[a-fA-F0-9]{64}$").expect("payment proof regex should compile"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid submission")?;
        for (i, issue) in self.issues.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{} {}", sep, issue.path, issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Default)]
struct Issues(Vec<FieldIssue>);

impl Issues {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    fn check_id(&mut self, path: &str, value: &str) {
        if value.is_empty() {
            self.push(path, "must not be empty");
        } else if value.chars().count() > MAX_ID_LEN {
            self.push(path, format!("must be at most {} characters", MAX_ID_LEN));
        }
    }
}

pub fn validate_submission(submission: &RunSubmission) -> Result<(), ValidationError> {
    let mut issues = Issues::default();

    issues.check_id("runId", submission.run_id.as_str());
    issues.check_id("workflowId", submission.workflow_id.as_str());

    if submission.steps.is_empty() {
        issues.push("steps", "must contain at least one step");
    } else if submission.steps.len() > MAX_STEPS {
        issues.push("steps", format!("must contain at most {} steps", MAX_STEPS));
    }

    let mut seen_steps = HashSet::new();
    for (i, step) in submission.steps.iter().enumerate() {
        let base = format!("steps[{}]", i);

        issues.check_id(&format!("{}.stepId", base), &step.step_id);
        if !step.step_id.is_empty() && !seen_steps.insert(step.step_id.as_str()) {
            issues.push(format!("{}.stepId", base), "is duplicated within the run");
        }

        if !step.payload.is_object() {
            issues.push(format!("{}.payload", base), "must be a JSON object");
        }

        if step.candidates.is_empty() {
            issues.push(format!("{}.candidates", base), "must contain at least one candidate");
        }
        for (j, candidate) in step.candidates.iter().enumerate() {
            let cbase = format!("{}.candidates[{}]", base, j);
            issues.check_id(&format!("{}.serviceId", cbase), &candidate.service_id);
            if !PAYMENT_PROOF.is_match(&candidate.payment_proof) {
                issues.push(
                    format!("{}.paymentProof", cbase),
                    "must be a 0x-prefixed 32-byte hex hash",
                );
            }
        }

        if let Some(policy) = &step.retry_policy {
            validate_override(&mut issues, &format!("{}.retryPolicy", base), policy);
        }
    }

    if issues.0.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues: issues.0 })
    }
}

/// Bounds check for a standalone override (also used for config defaults).
pub fn validate_retry_override(policy: &RetryPolicyOverride) -> Result<(), ValidationError> {
    let mut issues = Issues::default();
    validate_override(&mut issues, "retryPolicy", policy);
    if issues.0.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues: issues.0 })
    }
}

fn validate_override(issues: &mut Issues, base: &str, policy: &RetryPolicyOverride) {
    if let Some(v) = policy.max_retries {
        if !(0..=MAX_RETRIES_LIMIT).contains(&v) {
            issues.push(format!("{}.maxRetries", base), format!("must be within 0..={}", MAX_RETRIES_LIMIT));
        }
    }
    if let Some(v) = policy.backoff_ms {
        if !(0..=MAX_BACKOFF_MS_LIMIT).contains(&v) {
            issues.push(format!("{}.backoffMs", base), format!("must be within 0..={}", MAX_BACKOFF_MS_LIMIT));
        }
    }
    if let Some(v) = policy.backoff_multiplier {
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&v) {
            issues.push(
                format!("{}.backoffMultiplier", base),
                format!("must be within 1..={}", MAX_BACKOFF_MULTIPLIER),
            );
        }
    }
    if let Some(v) = policy.max_backoff_ms {
        if !(0..=MAX_BACKOFF_CAP_MS_LIMIT).contains(&v) {
            issues.push(
                format!("{}.maxBackoffMs", base),
                format!("must be within 0..={}", MAX_BACKOFF_CAP_MS_LIMIT),
            );
        }
    }
    if let Some(codes) = &policy.retryable_status_codes {
        if codes.len() > MAX_RETRYABLE_CODES {
            issues.push(
                format!("{}.retryableStatusCodes", base),
                format!("must contain at most {} codes", MAX_RETRYABLE_CODES),
            );
        }
        for (i, code) in codes.iter().enumerate() {
            if !(100..=599).contains(code) {
                issues.push(format!("{}.retryableStatusCodes[{}]", base, i), "must be within 100..=599");
            }
        }
    }
    if let Some(codes) = &policy.retryable_error_codes {
        if codes.len() > MAX_RETRYABLE_CODES {
            issues.push(
                format!("{}.retryableErrorCodes", base),
                format!("must contain at most {} codes", MAX_RETRYABLE_CODES),
            );
        }
        for (i, code) in codes.iter().enumerate() {
            issues.check_id(&format!("{}.retryableErrorCodes[{}]", base, i), code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::{Candidate, RunId, StepSpec, WorkflowId};
    use serde_json::json;

    fn proof() -> String {
        format!("0x{}", "ab".repeat(32))
    }

    fn submission(steps: Vec<StepSpec>) -> RunSubmission {
        RunSubmission {
            run_id: RunId::from("run_1"),
            workflow_id: WorkflowId::from("trip-planner"),
            steps,
        }
    }

    fn step(id: &str) -> StepSpec {
        StepSpec {
            step_id: id.to_string(),
            payload: json!({"city": "Lisbon"}),
            candidates: vec![Candidate {
                service_id: "weather-api".to_string(),
                payment_proof: proof(),
            }],
            retry_policy: None,
        }
    }

    fn paths(err: ValidationError) -> Vec<String> {
        err.issues.into_iter().map(|i| i.path).collect()
    }

    #[test]
    fn test_valid_submission_passes() {
        assert!(validate_submission(&submission(vec![step("a"), step("b")])).is_ok());
    }

    #[test]
    fn test_empty_and_oversized_step_lists() {
        let err = validate_submission(&submission(vec![])).unwrap_err();
        assert_eq!(paths(err), vec!["steps"]);

        let many = (0..11).map(|i| step(&format!("s{}", i))).collect();
        let err = validate_submission(&submission(many)).unwrap_err();
        assert_eq!(paths(err), vec!["steps"]);
    }

    #[test]
    fn test_duplicate_step_ids_and_missing_candidates() {
        let mut second = step("a");
        second.candidates.clear();
        let err = validate_submission(&submission(vec![step("a"), second])).unwrap_err();
        assert_eq!(paths(err), vec!["steps[1].stepId", "steps[1].candidates"]);
    }

    #[test]
    fn test_payment_proof_format() {
        let mut bad = step("a");
        bad.candidates[0].payment_proof = "0x1234".to_string();
        let err = validate_submission(&submission(vec![bad])).unwrap_err();
        assert_eq!(paths(err), vec!["steps[0].candidates[0].paymentProof"]);
    }

    #[test]
    fn test_run_id_length_and_payload_shape() {
        let mut sub = submission(vec![step("a")]);
        sub.run_id = RunId::new("x".repeat(129));
        sub.steps[0].payload = json!([1, 2]);
        let err = validate_submission(&sub).unwrap_err();
        assert_eq!(paths(err), vec!["runId", "steps[0].payload"]);
    }

    #[test]
    fn test_retry_override_bounds() {
        let mut s = step("a");
        s.retry_policy = Some(RetryPolicyOverride {
            max_retries: Some(6),
            backoff_multiplier: Some(0.5),
            retryable_status_codes: Some(vec![503, 99]),
            retryable_error_codes: Some(vec![String::new()]),
            ..Default::default()
        });
        let err = validate_submission(&submission(vec![s])).unwrap_err();
        assert_eq!(
            paths(err.clone()),
            vec![
                "steps[0].retryPolicy.maxRetries",
                "steps[0].retryPolicy.backoffMultiplier",
                "steps[0].retryPolicy.retryableStatusCodes[1]",
                "steps[0].retryPolicy.retryableErrorCodes[0]",
            ]
        );
        assert!(err.to_string().starts_with("invalid submission: steps[0].retryPolicy.maxRetries"));
    }
}
