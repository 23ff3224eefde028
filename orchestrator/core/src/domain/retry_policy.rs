// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Retry decision and capped exponential backoff.
//!
//! Both [`RetryPolicy::should_retry`] and [`RetryPolicy::delay_ms`] are pure;
//! the step executor owns the actual sleeping.

use serde::{Deserialize, Serialize};

use crate::domain::execute::AttemptResult;

pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_BACKOFF_MS: u64 = 250;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];
pub const DEFAULT_RETRYABLE_ERROR_CODES: [&str; 2] = ["DOWNSTREAM_ERROR", "PAYMENT_NOT_FOUND"];

/// Per-step (or config-level) partial override. Unset fields inherit.
///
/// Numeric fields are signed so out-of-range submissions reach validation
/// instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_status_codes: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_error_codes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub retryable_status_codes: Vec<u16>,
    pub retryable_error_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
            retryable_error_codes: DEFAULT_RETRYABLE_ERROR_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

fn clamp_non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

impl RetryPolicy {
    pub fn from_override(overrides: Option<&RetryPolicyOverride>) -> Self {
        match overrides {
            Some(o) => Self::default().with_override(o),
            None => Self::default(),
        }
    }

    /// Layers `overrides` on top of `self`, clamping into the legal domain.
    pub fn with_override(&self, overrides: &RetryPolicyOverride) -> Self {
        let mut policy = self.clone();

        if let Some(max_retries) = overrides.max_retries {
            policy.max_retries = max_retries.clamp(0, u32::MAX as i64) as u32;
        }
        if let Some(backoff_ms) = overrides.backoff_ms {
            policy.backoff_ms = clamp_non_negative(backoff_ms);
        }
        if let Some(multiplier) = overrides.backoff_multiplier {
            policy.backoff_multiplier = if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                DEFAULT_BACKOFF_MULTIPLIER
            };
        }
        if let Some(max_backoff_ms) = overrides.max_backoff_ms {
            policy.max_backoff_ms = clamp_non_negative(max_backoff_ms);
        }
        if let Some(codes) = &overrides.retryable_status_codes {
            policy.retryable_status_codes = codes
                .iter()
                .filter_map(|c| u16::try_from(*c).ok())
                .collect();
        }
        if let Some(codes) = &overrides.retryable_error_codes {
            policy.retryable_error_codes = codes.clone();
        }

        policy
    }

    pub fn should_retry(&self, attempt: &AttemptResult, retries_so_far: u32) -> bool {
        if attempt.ok {
            return false;
        }
        if retries_so_far >= self.max_retries {
            return false;
        }
        if self.retryable_status_codes.contains(&attempt.status_code) {
            return true;
        }
        match attempt_error_code(&attempt.response) {
            Some(code) => self.retryable_error_codes.iter().any(|c| c == code),
            None => false,
        }
    }

    /// Backoff before retry number `retry_attempt_number` (1-based).
    pub fn delay_ms(&self, retry_attempt_number: u32) -> u64 {
        let exponent = retry_attempt_number.saturating_sub(1);
        let raw = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent.min(1024) as i32);
        let cap = self.max_backoff_ms as f64;
        if !raw.is_finite() || raw >= cap {
            return self.max_backoff_ms;
        }
        raw.round().max(0.0) as u64
    }
}

/// `response.error.code`, when present as a string.
pub fn attempt_error_code(response: &serde_json::Value) -> Option<&str> {
    response.get("error")?.get("code")?.as_str()
}
