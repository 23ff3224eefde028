// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! The single capability the orchestration core consumes: execute one
//! candidate attempt. Payment verification, spend/rate policy and the actual
//! downstream call all live behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const DOWNSTREAM_ERROR: &str = "DOWNSTREAM_ERROR";
pub const ATTEMPT_TIMEOUT: &str = "ATTEMPT_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub service_id: String,
    pub request_id: String,
    #[serde(rename = "paymentTxHash")]
    pub payment_proof: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResult {
    pub ok: bool,
    pub status_code: u16,
    pub response: serde_json::Value,
}

impl AttemptResult {
    pub fn success(status_code: u16, response: serde_json::Value) -> Self {
        Self {
            ok: true,
            status_code,
            response,
        }
    }

    pub fn failure(status_code: u16, response: serde_json::Value) -> Self {
        Self {
            ok: false,
            status_code,
            response,
        }
    }

    /// The capability could not be reached or answered garbage.
    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::failure(
            503,
            json!({ "error": { "code": DOWNSTREAM_ERROR, "message": message.into() } }),
        )
    }

    pub fn timed_out(timeout_ms: u64) -> Self {
        Self::failure(
            504,
            json!({
                "error": {
                    "code": ATTEMPT_TIMEOUT,
                    "message": format!("attempt exceeded {}ms", timeout_ms)
                }
            }),
        )
    }
}

/// Executes one attempt against one candidate.
///
/// Infallible by contract: every failure mode is folded into a non-ok
/// [`AttemptResult`] so the retry policy can see it.
#[async_trait]
pub trait CandidateExecutor: Send + Sync {
    async fn execute(&self, request: ExecuteRequest) -> AttemptResult;
}
