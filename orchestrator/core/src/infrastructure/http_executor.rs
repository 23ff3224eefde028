// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Execute Adapter
//!
//! [`CandidateExecutor`] over the gateway's paid-call endpoint
//! (`POST {base_url}/v1/payments/execute`). Payment verification, spend
//! policy and the downstream service call all happen on the other side.
//!
//! Connection failures and unreadable bodies never escape as errors: they
//! become a non-ok attempt with status 503 and `DOWNSTREAM_ERROR`, which the
//! retry policy treats as retryable.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::domain::config::ExecuteConfig;
use crate::domain::execute::{AttemptResult, CandidateExecutor, ExecuteRequest};

pub struct HttpCandidateExecutor {
    endpoint: url::Url,
    client: Client,
}

impl HttpCandidateExecutor {
    pub fn new(endpoint: url::Url) -> Self {
        Self::with_client(endpoint, Client::new())
    }

    pub fn with_client(endpoint: url::Url, client: Client) -> Self {
        Self { endpoint, client }
    }

    pub fn from_config(config: &ExecuteConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.endpoint()?))
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait]
impl CandidateExecutor for HttpCandidateExecutor {
    async fn execute(&self, request: ExecuteRequest) -> AttemptResult {
        debug!(
            service_id = %request.service_id,
            request_id = %request.request_id,
            "Dispatching execute call"
        );

        let response = match self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Execute call failed in transport");
                return AttemptResult::transport_failure(e.to_string());
            }
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Execute response body unreadable");
                return AttemptResult::transport_failure(e.to_string());
            }
        };

        let body = if bytes.is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(body) => body,
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "Execute response was not JSON");
                    return AttemptResult::transport_failure(format!("invalid JSON response: {}", e));
                }
            }
        };

        AttemptResult {
            ok: status.is_success(),
            status_code: status.as_u16(),
            response: body,
        }
    }
}
