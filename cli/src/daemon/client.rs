// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with the orchestration API

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use paygate_core::domain::run::RunSubmission;

/// Non-2xx answer from the server, carrying its `error.message`.
#[derive(Debug, thiserror::Error)]
#[error("{status}: {message}")]
pub struct ApiClientError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    client: Client,
    base_url: String,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn submit_run(&self, submission: &RunSubmission) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/v1/orchestrations/run", self.base_url))
            .json(submission)
            .send()
            .await
            .context("Failed to submit run")?;
        read_json(response).await
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/v1/orchestrations/runs/{}/cancel", self.base_url, run_id))
            .send()
            .await
            .context("Failed to cancel run")?;
        read_json(response).await
    }

    pub async fn run_summary(&self, run_id: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/v1/orchestrations/runs/{}/summary", self.base_url, run_id))
            .send()
            .await
            .context("Failed to get run summary")?;
        let mut body = read_json(response).await?;
        Ok(body["summary"].take())
    }

    pub async fn run_timeline(&self, run_id: &str) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(format!("{}/v1/orchestrations/runs/{}", self.base_url, run_id))
            .send()
            .await
            .context("Failed to get run timeline")?;
        let mut body = read_json(response).await?;
        serde_json::from_value(body["timeline"].take()).context("Failed to parse timeline response")
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(format!("{}/v1/orchestrations/runs?limit={}", self.base_url, limit))
            .send()
            .await
            .context("Failed to list runs")?;
        let mut body = read_json(response).await?;
        serde_json::from_value(body["runs"].take()).context("Failed to parse list response")
    }
}

async fn read_json(response: Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if !status.is_success() {
        let error = &body["error"];
        return Err(ApiClientError {
            status,
            message: error["message"].as_str().unwrap_or("request failed").to_string(),
            details: error.get("details").cloned(),
        }
        .into());
    }

    Ok(body)
}
