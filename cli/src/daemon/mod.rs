// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server mode implementation
//!
//! Handles:
//! - Wiring the orchestration core into a process (API and/or worker)
//! - HTTP health checks
//! - Graceful shutdown

use anyhow::Result;
use std::time::Duration;

pub mod client;
pub mod server;

pub use client::{ApiClientError, OrchestratorClient};
pub use server::{start_server, ServeMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Running { uptime: Option<u64> },
    Stopped,
    Unhealthy { error: String },
}

pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Check if a server is reachable via its health endpoint
pub async fn check_server_running(base_url: &str) -> Result<ServerStatus> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500)) // Fast timeout for local checks
        .build()?;

    match client.get(format!("{}/health", base_url)).send().await {
        Ok(resp) if resp.status().is_success() => {
            let uptime = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["uptime_seconds"].as_u64());
            Ok(ServerStatus::Running { uptime })
        }
        Ok(resp) => Ok(ServerStatus::Unhealthy {
            error: format!("health check returned {}", resp.status()),
        }),
        Err(e) if e.is_connect() || e.is_timeout() => Ok(ServerStatus::Stopped),
        Err(e) => Ok(ServerStatus::Unhealthy { error: e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_accepts_scheme_or_bare_host() {
        assert_eq!(base_url("127.0.0.1", 3000), "http://127.0.0.1:3000");
        assert_eq!(base_url("https://gw.internal", 443), "https://gw.internal:443");
    }

    #[tokio::test]
    async fn test_health_check_reports_uptime() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"healthy","uptime_seconds":42}"#)
            .create_async()
            .await;

        let status = check_server_running(&server.url()).await.unwrap();

        assert_eq!(status, ServerStatus::Running { uptime: Some(42) });
    }

    #[tokio::test]
    async fn test_health_check_unhealthy_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(503).create_async().await;

        let status = check_server_running(&server.url()).await.unwrap();

        assert!(matches!(status, ServerStatus::Unhealthy { .. }));
    }
}
