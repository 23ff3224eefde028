// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Orchestrator process: HTTP API, queue worker, or both

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use paygate_core::{
    application::{
        create_orchestration_repositories, OrchestrationRepositories, OrchestratorWorker,
        OrchestratorWorkerConfig, StepExecutor,
    },
    domain::{config::OrchestratorConfigManifest, repository::StorageBackend},
    infrastructure::{db::Database, EventBus, EventBusError, HttpCandidateExecutor},
    presentation::{app, AppState},
};

#[derive(Debug, Clone, Copy)]
pub struct ServeMode {
    pub api: bool,
    pub worker: bool,
}

pub async fn start_server(config: OrchestratorConfigManifest, mode: ServeMode) -> Result<()> {
    config
        .validate()
        .context("Configuration validation failed")?;

    info!(
        name = %config.metadata.name,
        api = mode.api,
        worker = mode.worker,
        "Paygate orchestrator starting (PID: {})",
        std::process::id()
    );

    if config.spec.observability.metrics.enabled {
        install_metrics_exporter(config.spec.observability.metrics.port)?;
    }

    // Initialize services
    let repositories = build_repositories(&config).await?;
    let event_bus = Arc::new(EventBus::with_default_capacity());
    spawn_event_logger(&event_bus);

    let shutdown = CancellationToken::new();

    let worker_handle = if mode.worker {
        let executor = Arc::new(
            HttpCandidateExecutor::from_config(&config.spec.execute)
                .context("Invalid execute endpoint")?,
        );
        info!(endpoint = %executor.endpoint(), "Execute capability configured");

        let step_executor = StepExecutor::new(executor, event_bus.clone())
            .with_retry_defaults(config.retry_defaults())
            .with_attempt_timeout(config.spec.worker.attempt_timeout());
        let worker = Arc::new(OrchestratorWorker::new(
            repositories.queue.clone(),
            repositories.runs.clone(),
            step_executor,
            event_bus.clone(),
            OrchestratorWorkerConfig::from(&config.spec.worker),
        ));
        Some(worker.start(shutdown.clone()))
    } else {
        None
    };

    if mode.api {
        let router = app(AppState::new(&repositories, event_bus.clone())).layer(TraceLayer::new_for_http());

        let addr = format!("{}:{}", config.spec.network.bind_address, config.spec.network.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("Orchestration API listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")?;
    } else {
        shutdown_signal().await;
    }

    info!("Paygate orchestrator shutting down");
    shutdown.cancel();
    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    Ok(())
}

async fn build_repositories(config: &OrchestratorConfigManifest) -> Result<OrchestrationRepositories> {
    let backend = config.storage_backend()?;
    let pool = match &backend {
        StorageBackend::InMemory => {
            warn!("Using in-memory storage; runs are lost on restart and not shared between processes");
            None
        }
        StorageBackend::PostgreSQL(pg) => {
            let db = Database::new(&pg.connection_string, pg.max_connections).await?;
            db.migrate().await?;
            info!("PostgreSQL storage ready");
            Some(db.get_pool().clone())
        }
    };
    create_orchestration_repositories(&backend, pool).context("Failed to create repositories")
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    metrics::describe_counter!("paygate_runs_submitted_total", "Run submissions by outcome");
    metrics::describe_counter!("paygate_runs_claimed_total", "Runs claimed by a worker");
    metrics::describe_counter!("paygate_runs_finalized_total", "Runs finalized by terminal status");
    metrics::describe_counter!("paygate_attempts_total", "Execute attempts by outcome");
    metrics::describe_counter!("paygate_attempt_retries_total", "Retries of the same candidate");
    metrics::describe_counter!("paygate_candidate_fallbacks_total", "Fallbacks to the next candidate");
    metrics::describe_counter!("paygate_leases_reclaimed_total", "Expired leases by disposition");
    metrics::describe_counter!("paygate_worker_tick_failures_total", "Worker ticks that returned an error");
    metrics::describe_histogram!("paygate_attempt_latency_ms", "Execute attempt latency");
    metrics::describe_histogram!("paygate_run_duration_ms", "Claim-to-finalize duration");

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

/// Mirrors lifecycle events into the debug log.
fn spawn_event_logger(event_bus: &EventBus) {
    let mut receiver = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => debug!(run_id = %event.run_id(), event = ?event, "Orchestration event"),
                Err(EventBusError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind");
                }
                Err(_) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
