// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP API over the orchestration use cases.
//!
//! Submission and cancellation are synchronous; run execution is observed
//! through the read endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::application::cancel_run::{CancelRunError, CancelRunUseCase, StandardCancelRunUseCase};
use crate::application::repository_factory::OrchestrationRepositories;
use crate::application::run_query::RunQueryService;
use crate::application::submit_run::{StandardSubmitRunUseCase, SubmitRunError, SubmitRunUseCase};
use crate::domain::repository::RepositoryError;
use crate::domain::run::{RunId, RunSubmission};
use crate::infrastructure::event_bus::EventBus;

#[derive(Clone)]
pub struct AppState {
    pub submit: Arc<dyn SubmitRunUseCase>,
    pub cancel: Arc<dyn CancelRunUseCase>,
    pub query: RunQueryService,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Standard use cases over one set of repositories.
    pub fn new(repositories: &OrchestrationRepositories, event_bus: Arc<EventBus>) -> Self {
        Self {
            submit: Arc::new(StandardSubmitRunUseCase::new(
                repositories.queue.clone(),
                event_bus.clone(),
            )),
            cancel: Arc::new(StandardCancelRunUseCase::new(repositories.runs.clone(), event_bus)),
            query: RunQueryService::new(repositories.runs.clone()),
            start_time: std::time::Instant::now(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/orchestrations/run", post(submit_run_handler))
        .route("/v1/orchestrations/runs", get(list_runs_handler))
        .route("/v1/orchestrations/runs/{run_id}", get(timeline_handler))
        .route("/v1/orchestrations/runs/{run_id}/summary", get(summary_handler))
        .route("/v1/orchestrations/runs/{run_id}/cancel", post(cancel_run_handler))
        .with_state(Arc::new(state))
}

/// `{ "ok": false, "error": { "message", "details"? } }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({ "message": self.message });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        (self.status, Json(json!({ "ok": false, "error": error }))).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        error!(error = %e, "Repository failure while serving request");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
    }
}

impl From<SubmitRunError> for ApiError {
    fn from(e: SubmitRunError) -> Self {
        match e {
            SubmitRunError::Validation(v) => {
                let details = serde_json::to_value(&v.issues).unwrap_or(Value::Null);
                ApiError::new(StatusCode::BAD_REQUEST, "invalid orchestration request").with_details(details)
            }
            SubmitRunError::Conflict(run_id) => {
                ApiError::new(StatusCode::CONFLICT, format!("run {} already exists", run_id))
            }
            SubmitRunError::Repository(e) => e.into(),
        }
    }
}

impl From<CancelRunError> for ApiError {
    fn from(e: CancelRunError) -> Self {
        match e {
            CancelRunError::NotFound(run_id) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("run {} not found", run_id))
            }
            CancelRunError::AlreadyTerminal { run_id, status } => ApiError::new(
                StatusCode::CONFLICT,
                format!("run {} is already {}", run_id, status),
            )
            .with_details(json!({ "status": status })),
            CancelRunError::Repository(e) => e.into(),
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

async fn submit_run_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RunSubmission>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(submission) = body.map_err(|rejection| {
        ApiError::new(StatusCode::BAD_REQUEST, "invalid orchestration request")
            .with_details(json!([{ "path": "body", "message": rejection.body_text() }]))
    })?;

    let accepted = state.submit.submit(submission).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "ok": true,
            "runId": accepted.run_id,
            "workflowId": accepted.workflow_id,
            "status": accepted.status,
        })),
    ))
}

async fn cancel_run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.cancel.cancel(&RunId::new(run_id)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "ok": true,
            "runId": record.run_id,
            "status": record.run_status,
            "cancelRequested": record.cancel_requested,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.query.list_runs(params.limit).await?;
    Ok(Json(json!({ "ok": true, "runs": runs })))
}

async fn timeline_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run_id = RunId::new(run_id);
    let rows = state.query.timeline(&run_id).await?;
    if rows.is_empty() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("run {} not found", run_id)));
    }
    Ok(Json(json!({ "ok": true, "runId": run_id, "timeline": rows })))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run_id = RunId::new(run_id);
    let summary = state
        .query
        .summary(&run_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("run {} not found", run_id)))?;
    Ok(Json(json!({ "ok": true, "summary": summary })))
}
