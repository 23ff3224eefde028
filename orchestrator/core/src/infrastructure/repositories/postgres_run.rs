// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL Run Repository
//!
//! Run records plus their step outcomes and attempts.
//!
//! # Schema
//!
//! - `orchestration_runs` - one row per run id
//! - `orchestration_step_outcomes` - one row per `(run_id, step_id)`
//! - `orchestration_step_attempts` - one row per `(run_id, step_id, attempt_index)`,
//!   cascading from its step row
//!
//! # Locking
//!
//! Every transaction that touches both a queue entry and its run locks the
//! queue row first and the run row second. Step rows are always written
//! while the queue row lock is held.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use std::collections::HashMap;

use crate::domain::projection::RunListItem;
use crate::domain::repository::{CancellationOutcome, RepositoryError, RunRepository};
use crate::domain::run::{
    Attempt, CancellationDisposition, ClaimedRun, QueueStatus, Run, RunId, RunOutput, RunResult,
    RunStatus, StepOutcome, WorkflowId,
};

pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_run_status(value: &str) -> Result<RunStatus, RepositoryError> {
    RunStatus::parse(value)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown run status '{}'", value)))
}

pub(crate) fn parse_queue_status(value: &str) -> Result<QueueStatus, RepositoryError> {
    QueueStatus::parse(value)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown queue status '{}'", value)))
}

pub(crate) fn run_from_row(row: &PgRow) -> Result<Run, RepositoryError> {
    let status: String = row.try_get("status")?;
    let run_output: Option<serde_json::Value> = row.try_get("run_output")?;
    let run_output = match run_output {
        Some(value) => Some(serde_json::from_value::<RunOutput>(value)?),
        None => None,
    };

    Ok(Run {
        run_id: RunId::new(row.try_get::<String, _>("run_id")?),
        workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
        status: parse_run_status(&status)?,
        ok: row.try_get("ok")?,
        cancel_requested: row.try_get("cancel_requested")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        run_output,
    })
}

const RUN_COLUMNS: &str = "run_id, workflow_id, status, ok, cancel_requested, error_message, \
     run_output, created_at, started_at, completed_at";

pub(crate) async fn lock_run(conn: &mut PgConnection, run_id: &RunId) -> Result<Option<Run>, RepositoryError> {
    let sql = format!(
        "SELECT {} FROM orchestration_runs WHERE run_id = $1 FOR UPDATE",
        RUN_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(run_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

/// Write back every mutable column of a run.
pub(crate) async fn write_run(conn: &mut PgConnection, run: &Run) -> Result<(), RepositoryError> {
    let run_output = run.run_output.as_ref().map(serde_json::to_value).transpose()?;

    sqlx::query(
        r#"
        UPDATE orchestration_runs SET
            status = $2,
            ok = $3,
            cancel_requested = $4,
            error_message = $5,
            run_output = $6,
            started_at = $7,
            completed_at = $8
        WHERE run_id = $1
        "#,
    )
    .bind(run.run_id.as_str())
    .bind(run.status.as_str())
    .bind(run.ok)
    .bind(run.cancel_requested)
    .bind(run.error_message.as_deref())
    .bind(run_output)
    .bind(run.started_at)
    .bind(run.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| RepositoryError::Database(format!("Failed to update run {}: {}", run.run_id, e)))?;

    Ok(())
}

/// Lock the queue row of `claim` and verify the claim still holds its lease.
pub(crate) async fn lock_fenced_entry(conn: &mut PgConnection, claim: &ClaimedRun) -> Result<(), RepositoryError> {
    let row = sqlx::query(
        "SELECT queue_status, attempts FROM orchestration_run_queue WHERE run_id = $1 FOR UPDATE",
    )
    .bind(claim.run_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Err(RepositoryError::NotFound(format!("queue entry {}", claim.run_id)));
    };
    let status = parse_queue_status(&row.try_get::<String, _>("queue_status")?)?;
    let attempts: i32 = row.try_get("attempts")?;

    if status != QueueStatus::Running || attempts as i64 != claim.claim_token as i64 {
        return Err(RepositoryError::lease_lost(&claim.run_id));
    }
    Ok(())
}

pub(crate) async fn release_entry(
    conn: &mut PgConnection,
    run_id: &RunId,
    status: QueueStatus,
    last_error: Option<&str>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        UPDATE orchestration_run_queue SET
            queue_status = $2,
            locked_at = NULL,
            last_error = COALESCE($3, last_error),
            updated_at = NOW()
        WHERE run_id = $1
        "#,
    )
    .bind(run_id.as_str())
    .bind(status.as_str())
    .bind(last_error)
    .execute(&mut *conn)
    .await
    .map_err(|e| RepositoryError::Database(format!("Failed to release queue entry {}: {}", run_id, e)))?;
    Ok(())
}

async fn insert_step(conn: &mut PgConnection, run_id: &RunId, step: &StepOutcome) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO orchestration_step_outcomes (run_id, step_id, step_index, succeeded, chosen_service_id, updated_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(run_id.as_str())
    .bind(&step.step_id)
    .bind(step.step_index as i32)
    .bind(step.succeeded)
    .bind(step.chosen_service_id.as_deref())
    .execute(&mut *conn)
    .await
    .map_err(|e| RepositoryError::Database(format!("Failed to insert step {}: {}", step.step_id, e)))?;

    for attempt in &step.attempts {
        sqlx::query(
            r#"
            INSERT INTO orchestration_step_attempts (
                run_id, step_id, attempt_index, service_id, request_id, payment_proof,
                ok, status_code, error_code, response_json, started_at, completed_at, latency_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run_id.as_str())
        .bind(&step.step_id)
        .bind(attempt.attempt_index as i32)
        .bind(&attempt.service_id)
        .bind(&attempt.request_id)
        .bind(&attempt.payment_proof)
        .bind(attempt.ok)
        .bind(attempt.status_code as i32)
        .bind(attempt.error_code.as_deref())
        .bind(&attempt.response)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .bind(attempt.latency_ms.min(i64::MAX as u64) as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert attempt {}: {}", attempt.request_id, e)))?;
    }
    Ok(())
}

/// Replace the rows of one step.
pub(crate) async fn replace_step(conn: &mut PgConnection, run_id: &RunId, step: &StepOutcome) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM orchestration_step_outcomes WHERE run_id = $1 AND step_id = $2")
        .bind(run_id.as_str())
        .bind(&step.step_id)
        .execute(&mut *conn)
        .await?;
    insert_step(conn, run_id, step).await
}

fn attempt_from_row(row: &PgRow) -> Result<Attempt, RepositoryError> {
    let attempt_index: i32 = row.try_get("attempt_index")?;
    let status_code: i32 = row.try_get("status_code")?;
    let latency_ms: i64 = row.try_get("latency_ms")?;
    let started_at: DateTime<Utc> = row.try_get("started_at")?;
    let completed_at: DateTime<Utc> = row.try_get("completed_at")?;

    Ok(Attempt {
        attempt_index: attempt_index.max(0) as u32,
        service_id: row.try_get("service_id")?,
        request_id: row.try_get("request_id")?,
        payment_proof: row.try_get("payment_proof")?,
        ok: row.try_get("ok")?,
        status_code: u16::try_from(status_code).unwrap_or(0),
        error_code: row.try_get("error_code")?,
        response: row.try_get("response_json")?,
        started_at,
        completed_at,
        latency_ms: latency_ms.max(0) as u64,
    })
}

pub(crate) async fn load_steps(conn: &mut PgConnection, run_id: &RunId) -> Result<Vec<StepOutcome>, RepositoryError> {
    let step_rows = sqlx::query(
        r#"
        SELECT step_id, step_index, succeeded, chosen_service_id
        FROM orchestration_step_outcomes
        WHERE run_id = $1
        ORDER BY step_index ASC
        "#,
    )
    .bind(run_id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let attempt_rows = sqlx::query(
        r#"
        SELECT step_id, attempt_index, service_id, request_id, payment_proof, ok, status_code,
               error_code, response_json, started_at, completed_at, latency_ms
        FROM orchestration_step_attempts
        WHERE run_id = $1
        ORDER BY step_id ASC, attempt_index ASC
        "#,
    )
    .bind(run_id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut attempts: HashMap<String, Vec<Attempt>> = HashMap::new();
    for row in &attempt_rows {
        let step_id: String = row.try_get("step_id")?;
        attempts.entry(step_id).or_default().push(attempt_from_row(row)?);
    }

    let mut steps = Vec::with_capacity(step_rows.len());
    for row in &step_rows {
        let step_id: String = row.try_get("step_id")?;
        let step_index: i32 = row.try_get("step_index")?;
        steps.push(StepOutcome {
            attempts: attempts.remove(&step_id).unwrap_or_default(),
            step_id,
            step_index: step_index.max(0) as u32,
            succeeded: row.try_get("succeeded")?,
            chosen_service_id: row.try_get("chosen_service_id")?,
        });
    }
    Ok(steps)
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    async fn find_by_id(&self, run_id: &RunId) -> Result<Option<Run>, RepositoryError> {
        let sql = format!("SELECT {} FROM orchestration_runs WHERE run_id = $1", RUN_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to load run {}: {}", run_id, e)))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn is_cancellation_requested(&self, run_id: &RunId) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT cancel_requested FROM orchestration_runs WHERE run_id = $1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("cancel_requested")?),
            None => Err(RepositoryError::NotFound(format!("run {}", run_id))),
        }
    }

    async fn request_cancellation(&self, run_id: &RunId) -> Result<Option<CancellationOutcome>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // queue row before run row
        sqlx::query("SELECT id FROM orchestration_run_queue WHERE run_id = $1 FOR UPDATE")
            .bind(run_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(mut run) = lock_run(&mut tx, run_id).await? else {
            return Ok(None);
        };

        let disposition = run.request_cancellation(Utc::now());
        match disposition {
            CancellationDisposition::AlreadyTerminal => {}
            CancellationDisposition::Flagged => {
                write_run(&mut tx, &run).await?;
            }
            CancellationDisposition::CancelledBeforeClaim => {
                write_run(&mut tx, &run).await?;
                release_entry(&mut tx, run_id, QueueStatus::Cancelled, None).await?;
            }
        }

        tx.commit().await?;
        Ok(Some(CancellationOutcome { run, disposition }))
    }

    async fn record_step(&self, claim: &ClaimedRun, step: &StepOutcome) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_fenced_entry(&mut tx, claim).await?;
        replace_step(&mut tx, &claim.run_id, step).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn finalize(&self, claim: &ClaimedRun, result: &RunResult) -> Result<Run, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_fenced_entry(&mut tx, claim).await?;

        let mut run = lock_run(&mut tx, &claim.run_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("run {}", claim.run_id)))?;
        run.finalize(result, Utc::now())
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;

        // Steps this claim never reached keep the rows an earlier claim wrote.
        for step in &result.steps {
            replace_step(&mut tx, &claim.run_id, step).await?;
        }
        run.run_output = Some(RunOutput::from_steps(&load_steps(&mut tx, &claim.run_id).await?));
        write_run(&mut tx, &run).await?;
        release_entry(&mut tx, &claim.run_id, result.termination.into(), None).await?;

        tx.commit().await?;
        Ok(run)
    }

    async fn step_outcomes(&self, run_id: &RunId) -> Result<Vec<StepOutcome>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_steps(&mut conn, run_id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<RunListItem>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT r.run_id, r.workflow_id, r.status, r.ok, r.cancel_requested, r.error_message,
                   r.created_at, r.started_at, r.completed_at,
                   (SELECT COUNT(*) FROM orchestration_step_outcomes s WHERE s.run_id = r.run_id) AS step_count,
                   (SELECT COUNT(*) FROM orchestration_step_attempts a WHERE a.run_id = r.run_id) AS attempt_count
            FROM orchestration_runs r
            ORDER BY r.created_at DESC, r.run_id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to list runs: {}", e)))?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let step_count: i64 = row.try_get("step_count")?;
                let attempt_count: i64 = row.try_get("attempt_count")?;
                Ok(RunListItem {
                    run_id: RunId::new(row.try_get::<String, _>("run_id")?),
                    workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                    status: parse_run_status(&status)?,
                    ok: row.try_get("ok")?,
                    cancel_requested: row.try_get("cancel_requested")?,
                    error_message: row.try_get("error_message")?,
                    created_at: row.try_get("created_at")?,
                    started_at: row.try_get("started_at")?,
                    completed_at: row.try_get("completed_at")?,
                    step_count: step_count.max(0) as u64,
                    attempt_count: attempt_count.max(0) as u64,
                })
            })
            .collect()
    }
}
