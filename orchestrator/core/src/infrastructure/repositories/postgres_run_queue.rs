// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL Run Queue
//!
//! Durable job table behind the worker pool.
//!
//! # Claiming
//!
//! `claim_next` selects the oldest eligible row with
//! `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the same
//! table and each queued job is handed to exactly one of them. The claim
//! and the run's `queued -> running` transition commit together.
//!
//! # Leases
//!
//! A claimed row keeps `locked_at`. `reclaim_expired` resolves rows whose
//! lock is older than the lease timeout: requeue, fail after too many
//! claims, or finalize `cancelled` when cancellation was requested.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::time::Duration;

use super::postgres_run::{
    load_steps, lock_fenced_entry, lock_run, parse_queue_status, release_entry, write_run,
};
use crate::domain::repository::{RepositoryError, RunQueue};
use crate::domain::run::{
    ClaimedRun, EnqueueOutcome, LeaseDisposition, QueueEntry, QueueStatus, ReclaimedLease, RunId,
    RunResult, RunSubmission, RunTermination, WorkflowId, LEASE_EXHAUSTED, LEASE_EXPIRED,
};

pub struct PostgresRunQueue {
    pool: PgPool,
}

impl PostgresRunQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

fn entry_from_row(row: &PgRow) -> Result<QueueEntry, RepositoryError> {
    let payload: serde_json::Value = row.try_get("payload_json")?;
    let status: String = row.try_get("queue_status")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(QueueEntry {
        run_id: RunId::new(row.try_get::<String, _>("run_id")?),
        workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
        submission: serde_json::from_value(payload)?,
        queue_status: parse_queue_status(&status)?,
        attempts: attempts.max(0) as u32,
        available_at: row.try_get("available_at")?,
        locked_at: row.try_get("locked_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RunQueue for PostgresRunQueue {
    async fn enqueue(&self, submission: &RunSubmission) -> Result<EnqueueOutcome, RepositoryError> {
        let payload = serde_json::to_value(submission)?;
        let mut tx = self.pool.begin().await?;

        // A concurrent insert of the same run id blocks here until the other
        // transaction commits, then falls through to DO NOTHING.
        let inserted = sqlx::query(
            r#"
            INSERT INTO orchestration_runs (run_id, workflow_id, status, ok, cancel_requested, created_at)
            VALUES ($1, $2, 'queued', FALSE, FALSE, NOW())
            ON CONFLICT (run_id) DO NOTHING
            RETURNING run_id
            "#,
        )
        .bind(submission.run_id.as_str())
        .bind(submission.workflow_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert run: {}", e)))?;

        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(EnqueueOutcome::AlreadyExists);
        }

        sqlx::query(
            r#"
            INSERT INTO orchestration_run_queue (
                run_id, workflow_id, payload_json, queue_status, attempts, available_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'queued', 0, NOW(), NOW(), NOW())
            "#,
        )
        .bind(submission.run_id.as_str())
        .bind(submission.workflow_id.as_str())
        .bind(payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert queue entry: {}", e)))?;

        tx.commit().await?;
        Ok(EnqueueOutcome::Accepted)
    }

    async fn claim_next(&self) -> Result<Option<ClaimedRun>, RepositoryError> {
        loop {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(
                r#"
                WITH next_job AS (
                    SELECT q.id
                    FROM orchestration_run_queue q
                    WHERE q.queue_status = 'queued'
                      AND q.available_at <= NOW()
                    ORDER BY q.available_at ASC, q.id ASC
                    LIMIT 1
                    FOR UPDATE OF q SKIP LOCKED
                )
                UPDATE orchestration_run_queue q SET
                    queue_status = 'running',
                    attempts = q.attempts + 1,
                    locked_at = NOW(),
                    updated_at = NOW()
                FROM next_job
                WHERE q.id = next_job.id
                RETURNING q.run_id, q.workflow_id, q.payload_json, q.attempts
                "#,
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to claim queue entry: {}", e)))?;

            let Some(row) = row else {
                tx.rollback().await?;
                return Ok(None);
            };

            let run_id = RunId::new(row.try_get::<String, _>("run_id")?);
            let attempts: i32 = row.try_get("attempts")?;
            let payload: serde_json::Value = row.try_get("payload_json")?;

            let started = sqlx::query(
                r#"
                UPDATE orchestration_runs SET
                    status = 'running',
                    started_at = COALESCE(started_at, NOW()),
                    error_message = NULL
                WHERE run_id = $1 AND status IN ('queued', 'running')
                RETURNING run_id
                "#,
            )
            .bind(run_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            if started.is_none() {
                // Run already terminal: mirror its status onto the entry and keep looking.
                sqlx::query(
                    r#"
                    UPDATE orchestration_run_queue q SET
                        queue_status = r.status,
                        locked_at = NULL,
                        updated_at = NOW()
                    FROM orchestration_runs r
                    WHERE q.run_id = $1 AND r.run_id = q.run_id
                    "#,
                )
                .bind(run_id.as_str())
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                tracing::warn!(run_id = %run_id, "Skipped queue entry whose run is already terminal");
                continue;
            }

            tx.commit().await?;

            return Ok(Some(ClaimedRun {
                workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                submission: serde_json::from_value(payload)?,
                claim_token: attempts.max(0) as u32,
                run_id,
            }));
        }
    }

    async fn requeue(&self, claim: &ClaimedRun, error: &str, delay: Duration) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE orchestration_run_queue SET
                queue_status = 'queued',
                available_at = NOW() + ($2::BIGINT * INTERVAL '1 millisecond'),
                locked_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE run_id = $1 AND queue_status = 'running' AND attempts = $4
            "#,
        )
        .bind(claim.run_id.as_str())
        .bind(millis(delay))
        .bind(error)
        .bind(claim.claim_token as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to requeue {}: {}", claim.run_id, e)))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::lease_lost(&claim.run_id));
        }
        Ok(())
    }

    async fn fail(&self, claim: &ClaimedRun, error: &str) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        lock_fenced_entry(&mut tx, claim).await?;

        let mut run = lock_run(&mut tx, &claim.run_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("run {}", claim.run_id)))?;
        let steps = load_steps(&mut tx, &claim.run_id).await?;
        run.fail(error, Utc::now())
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        run.run_output = Some(crate::domain::run::RunOutput::from_steps(&steps));

        write_run(&mut tx, &run).await?;
        release_entry(&mut tx, &claim.run_id, QueueStatus::Failed, Some(error)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_claim_attempts: u32,
    ) -> Result<Vec<ReclaimedLease>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let expired = sqlx::query(
            r#"
            SELECT run_id, attempts
            FROM orchestration_run_queue
            WHERE queue_status = 'running'
              AND (locked_at IS NULL OR locked_at <= NOW() - ($1::BIGINT * INTERVAL '1 millisecond'))
            ORDER BY id ASC
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(millis(lease_timeout))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to scan expired leases: {}", e)))?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for row in &expired {
            let run_id = RunId::new(row.try_get::<String, _>("run_id")?);
            let attempts = row.try_get::<i32, _>("attempts")?.max(0) as u32;
            let now = Utc::now();

            let Some(mut run) = lock_run(&mut tx, &run_id).await? else {
                continue;
            };

            let disposition = if run.cancel_requested {
                let result = RunResult {
                    run_id: run.run_id.clone(),
                    workflow_id: run.workflow_id.clone(),
                    termination: RunTermination::Cancelled,
                    steps: load_steps(&mut tx, &run_id).await?,
                };
                if run.finalize(&result, now).is_ok() {
                    write_run(&mut tx, &run).await?;
                }
                release_entry(&mut tx, &run_id, QueueStatus::Cancelled, Some(LEASE_EXPIRED)).await?;
                LeaseDisposition::Cancelled
            } else if attempts >= max_claim_attempts {
                let steps = load_steps(&mut tx, &run_id).await?;
                if run.fail(LEASE_EXHAUSTED, now).is_ok() {
                    run.run_output = Some(crate::domain::run::RunOutput::from_steps(&steps));
                    write_run(&mut tx, &run).await?;
                }
                release_entry(&mut tx, &run_id, QueueStatus::Failed, Some(LEASE_EXHAUSTED)).await?;
                LeaseDisposition::Failed
            } else {
                sqlx::query(
                    r#"
                    UPDATE orchestration_run_queue SET
                        queue_status = 'queued',
                        available_at = NOW(),
                        locked_at = NULL,
                        last_error = $2,
                        updated_at = NOW()
                    WHERE run_id = $1
                    "#,
                )
                .bind(run_id.as_str())
                .bind(LEASE_EXPIRED)
                .execute(&mut *tx)
                .await?;
                LeaseDisposition::Requeued
            };

            reclaimed.push(ReclaimedLease {
                run_id,
                claim_attempts: attempts,
                disposition,
            });
        }

        tx.commit().await?;
        Ok(reclaimed)
    }

    async fn find_entry(&self, run_id: &RunId) -> Result<Option<QueueEntry>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, workflow_id, payload_json, queue_status, attempts, available_at,
                   locked_at, last_error, created_at, updated_at
            FROM orchestration_run_queue
            WHERE run_id = $1
            "#,
        )
        .bind(run_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }
}
