// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Database Migrate Command
//!
//! Applies the embedded orchestration schema (`orchestration_runs`,
//! `orchestration_run_queue`, step outcome and attempt tables).
//!
//! # Usage
//!
//! ```bash
//! # Apply all pending migrations
//! paygate migrate
//!
//! # Preview migrations without applying
//! paygate migrate --dry-run
//! ```
//!
//! # Environment
//!
//! Uses `spec.storage.database_url`, overridable with `PAYGATE_DATABASE_URL`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use paygate_core::domain::config::OrchestratorConfigManifest;
use paygate_core::infrastructure::db::{Database, MIGRATOR};

#[derive(Args)]
pub struct MigrateCommand {
    /// Perform a dry run without applying changes
    #[arg(long)]
    dry_run: bool,
}

pub async fn execute(cmd: MigrateCommand, config: &OrchestratorConfigManifest) -> Result<()> {
    println!("{}", "Paygate Migrate".bold().green());

    let database_url = config
        .spec
        .storage
        .database_url
        .as_deref()
        .context("No database URL configured. Set spec.storage.database_url or PAYGATE_DATABASE_URL.")?;

    println!("Connecting to database...");
    let db = Database::new(database_url, 1).await?;

    // Missing table means nothing applied yet
    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success")
        .fetch_all(db.get_pool())
        .await
        .unwrap_or_default();

    let pending: Vec<_> = MIGRATOR
        .iter()
        .filter(|migration| !applied.contains(&migration.version))
        .collect();

    println!(
        "Migration status: {} applied, {} total available.",
        applied.len(),
        MIGRATOR.iter().count()
    );

    if pending.is_empty() {
        println!("{}", "✓ Database is up to date.".green());
        return Ok(());
    }

    if cmd.dry_run {
        println!("Pending migrations found (Dry Run):");
        for migration in &pending {
            println!(" - {} {}", migration.version, migration.description);
        }
        println!("Skipping application due to --dry-run");
        return Ok(());
    }

    println!("Applying pending migrations...");
    db.migrate().await?;
    println!("{}", "✓ Database updated successfully.".green());

    Ok(())
}
