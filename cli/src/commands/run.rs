// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run commands against a running orchestrator
//!
//! Commands: submit, cancel, status, list, timeline

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use paygate_core::domain::run::RunSubmission;

use crate::daemon::{base_url, check_server_running, OrchestratorClient, ServerStatus};

#[derive(Subcommand)]
pub enum RunCommand {
    /// Submit a run from a JSON or YAML file
    Submit {
        /// Path to the submission file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Request cancellation of a run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Show the summary of a run
    Status {
        /// Run ID
        run_id: String,
    },

    /// List recent runs
    List {
        /// Maximum number of runs to show
        #[arg(long, default_value = "30")]
        limit: usize,
    },

    /// Show the attempt timeline of a run
    Timeline {
        /// Run ID
        run_id: String,
    },
}

pub async fn handle_command(command: RunCommand, host: &str, port: u16) -> Result<()> {
    let url = base_url(host, port);

    match check_server_running(&url).await? {
        ServerStatus::Running { .. } => {}
        ServerStatus::Stopped => {
            anyhow::bail!(
                "Orchestrator is not reachable at {}. Start it with: paygate serve",
                url
            );
        }
        ServerStatus::Unhealthy { error } => {
            anyhow::bail!("Orchestrator at {} is unhealthy: {}", url, error);
        }
    }

    let client = OrchestratorClient::new(url)?;

    match command {
        RunCommand::Submit { file } => submit(&client, &file).await,
        RunCommand::Cancel { run_id } => cancel(&client, &run_id).await,
        RunCommand::Status { run_id } => status(&client, &run_id).await,
        RunCommand::List { limit } => list(&client, limit).await,
        RunCommand::Timeline { run_id } => timeline(&client, &run_id).await,
    }
}

pub fn load_submission(path: &Path) -> Result<RunSubmission> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read submission file: {:?}", path))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    if is_yaml {
        serde_yaml::from_str(&content).context("Failed to parse YAML submission")
    } else {
        serde_json::from_str(&content).context("Failed to parse JSON submission")
    }
}

async fn submit(client: &OrchestratorClient, file: &Path) -> Result<()> {
    let submission = load_submission(file)?;
    let accepted = client.submit_run(&submission).await?;

    println!(
        "{}",
        format!("✓ Run {} queued", text(&accepted["runId"])).green()
    );
    println!("  Workflow: {}", text(&accepted["workflowId"]));
    println!("  Status:   {}", paint_status(&text(&accepted["status"])));

    Ok(())
}

async fn cancel(client: &OrchestratorClient, run_id: &str) -> Result<()> {
    let response = client.cancel_run(run_id).await?;

    println!(
        "{}",
        format!("✓ Cancellation requested for {}", run_id).green()
    );
    println!("  Status: {}", paint_status(&text(&response["status"])));

    Ok(())
}

async fn status(client: &OrchestratorClient, run_id: &str) -> Result<()> {
    let summary = client.run_summary(run_id).await?;

    println!("{}", format!("Run {}", run_id).bold());
    println!("  Workflow:   {}", text(&summary["workflowId"]));
    println!("  Status:     {}", paint_status(&text(&summary["status"])));
    if summary["cancelRequested"].as_bool() == Some(true) {
        println!("  Cancel requested: {}", "yes".yellow());
    }
    println!("  Created:    {}", text(&summary["createdAt"]));
    if let Some(ms) = summary["durationMs"].as_i64() {
        println!("  Duration:   {}ms", ms);
    }
    println!(
        "  Steps:      {}/{} succeeded, {} attempts",
        summary["successfulSteps"],
        summary["stepCount"],
        summary["attemptCount"]
    );

    if let Some(providers) = summary["selectedProviders"].as_array() {
        if !providers.is_empty() {
            println!("  Providers:");
            for provider in providers {
                println!(
                    "    {} -> {}",
                    text(&provider["stepId"]),
                    text(&provider["serviceId"]).cyan()
                );
            }
        }
    }

    if let Some(message) = summary["errorMessage"].as_str() {
        println!("  Error:      {}", message.red());
    }

    Ok(())
}

async fn list(client: &OrchestratorClient, limit: usize) -> Result<()> {
    let runs = client.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<28} {:<20} {:<10} {:>6} {:>9}",
        "RUN ID".bold(),
        "WORKFLOW".bold(),
        "STATUS".bold(),
        "STEPS".bold(),
        "ATTEMPTS".bold()
    );
    for run in &runs {
        println!(
            "{:<28} {:<20} {:<10} {:>6} {:>9}",
            text(&run["runId"]),
            text(&run["workflowId"]),
            paint_status(&text(&run["status"])),
            run["stepCount"],
            run["attemptCount"]
        );
    }

    Ok(())
}

async fn timeline(client: &OrchestratorClient, run_id: &str) -> Result<()> {
    let rows = client.run_timeline(run_id).await?;

    println!("{}", format!("Timeline for {}", run_id).bold());
    for row in &rows {
        let step = text(&row["stepId"]);
        if row["attemptIndex"].is_null() {
            println!("  {} {}", step, "(no attempts)".dimmed());
            continue;
        }

        let outcome = if row["ok"].as_bool() == Some(true) {
            "ok".green()
        } else {
            text(&row["errorCode"]).red()
        };
        println!(
            "  {} #{} {} [{}] {} {}ms",
            step,
            row["attemptIndex"],
            text(&row["serviceId"]),
            row["statusCode"],
            outcome,
            row["latencyMs"]
        );
    }

    Ok(())
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

fn paint_status(status: &str) -> colored::ColoredString {
    match status {
        "completed" => status.green(),
        "failed" => status.red(),
        "cancelled" => status.yellow(),
        "running" => status.cyan(),
        _ => status.normal(),
    }
}
