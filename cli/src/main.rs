// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Paygate Orchestrator CLI
//!
//! The `paygate` binary hosts the orchestration core and talks to a running
//! instance.
//!
//! ## Commands
//!
//! - `paygate serve` - HTTP API plus queue worker
//! - `paygate worker` - queue worker only (scale-out processes)
//! - `paygate migrate [--dry-run]` - apply the PostgreSQL schema
//! - `paygate config show|validate|generate` - Configuration management
//! - `paygate run submit|cancel|status|list|timeline` - Run operations against a server

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use paygate_core::domain::config::OrchestratorConfigManifest;
use paygate_orchestrator::commands::{self, ConfigCommand, MigrateCommand, RunCommand};
use paygate_orchestrator::daemon;

/// Paygate Orchestrator - durable multi-step orchestration of paid service calls
#[derive(Parser)]
#[command(name = "paygate")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "PAYGATE_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Environment file loaded before configuration (default: ./.env)
    #[arg(long, global = true, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Server host used by `run` commands
    #[arg(long, global = true, env = "PAYGATE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Server port used by `run` commands (default: spec.network.port)
    #[arg(long, global = true, env = "PAYGATE_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error); default: spec.observability.logging.level
    #[arg(long, global = true, env = "PAYGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json); default: spec.observability.logging.format
    #[arg(long, global = true, env = "PAYGATE_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the queue worker
    #[command(name = "serve")]
    Serve {
        /// Serve the API without consuming the queue
        #[arg(long)]
        no_worker: bool,
    },

    /// Run only the queue worker
    #[command(name = "worker")]
    Worker,

    /// Apply database migrations
    #[command(name = "migrate")]
    Migrate {
        #[command(flatten)]
        command: MigrateCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Run operations against a running server
    #[command(name = "run")]
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    load_env_file(cli.env_file.as_deref())?;

    // `config` commands report load errors themselves
    if let Some(Commands::Config { command }) = cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("warn"), cli.log_format.as_deref().unwrap_or("text"))?;
        return commands::config::handle_command(command, cli.config).await;
    }

    let config = OrchestratorConfigManifest::load_or_default(cli.config.clone())
        .context("Failed to load configuration")?;
    let logging = &config.spec.observability.logging;
    init_logging(
        cli.log_level.as_deref().unwrap_or(&logging.level),
        cli.log_format.as_deref().unwrap_or(&logging.format),
    )?;
    let port = cli.port.unwrap_or(config.spec.network.port);

    match cli.command {
        Some(Commands::Serve { no_worker }) => {
            daemon::start_server(config, daemon::ServeMode { api: true, worker: !no_worker }).await
        }
        Some(Commands::Worker) => {
            daemon::start_server(config, daemon::ServeMode { api: false, worker: true }).await
        }
        Some(Commands::Migrate { command }) => commands::migrate::execute(command, &config).await,
        Some(Commands::Run { command }) => commands::run::handle_command(command, &cli.host, port).await,
        Some(Commands::Config { .. }) => Ok(()),
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// A missing file is fine; a malformed one is not.
fn load_env_file(path: Option<&std::path::Path>) -> Result<()> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|_| ()),
        None => dotenvy::dotenv().map(|_| ()),
    };
    match loaded {
        Ok(()) => Ok(()),
        Err(dotenvy::Error::Io(_)) if path.is_none() => Ok(()),
        Err(e) => Err(e).context("Failed to load environment file"),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}
