// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use paygate_core::domain::config::OrchestratorConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path (default: ./paygate-config.yaml)
        #[arg(short, long, default_value = "./paygate-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(&output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = OrchestratorConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. PAYGATE_CONFIG_PATH: {}",
            std::env::var("PAYGATE_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./paygate-config.yaml");
        println!("  4. ~/.paygate/config.yaml");
        println!("  5. /etc/paygate/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Worker:".bold());
    println!("  Enabled: {}", spec.worker.enabled);
    println!("  Poll interval: {}ms", spec.worker.poll_interval().as_millis());
    println!("  Lease timeout: {}ms", spec.worker.lease_timeout_ms);
    match spec.worker.attempt_timeout() {
        Some(timeout) => println!("  Attempt timeout: {}ms", timeout.as_millis()),
        None => println!("  Attempt timeout: {}", "(unbounded)".dimmed()),
    }
    println!("  Max claim attempts: {}", spec.worker.max_claim_attempts);
    println!();

    println!("{}", "Storage:".bold());
    println!("  Backend: {:?}", spec.storage.backend);
    println!(
        "  Database URL: {}",
        if spec.storage.database_url.is_some() { "(set)" } else { "(not set)" }
    );
    println!();

    println!("{}", "Execute capability:".bold());
    println!("  Endpoint: {}{}", spec.execute.base_url, spec.execute.path);
    println!();

    let retry = config.retry_defaults();
    println!("{}", "Retry defaults:".bold());
    println!("  Max retries: {}", retry.max_retries);
    println!(
        "  Backoff: {}ms x{} (cap {}ms)",
        retry.backoff_ms, retry.backoff_multiplier, retry.max_backoff_ms
    );
    println!("  Retryable status codes: {:?}", retry.retryable_status_codes);
    println!("  Retryable error codes: {:?}", retry.retryable_error_codes);
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = OrchestratorConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    OrchestratorConfigManifest::default()
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generated_config_round_trips_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paygate-config.yaml");

        generate(&path, false).await.unwrap();
        let loaded = OrchestratorConfigManifest::from_yaml_file(&path).unwrap();

        loaded.validate().unwrap();
        assert_eq!(loaded.spec.network.port, 3000);
    }

    #[tokio::test]
    async fn test_generate_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.yaml");
        std::fs::write(&path, "keep me").unwrap();

        assert!(generate(&path, false).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");

        generate(&path, true).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("OrchestratorConfig"));
    }
}
