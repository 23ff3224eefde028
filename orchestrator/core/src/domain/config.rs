// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) covering:
// - Worker polling, lease and timeout settings
// - Storage backend selection
// - Execute capability endpoint
// - Network and observability settings
// - Config-level retry policy defaults

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::repository::{PostgresConfig, StorageBackend};
use crate::domain::retry_policy::{RetryPolicy, RetryPolicyOverride};
use crate::domain::validation::validate_retry_override;

pub const API_VERSION: &str = "paygate.dev/v1";
pub const KIND: &str = "OrchestratorConfig";
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Top-level configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfigManifest {
    /// API version (must be "paygate.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "OrchestratorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: OrchestratorConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable deployment name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfigSpec {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub execute: ExecuteConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Applied beneath per-step overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_defaults: Option<RetryPolicyOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Run the background worker in this process
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A `running` queue entry whose lock is older than this is reclaimed
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,

    /// Upper bound for one Execute call; 0 disables the bound
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Requeue delay after a worker-internal failure
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_claim_attempts: default_max_claim_attempts(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_ms > 0).then(|| Duration::from_millis(self.attempt_timeout_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::InMemory,
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteConfig {
    /// Base URL of the service exposing the Execute capability
    #[serde(default = "default_execute_base_url")]
    pub base_url: String,

    #[serde(default = "default_execute_path")]
    pub path: String,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            base_url: default_execute_base_url(),
            path: default_execute_path(),
        }
    }
}

impl ExecuteConfig {
    pub fn endpoint(&self) -> anyhow::Result<url::Url> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid execute base_url '{}': {}", self.base_url, e))?;
        base.join(&self.path)
            .map_err(|e| anyhow::anyhow!("Invalid execute path '{}': {}", self.path, e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus exposition
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_timeout_ms() -> u64 {
    300_000
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_claim_attempts() -> u32 {
    5
}

fn default_max_connections() -> u32 {
    5
}

fn default_execute_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_execute_path() -> String {
    "/v1/payments/execute".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for OrchestratorConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "paygate-orchestrator".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: OrchestratorConfigSpec::default(),
        }
    }
}

impl OrchestratorConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. PAYGATE_CONFIG_PATH environment variable
    /// 2. ./paygate-config.yaml (working directory)
    /// 3. ~/.paygate/config.yaml (user home)
    /// 4. /etc/paygate/config.yaml (system, Unix) or C:\ProgramData\Paygate\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PAYGATE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./paygate-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".paygate").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/paygate/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Paygate\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails hard when missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Container deployments override the file through the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PAYGATE_DATABASE_URL").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: PAYGATE_DATABASE_URL");
            self.spec.storage.database_url = Some(url);
            self.spec.storage.backend = StorageBackendKind::Postgres;
        }

        if let Some(url) = lookup("PAYGATE_EXECUTE_BASE_URL").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: PAYGATE_EXECUTE_BASE_URL={}", url);
            self.spec.execute.base_url = url;
        }

        if let Some(val) = lookup("PAYGATE_POLL_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Environment override: PAYGATE_POLL_INTERVAL_MS={}", ms);
                    self.spec.worker.poll_interval_ms = ms.max(MIN_POLL_INTERVAL_MS);
                }
                Err(_) => tracing::warn!(
                    "Invalid value for PAYGATE_POLL_INTERVAL_MS: '{}'. Expected milliseconds. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("PAYGATE_LEASE_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Environment override: PAYGATE_LEASE_TIMEOUT_MS={}", ms);
                    self.spec.worker.lease_timeout_ms = ms;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for PAYGATE_LEASE_TIMEOUT_MS: '{}'. Expected milliseconds. Ignoring.",
                    val
                ),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let worker = &self.spec.worker;
        if worker.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            anyhow::bail!(
                "spec.worker.poll_interval_ms must be at least {} (got {})",
                MIN_POLL_INTERVAL_MS,
                worker.poll_interval_ms
            );
        }
        if worker.lease_timeout_ms == 0 {
            anyhow::bail!("spec.worker.lease_timeout_ms must be greater than 0");
        }
        if worker.max_claim_attempts == 0 {
            anyhow::bail!("spec.worker.max_claim_attempts must be at least 1");
        }

        if self.spec.storage.backend == StorageBackendKind::Postgres
            && self.spec.storage.database_url.as_deref().unwrap_or("").is_empty()
        {
            anyhow::bail!("spec.storage.database_url is required for the postgres backend");
        }
        if self.spec.storage.max_connections == 0 {
            anyhow::bail!("spec.storage.max_connections must be at least 1");
        }

        self.spec.execute.endpoint()?;

        if let Some(defaults) = &self.spec.retry_defaults {
            validate_retry_override(defaults)
                .map_err(|e| anyhow::anyhow!("spec.retry_defaults: {}", e))?;
        }

        Ok(())
    }

    pub fn storage_backend(&self) -> anyhow::Result<StorageBackend> {
        match self.spec.storage.backend {
            StorageBackendKind::InMemory => Ok(StorageBackend::InMemory),
            StorageBackendKind::Postgres => {
                let connection_string = self
                    .spec
                    .storage
                    .database_url
                    .clone()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("spec.storage.database_url is not set"))?;
                Ok(StorageBackend::PostgreSQL(PostgresConfig {
                    connection_string,
                    max_connections: self.spec.storage.max_connections,
                }))
            }
        }
    }

    /// Policy every step starts from before its own override is layered on.
    pub fn retry_defaults(&self) -> RetryPolicy {
        RetryPolicy::from_override(self.spec.retry_defaults.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = OrchestratorConfigManifest::default();
        assert_eq!(manifest.api_version, "paygate.dev/v1");
        assert_eq!(manifest.kind, "OrchestratorConfig");
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.worker.poll_interval_ms, 500);
        assert_eq!(manifest.spec.network.port, 3000);
        assert_eq!(manifest.spec.storage.backend, StorageBackendKind::InMemory);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: paygate.dev/v1
kind: OrchestratorConfig
metadata:
  name: gateway-eu
spec:
  worker:
    poll_interval_ms: 250
  storage:
    backend: postgres
    database_url: postgres://paygate@localhost/paygate
  retry_defaults:
    maxRetries: 3
"#;
        let manifest = OrchestratorConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.worker.poll_interval_ms, 250);
        assert_eq!(manifest.spec.worker.lease_timeout_ms, 300_000);
        assert_eq!(manifest.spec.execute.path, "/v1/payments/execute");
        assert_eq!(manifest.retry_defaults().max_retries, 3);
        assert_eq!(manifest.retry_defaults().backoff_ms, 250);
        assert!(manifest.validate().is_ok());
        assert!(matches!(
            manifest.storage_backend().unwrap(),
            StorageBackend::PostgreSQL(PostgresConfig { max_connections: 5, .. })
        ));
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paygate-config.yaml");

        let mut manifest = OrchestratorConfigManifest::default();
        manifest.metadata.name = "roundtrip".to_string();
        manifest.spec.worker.attempt_timeout_ms = 0;
        manifest.to_yaml_file(&path).unwrap();

        let loaded = OrchestratorConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "roundtrip");
        assert_eq!(loaded.spec.worker.attempt_timeout(), None);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(OrchestratorConfigManifest::load_or_default(Some(missing)).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = OrchestratorConfigManifest::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("PAYGATE_DATABASE_URL", "postgres://localhost/pg"),
            ("PAYGATE_EXECUTE_BASE_URL", "http://gateway:8080"),
            ("PAYGATE_POLL_INTERVAL_MS", "20"),
            ("PAYGATE_LEASE_TIMEOUT_MS", "not-a-number"),
        ]);
        manifest.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(manifest.spec.storage.backend, StorageBackendKind::Postgres);
        assert_eq!(manifest.spec.execute.base_url, "http://gateway:8080");
        assert_eq!(manifest.spec.worker.poll_interval_ms, 100);
        assert_eq!(manifest.spec.worker.lease_timeout_ms, 300_000);
        assert_eq!(
            manifest.spec.execute.endpoint().unwrap().as_str(),
            "http://gateway:8080/v1/payments/execute"
        );
    }

    #[test]
    fn test_validation() {
        let mut manifest = OrchestratorConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.worker.poll_interval_ms = 50;
        assert!(manifest.validate().is_err());
        manifest.spec.worker.poll_interval_ms = 500;

        manifest.spec.storage.backend = StorageBackendKind::Postgres;
        assert!(manifest.validate().is_err());
        manifest.spec.storage.backend = StorageBackendKind::InMemory;

        manifest.spec.execute.base_url = "not a url".to_string();
        assert!(manifest.validate().is_err());
        manifest.spec.execute.base_url = "http://127.0.0.1:3000".to_string();

        manifest.spec.retry_defaults = Some(RetryPolicyOverride {
            max_retries: Some(9),
            ..Default::default()
        });
        assert!(manifest.validate().is_err());
    }
}
