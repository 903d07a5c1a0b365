//! Configuration loading and validation.
//!
//! Runvoy reads a single human-owned `config.toml` (default
//! `~/.runvoy/config.toml`). Every section is optional and falls back to the
//! defaults below. A small set of `RUNVOY_*` environment variables override
//! file values; see [`Config::apply_overrides`].

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Persistence backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Role permission table.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Execution timeouts and event plumbing.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Container limits for the Docker task manager.
    #[serde(default)]
    pub docker: DockerConfig,

    /// Live-tail URL issuing.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// API-key claim settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-request limits at the boundary.
    #[serde(default)]
    pub request: RequestConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which repository implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite database file.
    #[default]
    Sqlite,
    /// Process-local maps; nothing survives a restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("unknown storage backend {other:?}")),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Repository implementation.
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite file; defaults to `runvoy.db` in the config directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Policy table source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// Replacement for the built-in table.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Execution limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout applied when a request sets none.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Largest timeout a request may ask for.
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Capacity of the task event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Container resource limits and naming.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DockerConfig {
    /// Memory limit in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    /// CPU core limit.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,

    /// Docker network mode for execution containers.
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Maximum number of processes per container.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Pull images that are not present locally.
    #[serde(default = "default_true")]
    pub pull_missing: bool,

    /// Container name prefix; names are `<prefix>-<execution id>`.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// User to run as inside the container; the image default when unset.
    #[serde(default)]
    pub user: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            network_mode: default_network_mode(),
            pids_limit: default_pids_limit(),
            pull_missing: true,
            container_prefix: default_container_prefix(),
            user: None,
        }
    }
}

/// Live-tail URL settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Base URL of the log streaming endpoint (`ws://` or `wss://`).
    #[serde(default = "default_websocket_url")]
    pub base_url: String,

    /// Environment variable holding the URL signing key.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,

    /// Lifetime of an issued URL.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            base_url: default_websocket_url(),
            signing_key_env: default_signing_key_env(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

/// API-key claim settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// How long a claim token stays valid.
    #[serde(default = "default_claim_ttl_hours")]
    pub claim_ttl_hours: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            claim_ttl_hours: default_claim_ttl_hours(),
        }
    }
}

/// Per-request limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    /// Deadline for one boundary operation.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rotated JSON logs; defaults to `logs/` in the config directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

// Default value functions for serde

fn default_timeout_secs() -> u64 {
    600
}
fn default_max_timeout_secs() -> u64 {
    14_400
}
fn default_event_buffer() -> usize {
    256
}
fn default_memory_mb() -> u32 {
    1024
}
fn default_cpu_cores() -> f64 {
    1.0
}
fn default_network_mode() -> String {
    "none".to_owned()
}
fn default_pids_limit() -> i64 {
    256
}
fn default_true() -> bool {
    true
}
fn default_container_prefix() -> String {
    "runvoy".to_owned()
}
fn default_websocket_url() -> String {
    "ws://127.0.0.1:8056/logs".to_owned()
}
fn default_signing_key_env() -> String {
    "RUNVOY_STREAM_KEY".to_owned()
}
fn default_token_ttl_secs() -> u64 {
    900
}
fn default_claim_ttl_hours() -> u64 {
    24
}
fn default_deadline_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_owned()
}

impl Config {
    /// Apply `RUNVOY_*` overrides using `lookup` to read variables.
    ///
    /// Recognised variables: `RUNVOY_STORAGE_BACKEND`, `RUNVOY_DATABASE_PATH`,
    /// `RUNVOY_POLICY_FILE`, `RUNVOY_WEBSOCKET_URL`, `RUNVOY_DOCKER_NETWORK`,
    /// `RUNVOY_REQUEST_DEADLINE_SECS`, `RUNVOY_LOG_LEVEL`.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable holds an unparsable value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RUNVOY_STORAGE_BACKEND") {
            self.storage.backend = value.parse()?;
        }
        if let Some(value) = lookup("RUNVOY_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("RUNVOY_POLICY_FILE") {
            self.policy.file = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("RUNVOY_WEBSOCKET_URL") {
            self.websocket.base_url = value;
        }
        if let Some(value) = lookup("RUNVOY_DOCKER_NETWORK") {
            self.docker.network_mode = value;
        }
        if let Some(value) = lookup("RUNVOY_REQUEST_DEADLINE_SECS") {
            self.request.deadline_secs = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("RUNVOY_REQUEST_DEADLINE_SECS={value:?} is not a number: {e}")
            })?;
        }
        if let Some(value) = lookup("RUNVOY_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    /// Reject values that cannot work at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.execution.default_timeout_secs == 0 {
            anyhow::bail!("execution.default_timeout_secs must be positive");
        }
        if self.execution.max_timeout_secs < self.execution.default_timeout_secs {
            anyhow::bail!("execution.max_timeout_secs must be at least default_timeout_secs");
        }
        if self.execution.event_buffer == 0 {
            anyhow::bail!("execution.event_buffer must be positive");
        }
        if self.request.deadline_secs == 0 {
            anyhow::bail!("request.deadline_secs must be positive");
        }
        if self.websocket.token_ttl_secs == 0 {
            anyhow::bail!("websocket.token_ttl_secs must be positive");
        }
        if !self.docker.cpu_cores.is_finite() || self.docker.cpu_cores <= 0.0 {
            anyhow::bail!("docker.cpu_cores must be a positive number");
        }
        if self.docker.container_prefix.trim().is_empty() {
            anyhow::bail!("docker.container_prefix must not be empty");
        }
        Ok(())
    }

    /// SQLite file location, relative to `base` when not configured.
    pub fn database_path(&self, base: &Path) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| base.join("runvoy.db"))
    }

    /// Log directory, relative to `base` when not configured.
    pub fn logs_dir(&self, base: &Path) -> PathBuf {
        self.logging
            .directory
            .clone()
            .unwrap_or_else(|| base.join("logs"))
    }
}

/// Load the configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load the configuration, or the defaults when `path` does not exist.
///
/// # Errors
///
/// Returns an error if an existing file cannot be read or parsed.
pub fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Resolve the default config directory (`~/.runvoy/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".runvoy"))
}
