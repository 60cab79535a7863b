//! Application configuration for StoryCrew.
//!
//! User config lives at `~/.storycrew/storycrew.toml`.
//! CLI flags override config file values, which override defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StoryCrewError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "storycrew.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".storycrew";

/// Default durable queue database file name.
const QUEUE_DB_NAME: &str = "queue.db";

// ---------------------------------------------------------------------------
// Config structs (matching storycrew.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Job scheduling.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Registry retention policy.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Knowledge-graph service adapter.
    #[serde(default = "default_knowledge_graph")]
    pub knowledge_graph: AdapterSettings,

    /// Content service adapter.
    #[serde(default = "default_content")]
    pub content: AdapterSettings,

    /// OpenRouter settings for stage execution.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Durable queue location.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            retention: RetentionConfig::default(),
            knowledge_graph: default_knowledge_graph(),
            content: default_content(),
            openrouter: OpenRouterConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    /// Check value ranges and URLs after loading.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.max_concurrent_jobs == 0 {
            return Err(StoryCrewError::config(
                "dispatcher.max_concurrent_jobs must be at least 1",
            ));
        }
        if self.dispatcher.summary_limit == 0 {
            return Err(StoryCrewError::config(
                "dispatcher.summary_limit must be at least 1",
            ));
        }
        if self.retention.max_jobs == Some(0) {
            return Err(StoryCrewError::config("retention.max_jobs must be at least 1"));
        }
        self.knowledge_graph.validate("knowledge_graph")?;
        self.content.validate("content")?;

        if !(0.0..=2.0).contains(&self.openrouter.temperature) {
            return Err(StoryCrewError::config(
                "openrouter.temperature must be between 0.0 and 2.0",
            ));
        }
        Url::parse(&self.openrouter.base_url).map_err(|e| {
            StoryCrewError::config(format!("openrouter.base_url is not a valid URL: {e}"))
        })?;
        Ok(())
    }
}

/// How submitted jobs reach a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Spawn a task per job on submit.
    #[default]
    Immediate,
    /// Write jobs to the durable queue and let worker loops claim them.
    Queued,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("immediate"),
            Self::Queued => f.write_str("queued"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = StoryCrewError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "queued" => Ok(Self::Queued),
            other => Err(StoryCrewError::config(format!(
                "unknown execution mode '{other}' (expected immediate or queued)"
            ))),
        }
    }
}

/// `[dispatcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on concurrently running jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// Character limit for result summaries.
    #[serde(default = "default_summary_limit")]
    pub summary_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            mode: ExecutionMode::default(),
            summary_limit: default_summary_limit(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_summary_limit() -> usize {
    500
}

/// `[retention]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Age after completion at which terminal jobs are evicted.
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    /// How often the sweeper runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Optional cap on registry size; oldest terminal jobs go first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_jobs: Option<usize>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: default_job_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_jobs: None,
        }
    }
}

impl RetentionConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_job_ttl_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    60
}

/// `[knowledge_graph]` / `[content]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    /// Service root URL.
    pub base_url: String,

    /// Per-attempt request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Serve deterministic fallbacks instead of failing when the service is down.
    #[serde(default = "default_true")]
    pub degraded_mode: bool,

    /// Name of the env var holding a bearer token (never store the token itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl AdapterSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            degraded_mode: true,
            api_key_env: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Bearer token from the configured env var, if any.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(resolve_api_key)
    }

    fn validate(&self, section: &str) -> Result<()> {
        Url::parse(&self.base_url).map_err(|e| {
            StoryCrewError::config(format!("{section}.base_url is not a valid URL: {e}"))
        })?;
        if self.max_attempts == 0 {
            return Err(StoryCrewError::config(format!(
                "{section}.max_attempts must be at least 1"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(StoryCrewError::config(format!(
                "{section}.timeout_secs must be at least 1"
            )));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(StoryCrewError::config(format!(
                "{section}.backoff_base_ms must not exceed backoff_cap_ms"
            )));
        }
        Ok(())
    }
}

fn default_knowledge_graph() -> AdapterSettings {
    AdapterSettings {
        api_key_env: Some("PATHRAG_API_KEY".into()),
        ..AdapterSettings::new("http://localhost:5000")
    }
}
fn default_content() -> AdapterSettings {
    AdapterSettings {
        api_key_env: Some("PAYLOAD_API_KEY".into()),
        ..AdapterSettings::new("http://localhost:3000")
    }
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used when a job does not override it.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_openrouter_url")]
    pub base_url: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_openrouter_url(),
            temperature: default_temperature(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_temperature() -> f64 {
    0.7
}

/// `[queue]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Database file; defaults to `~/.storycrew/queue.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl QueueConfig {
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join(QUEUE_DB_NAME)),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.storycrew/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StoryCrewError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.storycrew/storycrew.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StoryCrewError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        StoryCrewError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StoryCrewError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StoryCrewError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StoryCrewError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a secret from the named env var; empty values count as unset.
pub fn resolve_api_key(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}
