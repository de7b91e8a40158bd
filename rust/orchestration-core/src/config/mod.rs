//! Configuration management for the orchestration core.
//!
//! Configuration is loaded from defaults, an optional config file and
//! environment variables, then validated:
//!
//! ```rust,ignore
//! use orchestration_core::config::AppConfig;
//!
//! let config = AppConfig::load(None)?;
//! ```
//!
//! Environment variables use the `ORCHESTRATOR` prefix with `__` as the
//! section separator, e.g. `ORCHESTRATOR__WORKERS__MAX_CONCURRENT_WORKERS=16`
//! or `ORCHESTRATOR__AGENTS__COVER_LETTER__TIMEOUT_MS=90000`.

pub mod error;
pub mod validator;

pub use error::{env_var, ConfigResult, ConfigurationError, ENV_PREFIX};
pub use validator::ConfigValidator;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

/// Base URL agents are addressed under when no endpoint is configured.
pub const DEFAULT_AGENT_BASE_URL: &str = "http://localhost:9000/agents";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker pool and queue settings.
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Workflow engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Base URL for default agent endpoints.
    #[serde(default = "default_agent_base_url")]
    pub agent_base_url: String,
    /// Per-agent overrides keyed by snake_case agent tag.
    #[serde(default)]
    pub agents: HashMap<String, AgentOverride>,
    /// Workflow template sources.
    #[serde(default)]
    pub workflows: WorkflowsConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_agent_base_url() -> String {
    DEFAULT_AGENT_BASE_URL.to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: WorkerConfig::default(),
            engine: EngineConfig::default(),
            agent_base_url: default_agent_base_url(),
            agents: HashMap::new(),
            workflows: WorkflowsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment and config files, then validate.
    ///
    /// Sources, lowest precedence first:
    /// 1. Default values
    /// 2. `config/orchestrator.{yaml,toml,json}` if present
    /// 3. `path`, if given (must exist)
    /// 4. Environment variables
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(path)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .set_default("agent_base_url", DEFAULT_AGENT_BASE_URL)?
            .add_source(config::File::with_name("config/orchestrator").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Worker pool and queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker slots processing tasks concurrently.
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
    /// Queue depth beyond which `enqueue` fails fast.
    #[serde(default = "default_queue_depth_ceiling")]
    pub queue_depth_ceiling: usize,
    /// Retries for a task that fails before producing an execution.
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,
    #[serde(default = "default_task_retry_base_ms")]
    pub task_retry_base_ms: u64,
    #[serde(default = "default_task_retry_max_ms")]
    pub task_retry_max_ms: u64,
    /// Finished task states kept for `task_state` lookups; oldest go first.
    #[serde(default = "default_retained_tasks")]
    pub retained_tasks: usize,
    /// Dead letters kept; oldest go first.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_max_concurrent_workers() -> usize {
    8
}

fn default_queue_depth_ceiling() -> usize {
    100
}

fn default_task_max_retries() -> u32 {
    3
}

fn default_task_retry_base_ms() -> u64 {
    500
}

fn default_task_retry_max_ms() -> u64 {
    30_000
}

fn default_retained_tasks() -> usize {
    10_000
}

fn default_dead_letter_capacity() -> usize {
    1_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_max_concurrent_workers(),
            queue_depth_ceiling: default_queue_depth_ceiling(),
            task_max_retries: default_task_max_retries(),
            task_retry_base_ms: default_task_retry_base_ms(),
            task_retry_max_ms: default_task_retry_max_ms(),
            retained_tasks: default_retained_tasks(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn task_backoff(&self) -> Backoff {
        Backoff::new(self.task_retry_base_ms, self.task_retry_max_ms)
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Agent calls in flight at once, across all executions.
    #[serde(default = "default_engine_concurrency")]
    pub engine_concurrency: usize,
    #[serde(default = "default_step_retry_base_ms")]
    pub step_retry_base_ms: u64,
    #[serde(default = "default_step_retry_max_ms")]
    pub step_retry_max_ms: u64,
    /// Settled executions kept for status queries; oldest go first.
    #[serde(default = "default_retained_executions")]
    pub retained_executions: usize,
    /// How long a settled execution stays queryable.
    #[serde(default = "default_execution_ttl_ms")]
    pub execution_ttl_ms: u64,
}

fn default_engine_concurrency() -> usize {
    32
}

fn default_step_retry_base_ms() -> u64 {
    1_000
}

fn default_step_retry_max_ms() -> u64 {
    60_000
}

fn default_retained_executions() -> usize {
    10_000
}

fn default_execution_ttl_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_concurrency: default_engine_concurrency(),
            step_retry_base_ms: default_step_retry_base_ms(),
            step_retry_max_ms: default_step_retry_max_ms(),
            retained_executions: default_retained_executions(),
            execution_ttl_ms: default_execution_ttl_ms(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn step_backoff(&self) -> Backoff {
        Backoff::new(self.step_retry_base_ms, self.step_retry_max_ms)
    }
}

/// Partial per-agent override; unset fields keep the built-in default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOverride {
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub error_threshold_percentage: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub volume_threshold: Option<u32>,
    pub rolling_window_ms: Option<u64>,
}

/// Where extra workflow templates come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsConfig {
    /// Register the built-in job-application templates.
    #[serde(default = "default_true")]
    pub builtin: bool,
    /// Directory of `*.yaml` / `*.yml` templates.
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            definitions_dir: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.workers.max_concurrent_workers, 8);
        assert_eq!(config.workers.queue_depth_ceiling, 100);
        assert_eq!(config.engine.engine_concurrency, 32);
        assert_eq!(config.engine.retained_executions, 10_000);
        assert_eq!(config.workers.dead_letter_capacity, 1_000);
        assert!(config.workflows.builtin);
        assert_eq!(config.agent_base_url, DEFAULT_AGENT_BASE_URL);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_deserialize_partial_yaml() {
        let yaml = r"
workers:
  max_concurrent_workers: 2
agents:
  cover_letter:
    timeout_ms: 90000
    volume_threshold: 10
logging:
  format: json
";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers.max_concurrent_workers, 2);
        assert_eq!(config.workers.queue_depth_ceiling, 100);
        assert_eq!(config.agent_base_url, DEFAULT_AGENT_BASE_URL);
        let cover = &config.agents["cover_letter"];
        assert_eq!(cover.timeout_ms, Some(90_000));
        assert_eq!(cover.volume_threshold, Some(10));
        assert!(cover.endpoint.is_none());
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.yaml");
        std::fs::write(&path, "workers:\n  queue_depth_ceiling: 7\n").unwrap();

        let config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.workers.queue_depth_ceiling, 7);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.yaml");
        std::fs::write(&path, "workers:\n  max_concurrent_workers: 0\n").unwrap();

        let err = AppConfig::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_workers"));
    }
}
