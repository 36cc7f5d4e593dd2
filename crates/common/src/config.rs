//! Configuration structures for Toolgate
//!
//! This module defines the configuration of the gateway and its supervised worker.
//! Configurations are loaded from YAML files; when no file is given, defaults are
//! overridden by environment variables.

use crate::error::{Result, ToolgateError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolgateConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory with the browser UI (served as static files)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,

    /// Worker process configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Request dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Worker restart policy
    #[serde(default)]
    pub restart: RestartConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executable to run
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments passed to the executable
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Working directory of the worker (defaults to the gateway's)
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables set on the worker
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Variables copied from the gateway's own environment
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,

    /// Inherit the whole gateway environment
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,

    /// Substring the worker prints once it accepts requests
    #[serde(default = "default_readiness_marker")]
    pub readiness_marker: String,
}

/// Request dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long an in-flight request waits for its reply
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Delay before the next rejection while the worker is not healthy
    #[serde(default = "default_unavailable_retry")]
    pub unavailable_retry_ms: u64,

    /// Maximum queued requests (unset = unbounded)
    pub max_queue_size: Option<usize>,

    /// How long shutdown waits for the worker to exit
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Worker restart policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Delay before the first respawn after a failure
    #[serde(default = "default_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the respawn delay
    #[serde(default = "default_backoff")]
    pub max_backoff_ms: u64,

    /// Growth factor applied per consecutive failure (1.0 = fixed delay)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Consecutive failures tolerated before giving up (unset = never)
    pub max_restarts: Option<u32>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_program() -> String {
    "node".to_string()
}

fn default_args() -> Vec<String> {
    vec!["../perplexity-ask/dist/index.js".to_string()]
}

fn default_passthrough_env() -> Vec<String> {
    vec!["PERPLEXITY_API_KEY".to_string(), "GEMINI_API_KEY".to_string()]
}

fn default_inherit_env() -> bool {
    true
}

fn default_readiness_marker() -> String {
    "MCP Server running".to_string()
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_unavailable_retry() -> u64 {
    1_000
}

fn default_shutdown_grace() -> u64 {
    5_000
}

fn default_backoff() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            working_dir: None,
            env: HashMap::new(),
            passthrough_env: default_passthrough_env(),
            inherit_env: default_inherit_env(),
            readiness_marker: default_readiness_marker(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            unavailable_retry_ms: default_unavailable_retry(),
            max_queue_size: None,
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_backoff(),
            max_backoff_ms: default_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_restarts: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl Default for ToolgateConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            static_dir: None,
            worker: WorkerConfig::default(),
            dispatch: DispatchConfig::default(),
            restart: RestartConfig::default(),
            observability: None,
        }
    }
}

impl ToolgateConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ToolgateError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::from_yaml(&content).map_err(|e| {
            ToolgateError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without validating it
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| ToolgateError::Config(e.to_string()))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the env-driven configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ToolgateConfig::default();

        if let Some(addr) = lookup("TOOLGATE_BIND_ADDRESS") {
            config.bind_address = addr;
        }

        if let Some(port) = lookup("TOOLGATE_PORT").or_else(|| lookup("PORT")) {
            config.port = port
                .parse()
                .map_err(|_| ToolgateError::config(format!("Invalid port number: {}", port)))?;
        }

        if let Some(program) = lookup("TOOLGATE_WORKER_PROGRAM") {
            config.worker.program = program;
        }

        if let Some(args) = lookup("TOOLGATE_WORKER_ARGS") {
            config.worker.args = args.split_whitespace().map(str::to_string).collect();
        }

        if let Some(marker) = lookup("TOOLGATE_READINESS_MARKER") {
            config.worker.readiness_marker = marker;
        }

        if let Some(dir) = lookup("TOOLGATE_STATIC_DIR") {
            config.static_dir = Some(PathBuf::from(dir));
        }

        if let Some(timeout) = lookup("TOOLGATE_REQUEST_TIMEOUT_MS") {
            config.dispatch.request_timeout_ms = timeout.parse().map_err(|_| {
                ToolgateError::config(format!("Invalid request timeout: {}", timeout))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker.program.trim().is_empty() {
            return Err(ToolgateError::config("Worker program must not be empty"));
        }

        if self.worker.readiness_marker.is_empty() {
            return Err(ToolgateError::config("Readiness marker must not be empty"));
        }

        if self.dispatch.request_timeout_ms == 0 {
            return Err(ToolgateError::config("Request timeout must be positive"));
        }

        if self.dispatch.unavailable_retry_ms == 0 {
            return Err(ToolgateError::config("Unavailable retry delay must be positive"));
        }

        if self.dispatch.max_queue_size == Some(0) {
            return Err(ToolgateError::config("max_queue_size must be at least 1"));
        }

        let multiplier = self.restart.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ToolgateError::config(format!(
                "Backoff multiplier must be >= 1.0, got {}",
                multiplier
            )));
        }

        if self.restart.max_backoff_ms < self.restart.initial_backoff_ms {
            return Err(ToolgateError::config(
                "max_backoff_ms must not be smaller than initial_backoff_ms",
            ));
        }

        Ok(())
    }

    /// Socket address string the HTTP server binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.request_timeout_ms)
    }

    /// Get unavailable retry delay as Duration
    pub fn unavailable_retry(&self) -> Duration {
        Duration::from_millis(self.dispatch.unavailable_retry_ms)
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.dispatch.shutdown_grace_ms)
    }

    /// Observability settings, falling back to defaults
    pub fn observability(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }
}
