//! Engine configuration types for flowrun.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! controls admission, progress-log limits, redirect bounds, the agent
//! command and logging output.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.flowrun/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on concurrently executing run loops.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Progress appends are skipped once the log exceeds this size.
    #[serde(default = "default_progress_log_limit_bytes")]
    pub progress_log_limit_bytes: u64,

    /// Redirect-retries a single failing step may trigger.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Capacity of the run event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_progress_log_limit_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_redirects() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            progress_log_limit_bytes: default_progress_log_limit_bytes(),
            max_redirects: default_max_redirects(),
            event_capacity: default_event_capacity(),
            agent: AgentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// How steps reach an agent.
///
/// Without a `command` the deterministic echo executor is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Program and leading arguments, e.g. `["claude", "-p"]`.
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_agent_timeout_secs() -> u64 {
    900
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,

    /// Export spans through the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub otel: bool,
}
