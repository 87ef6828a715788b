//! Configuration resolution for Hephaestus.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. `<work>/config.toml`
//! 3. Environment variables (highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::WorkPaths;

/// Complete Hephaestus configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_agent_command() -> Vec<String> {
    vec![
        "claude".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AgentsConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Argv of the coordinator agent.
    pub command: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: u32,
    /// Argv shared by every worker.
    pub command: Vec<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 3,
            command: default_agent_command(),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_check_interval_secs: u64,
    /// Restart attempts per recovery before an agent is marked failed.
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    /// Consecutive misses that promote Suspect to Unhealthy.
    pub failure_threshold: u32,
    /// Log silence longer than this many intervals counts as a missed probe.
    pub stale_after_intervals: u32,
    pub probe_timeout_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 5,
            failure_threshold: 3,
            stale_after_intervals: 3,
            probe_timeout_secs: 10,
        }
    }
}

impl MonitoringConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Log silence after which a live agent is considered unresponsive.
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(
            self.health_check_interval_secs
                .saturating_mul(self.stale_after_intervals as u64),
        )
    }
}

/// Process supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub grace_period_secs: u64,
    pub startup_timeout_secs: u64,
    /// Restarts allowed per agent within `restart_window_secs`.
    pub restart_limit: u32,
    pub restart_window_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
            startup_timeout_secs: 10,
            restart_limit: 5,
            restart_window_secs: 300,
        }
    }
}

impl SupervisorConfig {
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub const fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TasksConfig {
    pub max_retries: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::ledger::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Terminal multiplexer used to host agents when available.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub enabled: bool,
    pub binary: String,
    pub session_name: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "tmux".to_string(),
            session_name: "hephaestus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject settings the supervisor and monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.agents.workers.count == 0 {
            return Err(Error::Config("agents.workers.count must be at least 1".into()));
        }
        if self.agents.coordinator.command.is_empty() {
            return Err(Error::Config("agents.coordinator.command is empty".into()));
        }
        if self.agents.workers.command.is_empty() {
            return Err(Error::Config("agents.workers.command is empty".into()));
        }
        if self.monitoring.health_check_interval_secs == 0 {
            return Err(Error::Config(
                "monitoring.health_check_interval_secs must be positive".into(),
            ));
        }
        if self.monitoring.probe_timeout_secs == 0 {
            return Err(Error::Config("monitoring.probe_timeout_secs must be positive".into()));
        }
        if self.monitoring.failure_threshold == 0 {
            return Err(Error::Config("monitoring.failure_threshold must be positive".into()));
        }
        if self.supervisor.startup_timeout_secs == 0 {
            return Err(Error::Config(
                "supervisor.startup_timeout_secs must be positive".into(),
            ));
        }
        if self.multiplexer.enabled && self.multiplexer.session_name.trim().is_empty() {
            return Err(Error::Config("multiplexer.session_name is empty".into()));
        }
        Ok(())
    }

    /// Render as TOML, used by `init` to write the starter file.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("serialize config: {e}")))
    }
}

/// Load `<work>/config.toml` (defaults if absent), apply environment
/// overrides and validate.
pub fn load_config(paths: &WorkPaths) -> Result<Config> {
    let path = paths.config_file();
    let mut config = if path.exists() {
        load_config_file(&path)?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("HEPHAESTUS_WORKERS").and_then(|v| v.parse().ok()) {
        config.agents.workers.count = n;
    }
    if let Some(val) = var("HEPHAESTUS_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(n) = var("HEPHAESTUS_HEALTH_INTERVAL").and_then(|v| v.parse().ok()) {
        config.monitoring.health_check_interval_secs = n;
    }
    if let Some(val) = var("HEPHAESTUS_TMUX") {
        config.multiplexer.enabled = !matches!(
            val.to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        );
    }
}
