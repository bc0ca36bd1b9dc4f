//! Daemon configuration types and loading
//!
//! Keys follow the on-disk camelCase surface. Unknown keys are ignored
//! with a warning; a missing or malformed file falls back to defaults.
//! Configuration problems never crash startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Name of the state directory inside a project
pub const STATE_DIR: &str = ".apex";
/// Config file name inside the state directory
pub const CONFIG_FILE: &str = "config.yaml";

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub daemon: DaemonConfig,
    pub limits: LimitsConfig,
    /// Workflow name -> ordered stage list (loaded, not defined, here)
    pub workflows: HashMap<String, Vec<String>>,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, then
    /// `<project>/.apex/config.yaml`, then the user config
    /// (`~/.config/apex/config.yaml`), then defaults.
    pub fn load(project_dir: &Path, explicit: Option<&PathBuf>) -> Self {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let project_config = project_dir.join(STATE_DIR).join(CONFIG_FILE);
        if project_config.exists() {
            return Self::load_from_file(&project_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("apex").join(CONFIG_FILE);
            if user_config.exists() {
                return Self::load_from_file(&user_config);
            }
        }

        info!("No config file found, using defaults");
        Self::default()
    }

    fn load_from_file(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config file, using defaults");
                return Self::default();
            }
        };

        let raw: serde_yaml::Value = match serde_yaml::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse config file, using defaults");
                return Self::default();
            }
        };

        warn_unknown_keys(&raw);

        match serde_yaml::from_value(raw) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded config");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Invalid config values, using defaults");
                Self::default()
            }
        }
    }

    /// The state directory for a project
    pub fn state_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR)
    }
}

/// `daemon:` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Scheduler tick in milliseconds
    pub poll_interval_ms: u64,
    /// Service-manager hint; the core ignores it
    pub install_as_service: bool,
    /// Graceful-stop grace window in milliseconds
    pub stop_timeout_ms: u64,
    pub time_based_usage: TimeBasedUsageConfig,
    pub session_recovery: SessionRecoveryConfig,
    pub orphan_detection: OrphanDetectionConfig,
    pub health_check: HealthCheckConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            install_as_service: false,
            stop_timeout_ms: 5000,
            time_based_usage: TimeBasedUsageConfig::default(),
            session_recovery: SessionRecoveryConfig::default(),
            orphan_detection: OrphanDetectionConfig::default(),
            health_check: HealthCheckConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// `daemon.timeBasedUsage:` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeBasedUsageConfig {
    pub enabled: bool,
    /// Local hours counted as "day"
    pub day_mode_hours: Vec<u32>,
    /// Local hours counted as "night"
    pub night_mode_hours: Vec<u32>,
    pub day_mode_thresholds: Option<ModeThresholds>,
    pub night_mode_thresholds: Option<ModeThresholds>,
}

/// Mode-specific limit overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModeThresholds {
    pub max_tokens_per_task: Option<u64>,
    pub max_cost_per_task: Option<f64>,
    pub max_concurrent_tasks: Option<usize>,
}

/// `daemon.sessionRecovery:` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionRecoveryConfig {
    /// Master switch for checkpoint + resume
    pub enabled: bool,
    /// Resume eligible tasks right after startup recovery
    pub auto_resume: bool,
    pub max_resume_attempts: u32,
    /// Summarize conversations longer than this
    pub context_summarization_threshold: usize,
    /// Checkpoints older than this are not resumable
    pub max_checkpoint_age_ms: u64,
}

impl Default for SessionRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_resume: false,
            max_resume_attempts: 3,
            context_summarization_threshold: 50,
            max_checkpoint_age_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl SessionRecoveryConfig {
    pub fn max_checkpoint_age(&self) -> Duration {
        Duration::from_millis(self.max_checkpoint_age_ms)
    }
}

/// `daemon.orphanDetection:` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OrphanDetectionConfig {
    pub enabled: bool,
    /// Orphan age cutoff in milliseconds
    #[serde(rename = "stalenessThreshold")]
    pub staleness_threshold_ms: u64,
    pub recovery_policy: RecoveryPolicy,
    pub periodic_check: bool,
    #[serde(rename = "periodicCheckInterval")]
    pub periodic_check_interval_ms: Option<u64>,
}

impl Default for OrphanDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            staleness_threshold_ms: 3_600_000,
            recovery_policy: RecoveryPolicy::Pending,
            periodic_check: false,
            periodic_check_interval_ms: None,
        }
    }
}

impl OrphanDetectionConfig {
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.staleness_threshold_ms as i64)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_check
            .then(|| Duration::from_millis(self.periodic_check_interval_ms.unwrap_or(3_600_000)))
    }
}

/// How an orphaned task is healed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Reset to pending so the scheduler picks it up again
    #[default]
    Pending,
    /// Mark failed
    Fail,
    /// Increment the retry counter, then reset to pending
    Retry,
}

impl std::fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fail => write!(f, "fail"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// `daemon.healthCheck:` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub enabled: bool,
    #[serde(rename = "interval")]
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 30_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// `daemon.watchdog:` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub max_restarts: u32,
    #[serde(rename = "restartDelay")]
    pub restart_delay_ms: u64,
    #[serde(rename = "restartWindow")]
    pub restart_window_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restarts: 5,
            restart_delay_ms: 5000,
            restart_window_ms: 300_000,
        }
    }
}

impl WatchdogConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

/// `limits:` section, the global caps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitsConfig {
    pub max_tokens_per_task: Option<u64>,
    pub max_cost_per_task: Option<f64>,
    pub max_concurrent_tasks: usize,
    pub daily_budget: Option<f64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_task: None,
            max_cost_per_task: None,
            max_concurrent_tasks: 4,
            daily_budget: None,
        }
    }
}

const TOP_LEVEL_KEYS: &[&str] = &["daemon", "limits", "workflows"];
const DAEMON_KEYS: &[&str] = &[
    "pollIntervalMs",
    "installAsService",
    "stopTimeoutMs",
    "timeBasedUsage",
    "sessionRecovery",
    "orphanDetection",
    "healthCheck",
    "watchdog",
];
const LIMITS_KEYS: &[&str] = &[
    "maxTokensPerTask",
    "maxCostPerTask",
    "maxConcurrentTasks",
    "dailyBudget",
];

fn warn_unknown_keys(raw: &serde_yaml::Value) {
    warn_unknown_in(raw, TOP_LEVEL_KEYS, "");
    if let Some(daemon) = raw.get("daemon") {
        warn_unknown_in(daemon, DAEMON_KEYS, "daemon.");
    }
    if let Some(limits) = raw.get("limits") {
        warn_unknown_in(limits, LIMITS_KEYS, "limits.");
    }
}

fn warn_unknown_in(value: &serde_yaml::Value, known: &[&str], prefix: &str) {
    let Some(mapping) = value.as_mapping() else {
        return;
    };
    for key in mapping.keys() {
        if let Some(name) = key.as_str() {
            if !known.contains(&name) {
                warn!("Ignoring unknown config key: {}{}", prefix, name);
            }
        }
    }
}
