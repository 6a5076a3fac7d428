//! Settings shared by broker and worker processes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue system settings with environment overrides.
///
/// Duration knobs are millisecond fields so tests can shrink them; the
/// accessors below hand out [`Duration`] values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Backing store location. The embedded engine ignores everything but
    /// the scheme; kept so hosts can swap in a networked engine.
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Queue used when a task does not choose one.
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Budget for a single handler invocation.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Retry ceiling for tasks that do not choose one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff delay after the first failure.
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Backoff delay ceiling.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// How often workers report liveness.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a stopping worker waits for its in-flight task.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Retention for completed/dead-lettered task records.
    #[serde(default = "default_completed_retention_ms")]
    pub completed_retention_ms: u64,

    /// Log level used by the tracing init helper.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_store_url() -> String {
    "mem://local".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    300_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_completed_retention_ms() -> u64 {
    86_400_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            default_queue: default_queue(),
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            completed_retention_ms: default_completed_retention_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from `TASKMESH_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_url: env_string("TASKMESH_STORE_URL", defaults.store_url),
            default_queue: env_string("TASKMESH_DEFAULT_QUEUE", defaults.default_queue),
            task_timeout_ms: env_u64("TASKMESH_TASK_TIMEOUT_MS", defaults.task_timeout_ms),
            max_retries: env_u64("TASKMESH_MAX_RETRIES", defaults.max_retries as u64) as u32,
            base_retry_delay_ms: env_u64(
                "TASKMESH_BASE_RETRY_DELAY_MS",
                defaults.base_retry_delay_ms,
            ),
            max_retry_delay_ms: env_u64("TASKMESH_MAX_RETRY_DELAY_MS", defaults.max_retry_delay_ms),
            heartbeat_interval_ms: env_u64(
                "TASKMESH_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            shutdown_timeout_ms: env_u64(
                "TASKMESH_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout_ms,
            ),
            completed_retention_ms: env_u64(
                "TASKMESH_COMPLETED_RETENTION_MS",
                defaults.completed_retention_ms,
            ),
            log_level: env_string("TASKMESH_LOG_LEVEL", defaults.log_level),
        }
    }

    /// Handler execution budget.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Worker heartbeat cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Graceful shutdown drain budget.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Record retention for settled tasks.
    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    /// Backoff before retry attempt `n` (1-indexed):
    /// `min(base * 2^(n-1), cap)`.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_retry_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_retry_delay_ms);
        Duration::from_millis(delay)
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
