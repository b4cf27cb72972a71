//! Cadence configuration system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CadenceError, Result};

/// Environment variable that points at an alternative config file.
pub const CONFIG_ENV: &str = "CADENCE_CONFIG";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Schedules declared in config, registered idempotently at process start.
    #[serde(default)]
    pub schedules: Vec<StaticSchedule>,
}

impl CadenceConfig {
    /// Load config from `$CADENCE_CONFIG` or the default path (~/.cadence/config.toml).
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the scheduler misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.wake_queue.trim().is_empty() {
            return Err(CadenceError::Config("scheduler.wake_queue must not be empty".into()));
        }
        if self.worker.queues.iter().any(|q| q == &self.scheduler.wake_queue) {
            return Err(CadenceError::Config(format!(
                "worker.queues must not include the wake queue '{}'",
                self.scheduler.wake_queue
            )));
        }
        if self.scheduler.max_idle_secs == 0 {
            return Err(CadenceError::Config("scheduler.max_idle_secs must be > 0".into()));
        }
        if self.scheduler.wake_consumer_threads == 0 || self.worker.concurrency == 0 {
            return Err(CadenceError::Config(
                "scheduler.wake_consumer_threads and worker.concurrency must be > 0".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for schedule in &self.schedules {
            schedule.validate()?;
            if !seen.insert(schedule.id.as_str()) {
                return Err(CadenceError::InvalidSchedule {
                    id: schedule.id.clone(),
                    reason: "declared more than once".into(),
                });
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(p).map(|s| s.into_owned()).unwrap_or_else(|_| p.to_string()))
}

/// Job store (SQLite) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// How long a writer waits on a lock held by another process.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> String { "~/.cadence/jobs.db".into() }
fn default_busy_timeout_ms() -> u64 { 5000 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Which task broker backs the work and wake queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process only. Wake messages cannot cross process boundaries.
    Memory,
    /// Durable queue table shared by every process on the host.
    Sqlite,
}

/// Task broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,
    #[serde(default = "default_broker_path")]
    pub path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A fetched message not acked within this window is delivered again.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

fn default_broker_kind() -> BrokerKind { BrokerKind::Sqlite }
fn default_broker_path() -> String { "~/.cadence/broker.db".into() }
fn default_poll_interval_ms() -> u64 { 200 }
fn default_visibility_timeout_secs() -> u64 { 300 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            path: default_broker_path(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Scheduler engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dedicated queue carrying wake messages to the active scheduler.
    #[serde(default = "default_wake_queue")]
    pub wake_queue: String,
    /// Default grace period for jobs that do not set their own. `None` in a job means "no limit".
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// Upper bound on a single sleep of the active loop (polling safety net).
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_store_retry_backoff_ms")]
    pub store_retry_backoff_ms: u64,
    #[serde(default = "default_wake_consumer_threads")]
    pub wake_consumer_threads: usize,
}

fn default_wake_queue() -> String { "scheduler".into() }
fn default_misfire_grace_secs() -> u64 { 30 }
fn default_max_idle_secs() -> u64 { 60 }
fn default_store_retry_attempts() -> u32 { 5 }
fn default_store_retry_backoff_ms() -> u64 { 500 }
fn default_wake_consumer_threads() -> usize { 1 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wake_queue: default_wake_queue(),
            misfire_grace_secs: default_misfire_grace_secs(),
            max_idle_secs: default_max_idle_secs(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_backoff_ms: default_store_retry_backoff_ms(),
            wake_consumer_threads: default_wake_consumer_threads(),
        }
    }
}

/// General task worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_queues")]
    pub queues: Vec<String>,
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    /// Dead letters older than this are deleted. 0 keeps them forever.
    #[serde(default = "default_dead_letter_retention_secs")]
    pub dead_letter_retention_secs: u64,
}

fn default_worker_queues() -> Vec<String> { vec!["default".into()] }
fn default_worker_concurrency() -> usize { 4 }
fn default_dead_letter_retention_secs() -> u64 { 7 * 24 * 3600 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_worker_queues(),
            concurrency: default_worker_concurrency(),
            dead_letter_retention_secs: default_dead_letter_retention_secs(),
        }
    }
}

/// A schedule declared in the config file.
///
/// Exactly one of `cron`, `interval_secs` or `at` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSchedule {
    pub id: String,
    pub target: String,
    #[serde(default = "default_job_queue")]
    pub queue: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub misfire_grace_secs: Option<u64>,
}

fn default_job_queue() -> String { "default".into() }

impl StaticSchedule {
    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| CadenceError::InvalidSchedule {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.target.trim().is_empty() {
            return Err(invalid("target must not be empty"));
        }
        let set = [self.cron.is_some(), self.interval_secs.is_some(), self.at.is_some()]
            .into_iter()
            .filter(|s| *s)
            .count();
        if set != 1 {
            return Err(invalid("exactly one of cron, interval_secs, at is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = CadenceConfig::from_toml("").unwrap();
        assert_eq!(config.scheduler.wake_queue, "scheduler");
        assert_eq!(config.broker.kind, BrokerKind::Sqlite);
        assert_eq!(config.worker.queues, vec!["default".to_string()]);
        assert!(config.schedules.is_empty());
    }

    #[test]
    fn test_parse_full_document() {
        let config = CadenceConfig::from_toml(
            r#"
            [broker]
            kind = "memory"
            poll_interval_ms = 50

            [scheduler]
            wake_queue = "wake"
            misfire_grace_secs = 5

            [[schedules]]
            id = "nightly-report"
            target = "log"
            cron = "0 2 * * *"
            kwargs = { message = "report" }

            [[schedules]]
            id = "heartbeat"
            target = "log"
            interval_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.broker.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.scheduler.misfire_grace_secs, 5);
        assert_eq!(config.schedules.len(), 2);
        assert_eq!(config.schedules[0].queue, "default");
        assert_eq!(config.schedules[1].interval_secs, Some(30));
    }

    #[test]
    fn test_schedule_needs_exactly_one_trigger() {
        let err = CadenceConfig::from_toml(
            r#"
            [[schedules]]
            id = "both"
            target = "log"
            cron = "* * * * *"
            interval_secs = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CadenceError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_duplicate_schedule_ids_rejected() {
        let err = CadenceConfig::from_toml(
            r#"
            [[schedules]]
            id = "a"
            target = "log"
            interval_secs = 10

            [[schedules]]
            id = "a"
            target = "log"
            interval_secs = 20
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_wake_queue_not_a_work_queue() {
        let err = CadenceConfig::from_toml(
            r#"
            [worker]
            queues = ["default", "scheduler"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn test_expand_path_tilde() {
        let p = expand_path("~/x.db");
        assert!(!p.to_string_lossy().starts_with('~'));
    }
}
