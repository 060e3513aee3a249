//! Configuration types.
//!
//! Everything is read from `CLUSTERD_*` environment variables. Parsing goes
//! through a lookup closure so the same code can be fed a fixed map in tests.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler and worker pool configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker processes running tasks in parallel.
    pub worker_count: usize,
    /// Tasks a worker process completes before it is replaced.
    pub worker_reset_limit: usize,
    /// Cadence of the coordination tick.
    pub tick_interval: Duration,
    /// Executing tasks silent for this long are killed.
    pub task_unresponsive_timeout: Duration,
    /// Finished tasks not retrieved within this window are dropped.
    pub task_abandoned_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            worker_reset_limit: 100,
            tick_interval: Duration::from_millis(100),
            task_unresponsive_timeout: Duration::from_secs(60 * 60), // 1 hour
            task_abandoned_timeout: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let worker_count = parse_or(&lookup, "CLUSTERD_WORKER_COUNT", defaults.worker_count)?;
        let worker_reset_limit = parse_or(
            &lookup,
            "CLUSTERD_WORKER_RESET_LIMIT",
            defaults.worker_reset_limit,
        )?;
        require_positive("CLUSTERD_WORKER_COUNT", worker_count)?;
        require_positive("CLUSTERD_WORKER_RESET_LIMIT", worker_reset_limit)?;

        let tick_ms = parse_or(
            &lookup,
            "CLUSTERD_TICK_INTERVAL_MS",
            defaults.tick_interval.as_millis() as u64,
        )?;
        require_positive("CLUSTERD_TICK_INTERVAL_MS", tick_ms as usize)?;
        let unresponsive_secs = parse_or(
            &lookup,
            "CLUSTERD_TASK_UNRESPONSIVE_TIMEOUT_SECS",
            defaults.task_unresponsive_timeout.as_secs(),
        )?;
        let abandoned_secs = parse_or(
            &lookup,
            "CLUSTERD_TASK_ABANDONED_TIMEOUT_SECS",
            defaults.task_abandoned_timeout.as_secs(),
        )?;

        Ok(Self {
            worker_count,
            worker_reset_limit,
            tick_interval: Duration::from_millis(tick_ms),
            task_unresponsive_timeout: Duration::from_secs(unresponsive_secs),
            task_abandoned_timeout: Duration::from_secs(abandoned_secs),
        })
    }
}

/// Who may run what. Consumed by `commands::permission::GroupPermissions`.
#[derive(Debug, Clone)]
pub struct PermissionConfig {
    /// Users allowed to do anything.
    pub superusers: Vec<String>,
    /// Members of these groups hold FULL permission.
    pub full_groups: Vec<String>,
    /// Members of these groups hold READ permission.
    pub read_groups: Vec<String>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            superusers: vec!["hacluster".to_string()],
            full_groups: vec!["haclient".to_string()],
            read_groups: Vec::new(),
        }
    }
}

impl PermissionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            superusers: lookup("CLUSTERD_SUPERUSERS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.superusers),
            full_groups: lookup("CLUSTERD_FULL_GROUPS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.full_groups),
            read_groups: lookup("CLUSTERD_READ_GROUPS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.read_groups),
        }
    }
}

/// Daemon-level configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub scheduler: SchedulerConfig,
    /// Directory for the rolling log file; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Acting user for requests typed on the console.
    pub console_user: String,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            scheduler: SchedulerConfig::from_lookup(&lookup)?,
            log_dir: lookup("CLUSTERD_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            console_user: lookup("CLUSTERD_CONSOLE_USER")
                .unwrap_or_else(|| "hacluster".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

fn require_positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
