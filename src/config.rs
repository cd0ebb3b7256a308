//! Runtime configuration.

use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration for a [`JobManager`](crate::JobManager).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Service loop configuration
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Configuration for the worker pool that runs `do_work` callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of concurrently running work callbacks
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

/// Configuration for the service loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Baseline delay between service visits (milliseconds). Scheduled
    /// visits are never shorter than this.
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,

    /// How long a rollback may run before the loop proceeds without it
    /// (milliseconds).
    #[serde(default = "default_rollback_timeout_ms")]
    pub rollback_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_ms: default_poll_interval_ms(),
            rollback_timeout_ms: default_rollback_timeout_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_millis(self.default_poll_interval_ms)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }
}

fn default_max_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    3 * (1 + cores)
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_rollback_timeout_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.workers.max_workers >= 6);
        assert_eq!(
            config.service.default_poll_interval(),
            Duration::from_millis(200)
        );
        assert_eq!(config.service.rollback_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"service": {"default_poll_interval_ms": 50}}"#).unwrap();
        assert_eq!(
            config.service.default_poll_interval(),
            Duration::from_millis(50)
        );
        assert_eq!(config.service.rollback_timeout_ms, 1000);
    }
}
