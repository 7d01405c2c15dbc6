//! Engine-wide configuration with the documented defaults. Everything here
//! is plain data; the table facade threads it through to the subsystems.

use std::sync::{LazyLock, RwLock};
use std::time::Duration;

/// Backoff/retry tuning shared by the commit pipeline and any caller using
/// [`crate::retry::with_retry`] directly.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts beyond the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// ± fraction applied to the computed delay when `jitter` is on.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.5,
        }
    }
}

static DEFAULT_RETRY: LazyLock<RwLock<RetryConfig>> =
    LazyLock::new(|| RwLock::new(RetryConfig::default()));

/// Replace the process-wide default retry configuration. Intended to be
/// called once at process init; reads afterwards are lock-cheap.
pub fn set_default_retry_config(config: RetryConfig) {
    if let Ok(mut guard) = DEFAULT_RETRY.write() {
        *guard = config;
    }
}

pub fn default_retry_config() -> RetryConfig {
    DEFAULT_RETRY
        .read()
        .map(|c| c.clone())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub struct VacuumConfig {
    pub retention_hours: u64,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            retention_hours: 168,
        }
    }
}

/// Floor under which vacuum refuses to go regardless of configuration.
pub(crate) const VACUUM_RETENTION_FLOOR_HOURS: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointConfig {
    /// A checkpoint is written every this-many commits.
    pub interval: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { interval: 10 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    pub target_file_size: u64,
    pub min_files_for_compaction: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            target_file_size: 128 * 1024 * 1024,
            min_files_for_compaction: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoCommitConfig {
    pub enabled: bool,
    /// Minimum gap between auto-commits of consumer offsets.
    pub interval: Option<Duration>,
}

impl Default for AutoCommitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: None,
        }
    }
}

/// Top-level configuration for a [`crate::Table`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub vacuum: VacuumConfig,
    pub checkpoint: CheckpointConfig,
    pub compaction: CompactionConfig,
    pub auto_commit: AutoCommitConfig,
    /// Object-store multipart upload cutoff.
    pub multipart_threshold: u64,
    /// Allow additive schema evolution on insert.
    pub schema_evolution: bool,
    /// Collect per-column min/max/null-count stats while writing.
    pub statistics: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            retry: default_retry_config(),
            multipart_threshold: 5 * 1024 * 1024,
            statistics: true,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint.interval = interval;
        self
    }

    pub fn with_retention_hours(mut self, hours: u64) -> Self {
        self.vacuum.retention_hours = hours;
        self
    }

    pub fn with_target_file_size(mut self, bytes: u64) -> Self {
        self.compaction.target_file_size = bytes;
        self
    }

    pub fn with_schema_evolution(mut self, enabled: bool) -> Self {
        self.schema_evolution = enabled;
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let config = EngineConfig::new();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.retry.max_delay, Duration::from_millis(10_000));
        assert_eq!(config.retry.multiplier, 2.0);
        assert!(config.retry.jitter);
        assert_eq!(config.vacuum.retention_hours, 168);
        assert_eq!(config.checkpoint.interval, 10);
        assert_eq!(config.compaction.target_file_size, 128 * 1024 * 1024);
        assert_eq!(config.compaction.min_files_for_compaction, 2);
        assert_eq!(config.multipart_threshold, 5 * 1024 * 1024);
        assert!(!config.auto_commit.enabled);
    }
}
