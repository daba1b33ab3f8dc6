//! Tuning knobs for the pipeline.
//!
//! Every constant the pipeline relies on lives here so that deployments (and
//! tests) can change it without touching code. Defaults match production.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::ledger::IdentityPolicy;

/// Files larger than this go through the stability gate.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Upper bound on `ledger.retention_days` (one hundred years)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Size in bytes above which a file must prove it is no longer being written
    pub large_file_threshold: u64,
    pub stability: StabilityConfig,
    pub ledger: LedgerConfig,
    pub pool: PoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            stability: StabilityConfig::default(),
            ledger: LedgerConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.stability.validate()?;
        self.ledger.validate()?;
        self.pool.validate()
    }
}

/// Stability gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Delay between `(size, mtime)` samples
    pub poll_interval_ms: u64,
    /// Sample budget before giving up
    pub max_retries: u32,
    /// How long the file must stay unchanged
    pub min_stable_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_retries: 30,
            min_stable_ms: 3000,
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_stable(&self) -> Duration {
        Duration::from_millis(self.min_stable_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(PipelineError::InvalidConfig(
                "stability.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Compact (prune + snapshot) after this many insertions
    pub compaction_every: u64,
    /// Records older than this are pruned at compaction
    pub retention_days: u32,
    /// What makes two files "the same" for idempotency
    pub identity: IdentityPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            compaction_every: 100,
            retention_days: 30,
            identity: IdentityPolicy::Content,
        }
    }
}

impl LedgerConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.compaction_every == 0 {
            return Err(PipelineError::InvalidConfig(
                "ledger.compaction_every must be at least 1".to_string(),
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(PipelineError::InvalidConfig(format!(
                "ledger.retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        Ok(())
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive for the lifetime of the pool
    pub core_workers: usize,
    /// Upper bound on workers once the queue is full
    pub max_workers: usize,
    /// Bounded queue depth
    pub queue_depth: usize,
    /// Idle time after which an overflow worker exits
    pub keep_alive_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_workers: 4,
            max_workers: 8,
            queue_depth: 1000,
            keep_alive_ms: 60_000,
        }
    }
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.core_workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "pool.core_workers must be at least 1".to_string(),
            ));
        }
        if self.max_workers < self.core_workers {
            return Err(PipelineError::InvalidConfig(format!(
                "pool.max_workers ({}) must be >= pool.core_workers ({})",
                self.max_workers, self.core_workers
            )));
        }
        if self.queue_depth == 0 {
            return Err(PipelineError::InvalidConfig(
                "pool.queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.large_file_threshold, 100 * 1024 * 1024);
        assert_eq!(config.stability.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.stability.max_retries, 30);
        assert_eq!(config.stability.min_stable(), Duration::from_secs(3));
        assert_eq!(config.ledger.compaction_every, 100);
        assert_eq!(config.ledger.retention(), chrono::Duration::days(30));
        assert_eq!(config.pool.core_workers, 4);
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.queue_depth, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"pool": {"max_workers": 16}, "ledger": {"identity": "path"}}"#)
                .unwrap();
        assert_eq!(config.pool.max_workers, 16);
        assert_eq!(config.pool.core_workers, 4);
        assert_eq!(config.ledger.identity, IdentityPolicy::Path);
        assert_eq!(config.stability.max_retries, 30);
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let mut config = PipelineConfig::default();
        config.pool.core_workers = 8;
        config.pool.max_workers = 2;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_compaction_cadence() {
        let mut config = PipelineConfig::default();
        config.ledger.compaction_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unbounded_retention() {
        let mut config = PipelineConfig::default();
        config.ledger.retention_days = MAX_RETENTION_DAYS;
        assert!(config.validate().is_ok());
        config.ledger.retention_days = u32::MAX;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
