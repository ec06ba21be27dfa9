use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Backoff applied when a shard read fails with a retryable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fraction of the base delay added or removed at random (0.0 to 1.0).
    pub backoff_jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
            backoff_jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given attempt (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max_backoff_ms`, with symmetric jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let base_ms = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);

        if self.backoff_jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.backoff_jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            Duration::from_millis(((base_ms as f64) + jitter).max(0.0) as u64)
        } else {
            Duration::from_millis(base_ms)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Evaluate the rewritten filter against raw oplog entries before
    /// normalizing them. Results are identical either way.
    pub pushdown_enabled: bool,
    /// Oplog entries fetched per shard read.
    pub read_batch_limit: usize,
    pub cursor_idle_timeout_ms: u64,
    pub reaper_interval_ms: u64,
    pub default_max_wait_ms: u64,
    pub max_batch_size: usize,
    pub retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pushdown_enabled: true,
            read_batch_limit: 256,
            cursor_idle_timeout_ms: 600_000,
            reaper_interval_ms: 1_000,
            default_max_wait_ms: 1_000,
            max_batch_size: 101,
            retry: RetryConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Defaults overlaid with any `RUNNEL_*` environment variables.
    pub fn from_env() -> Result<Self, StreamError> {
        let mut config = Self::default();
        overlay(&mut config.pushdown_enabled, "RUNNEL_PUSHDOWN_ENABLED")?;
        overlay(&mut config.read_batch_limit, "RUNNEL_READ_BATCH_LIMIT")?;
        overlay(&mut config.cursor_idle_timeout_ms, "RUNNEL_CURSOR_IDLE_TIMEOUT_MS")?;
        overlay(&mut config.reaper_interval_ms, "RUNNEL_REAPER_INTERVAL_MS")?;
        overlay(&mut config.default_max_wait_ms, "RUNNEL_DEFAULT_MAX_WAIT_MS")?;
        overlay(&mut config.max_batch_size, "RUNNEL_MAX_BATCH_SIZE")?;
        overlay(&mut config.retry.initial_backoff_ms, "RUNNEL_RETRY_INITIAL_BACKOFF_MS")?;
        overlay(&mut config.retry.max_backoff_ms, "RUNNEL_RETRY_MAX_BACKOFF_MS")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.read_batch_limit == 0 {
            return Err(StreamError::InvalidOptions("read_batch_limit must be greater than 0".into()));
        }
        if self.max_batch_size == 0 {
            return Err(StreamError::InvalidOptions("max_batch_size must be greater than 0".into()));
        }
        if self.retry.initial_backoff_ms == 0 || self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(StreamError::InvalidOptions(format!(
                "retry backoff must satisfy 0 < initial ({}) <= max ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.backoff_jitter) {
            return Err(StreamError::InvalidOptions(format!(
                "backoff_jitter ({}) must be between 0.0 and 1.0",
                self.retry.backoff_jitter
            )));
        }
        Ok(())
    }

    pub fn default_max_wait(&self) -> Duration {
        Duration::from_millis(self.default_max_wait_ms)
    }

    pub fn cursor_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.cursor_idle_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

fn overlay<T: FromStr>(slot: &mut T, var: &str) -> Result<(), StreamError> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .parse()
            .map_err(|_| StreamError::InvalidOptions(format!("cannot parse {var}={raw}")))?;
    }
    Ok(())
}
