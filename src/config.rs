//! Container configuration.

use std::time::Duration;

use crate::error::Error;
use crate::hash::HashKind;

/// Lower bound of the shard count
pub const MIN_SHARDS: usize = 4;
/// Upper bound of the shard count
pub const MAX_SHARDS: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "with_serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "with_serde", serde(default))]
pub struct Config {
    /// Number of shards, clamped to `[4, 2048]` and rounded up to a power of two
    pub shards: usize,
    /// Period of the expiry sweep
    pub sweep_interval: Duration,
    /// Maximum number of due buckets evicted per sweep
    pub sweep_batch: usize,
    /// Period of each persistence partition saver
    pub save_interval: Duration,
    /// Maximum number of dirty sketches a saver moves per period
    pub save_batch: usize,
    /// Capacity of the channel between savers and the writer
    pub channel_capacity: usize,
    /// How long `del_log` waits for the backend to confirm a deletion
    pub delete_timeout: Duration,
    pub retry: RetryPolicy,
    pub hashing: HashKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shards: 256,
            sweep_interval: Duration::from_secs(60),
            sweep_batch: 40,
            save_interval: Duration::from_secs(1),
            save_batch: 256,
            channel_capacity: 20_000,
            delete_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            hashing: HashKind::default(),
        }
    }
}

impl Config {
    /// Shard count actually used for this configuration
    pub fn shard_count(&self) -> usize {
        self.shards
            .clamp(MIN_SHARDS, MAX_SHARDS)
            .next_power_of_two()
    }

    /// Reject settings the background tasks cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.sweep_interval.is_zero() || self.save_interval.is_zero() {
            return Err(Error::Config("intervals must be non-zero".to_string()));
        }
        if self.sweep_batch == 0 || self.save_batch == 0 {
            return Err(Error::Config("batch sizes must be non-zero".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel capacity must be non-zero".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry needs at least one attempt".to_string()));
        }
        Ok(())
    }
}

/// Retry policy of backend calls made by the persistence writer
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "with_serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "with_serde", serde(default))]
pub struct RetryPolicy {
    /// Attempts per backend call, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `initial_backoff`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0 => 4)]
    #[test_case(4 => 4)]
    #[test_case(5 => 8)]
    #[test_case(256 => 256)]
    #[test_case(1000 => 1024)]
    #[test_case(1 << 20 => 2048)]
    fn test_shard_count(shards: usize) -> usize {
        Config {
            shards,
            ..Config::default()
        }
        .shard_count()
    }

    #[test_case(1 => Duration::from_millis(50))]
    #[test_case(2 => Duration::from_millis(100))]
    #[test_case(3 => Duration::from_millis(200))]
    #[test_case(10 => Duration::from_secs(2))]
    #[test_case(u32::MAX => Duration::from_secs(2))]
    fn test_backoff(attempt: u32) -> Duration {
        RetryPolicy::default().backoff(attempt)
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        let config = Config {
            save_batch: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[cfg(feature = "with_serde")]
    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"shards": 16, "hashing": "wyhash"}"#).unwrap();
        assert_eq!(config.shard_count(), 16);
        assert_eq!(config.hashing, HashKind::WyHash);
        assert_eq!(config.sweep_batch, 40);
    }
}
