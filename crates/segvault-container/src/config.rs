//! Container configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use segvault_core::{Error, Result, RetryPolicy};
use segvault_wal::JournalConfig;

/// Shortest metadata expiration the validator accepts. Anything lower makes
/// the cleaner race ordinary request traffic for segments that are still hot.
pub const MINIMUM_SEGMENT_METADATA_EXPIRATION: Duration = Duration::from_secs(60);

/// Configuration for one segment container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Id of this container. Appears in log lines, metric labels, and the
    /// journal file name.
    #[serde(default)]
    pub container_id: u32,

    /// Most segments that may be mapped in metadata at once. The mapper
    /// forces a cleaner sweep when the budget is exhausted and fails with
    /// `TooManySegments` if the sweep frees nothing.
    #[serde(default = "default_max_active_segment_count")]
    pub max_active_segment_count: usize,

    /// How long a segment must sit unused before the cleaner may evict its
    /// metadata.
    #[serde(default = "default_segment_metadata_expiration")]
    pub segment_metadata_expiration: Duration,

    /// Most evictions performed in one cleaner sweep.
    #[serde(default = "default_max_concurrent_eviction_count")]
    pub max_concurrent_eviction_count: usize,

    /// Interval between periodic cleaner sweeps.
    #[serde(default = "default_metadata_cleanup_interval")]
    pub metadata_cleanup_interval: Duration,

    /// Backoff schedule for the attribute cache write-back race.
    #[serde(default = "default_cache_attributes_retry")]
    pub cache_attributes_retry: RetryPolicy,

    /// How long the storage writer accumulates applied operations before
    /// flushing them to the durable tier.
    #[serde(default = "default_writer_flush_interval")]
    pub writer_flush_interval: Duration,

    #[serde(default)]
    pub journal: JournalConfig,
}

fn default_max_active_segment_count() -> usize {
    10_000
}

fn default_segment_metadata_expiration() -> Duration {
    Duration::from_secs(300)
}

fn default_max_concurrent_eviction_count() -> usize {
    256
}

fn default_metadata_cleanup_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_attributes_retry() -> RetryPolicy {
    RetryPolicy::exp_backoff(Duration::from_millis(50), 2, 10, Duration::from_millis(1000))
}

fn default_writer_flush_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            container_id: 0,
            max_active_segment_count: default_max_active_segment_count(),
            segment_metadata_expiration: default_segment_metadata_expiration(),
            max_concurrent_eviction_count: default_max_concurrent_eviction_count(),
            metadata_cleanup_interval: default_metadata_cleanup_interval(),
            cache_attributes_retry: default_cache_attributes_retry(),
            writer_flush_interval: default_writer_flush_interval(),
            journal: JournalConfig::default(),
        }
    }
}

impl ContainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_active_segment_count == 0 {
            return Err(Error::Config(
                "max_active_segment_count must be at least 1".to_string(),
            ));
        }
        if self.segment_metadata_expiration < MINIMUM_SEGMENT_METADATA_EXPIRATION {
            return Err(Error::Config(format!(
                "segment_metadata_expiration must be at least {}s",
                MINIMUM_SEGMENT_METADATA_EXPIRATION.as_secs()
            )));
        }
        if self.max_concurrent_eviction_count == 0 {
            return Err(Error::Config(
                "max_concurrent_eviction_count must be at least 1".to_string(),
            ));
        }
        if self.metadata_cleanup_interval.is_zero() {
            return Err(Error::Config(
                "metadata_cleanup_interval must be positive".to_string(),
            ));
        }
        if self.cache_attributes_retry.max_attempts == 0 {
            return Err(Error::Config(
                "cache_attributes_retry must allow at least one attempt".to_string(),
            ));
        }
        if self.writer_flush_interval.is_zero() {
            return Err(Error::Config(
                "writer_flush_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ContainerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_expiration_minimum_enforced() {
        let config = ContainerConfig {
            segment_metadata_expiration: Duration::from_secs(5),
            ..ContainerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_budgets_rejected() {
        let config = ContainerConfig {
            max_active_segment_count: 0,
            ..ContainerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ContainerConfig {
            max_concurrent_eviction_count: 0,
            ..ContainerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = ContainerConfig {
            container_id: 7,
            ..ContainerConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: ContainerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.container_id, 7);
        assert_eq!(
            back.max_active_segment_count,
            config.max_active_segment_count
        );
    }
}
