//! Shard configuration.

use crate::{MemShardError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one in-memory shard.
///
/// Field names mirror the operational keys (`memstore.max-chunks-size`,
/// `memstore.shard-memory-mb`, ...); unset fields take their defaults when
/// deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ShardConfig {
    /// Target samples per encoded chunk; drives buffer allocation sizing.
    pub max_chunks_size: usize,
    /// Size of the off-heap block arena per shard, in MiB.
    pub shard_memory_mb: usize,
    /// Pages per block.
    pub num_block_pages: usize,
    /// Number of flush groups; defines the bitmap fan-out.
    pub groups_per_shard: usize,
    /// Upper bound on live partitions; sizes the write-buffer arena.
    pub max_num_partitions: usize,
    /// Hours a demand-paged chunk is retained before becoming reclaimable.
    pub demand_paged_retention_hours: u64,
    /// Health-probe deadline, in milliseconds.
    pub status_timeout_ms: u64,
    /// Source connect deadline, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Graceful shutdown deadline, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Whether rejected records are forwarded to the failure channel.
    pub failure_channel_enabled: bool,
    /// Topic name used when publishing rejected records.
    pub failure_topic: String,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            max_chunks_size: 400,
            shard_memory_mb: 64,
            num_block_pages: 1000,
            groups_per_shard: 8,
            max_num_partitions: 8192,
            demand_paged_retention_hours: 72,
            status_timeout_ms: 2_000,
            connect_timeout_ms: 30_000,
            shutdown_timeout_ms: 30_000,
            failure_channel_enabled: false,
            failure_topic: String::new(),
        }
    }
}

impl ShardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_chunks_size(mut self, samples: usize) -> Self {
        self.max_chunks_size = samples;
        self
    }

    pub fn with_shard_memory_mb(mut self, mb: usize) -> Self {
        self.shard_memory_mb = mb;
        self
    }

    pub fn with_num_block_pages(mut self, pages: usize) -> Self {
        self.num_block_pages = pages;
        self
    }

    pub fn with_groups_per_shard(mut self, groups: usize) -> Self {
        self.groups_per_shard = groups;
        self
    }

    pub fn with_max_num_partitions(mut self, max: usize) -> Self {
        self.max_num_partitions = max;
        self
    }

    pub fn with_demand_paged_retention_hours(mut self, hours: u64) -> Self {
        self.demand_paged_retention_hours = hours;
        self
    }

    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_failure_channel(mut self, topic: impl Into<String>) -> Self {
        self.failure_channel_enabled = true;
        self.failure_topic = topic.into();
        self
    }

    pub fn demand_paged_retention(&self) -> Duration {
        Duration::from_secs(self.demand_paged_retention_hours * 3600)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Parses a config from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunks_size == 0 {
            return Err(MemShardError::InvalidConfiguration(
                "max-chunks-size must be positive".to_string(),
            ));
        }
        if self.shard_memory_mb == 0 || self.num_block_pages == 0 {
            return Err(MemShardError::InvalidConfiguration(
                "block arena dimensions must be positive".to_string(),
            ));
        }
        if self.groups_per_shard == 0 {
            return Err(MemShardError::InvalidConfiguration(
                "groups-per-shard must be positive".to_string(),
            ));
        }
        if self.max_num_partitions == 0 {
            return Err(MemShardError::InvalidConfiguration(
                "max-num-partitions must be positive".to_string(),
            ));
        }
        if self.failure_channel_enabled && self.failure_topic.is_empty() {
            return Err(MemShardError::InvalidConfiguration(
                "failure channel enabled without a topic".to_string(),
            ));
        }
        Ok(())
    }
}
