//! Eviction policy seam.

use crate::partition::TimeSeriesPartition;

/// Decides when and which partitions may be removed under memory pressure.
///
/// `can_evict` is the sole gatekeeper: the shard walks candidates in
/// creation order but never removes a partition the policy declares active.
pub trait EvictionPolicy: Send + Sync {
    /// Number of partitions to evict given the current live count. Called
    /// before each partition creation; `0` means no pressure.
    fn how_many_to_evict(&self, current: usize, max: usize) -> usize;

    /// Whether this partition is safe to remove right now.
    fn can_evict(&self, partition: &TimeSeriesPartition) -> bool;
}

/// Default policy: keep the live partition count below the configured
/// maximum, evicting a small batch once the ceiling is reached.
pub struct CapacityEvictionPolicy {
    batch: usize,
}

impl CapacityEvictionPolicy {
    pub fn new(batch: usize) -> Self {
        Self {
            batch: batch.max(1),
        }
    }
}

impl Default for CapacityEvictionPolicy {
    fn default() -> Self {
        Self::new(8)
    }
}

impl EvictionPolicy for CapacityEvictionPolicy {
    fn how_many_to_evict(&self, current: usize, max: usize) -> usize {
        if current < max {
            0
        } else {
            (current + 1 - max).max(self.batch).min(current)
        }
    }

    fn can_evict(&self, partition: &TimeSeriesPartition) -> bool {
        !partition.is_actively_ingesting()
    }
}
