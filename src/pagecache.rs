//! Demand paging of persisted chunks back into the block arena.

use crate::block::{encode_chunk_meta, BlockHolder, BlockManager};
use crate::partition::{ChunkHandle, TimeSeriesPartition};
use crate::shard::ShardStats;
use crate::sink::ColumnSink;
use crate::Result;
use metrics::counter;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fetches chunks from the sink on query miss and caches them in the shared
/// block arena. Blocks carrying paged chunks become reclaimable after the
/// configured retention horizon.
pub struct DemandPagedChunkStore {
    sink: Arc<dyn ColumnSink>,
    dataset: String,
    shard_num: u32,
    retention: Duration,
    holder: Mutex<BlockHolder>,
    stats: Arc<ShardStats>,
}

impl DemandPagedChunkStore {
    pub fn new(
        blocks: Arc<BlockManager>,
        sink: Arc<dyn ColumnSink>,
        dataset: String,
        shard_num: u32,
        retention: Duration,
        stats: Arc<ShardStats>,
    ) -> Self {
        Self {
            sink,
            dataset,
            shard_num,
            retention,
            holder: Mutex::new(BlockHolder::new(blocks)),
            stats,
        }
    }

    /// Reads the partition's persisted chunks from the sink and attaches any
    /// that are not already resident. Returns how many were paged in.
    pub fn page_in(&self, partition: &TimeSeriesPartition) -> Result<usize> {
        let raw = self
            .sink
            .read_chunks(&self.dataset, self.shard_num, partition.bin_partition())?;
        if raw.is_empty() {
            return Ok(0);
        }

        let resident = partition.chunks_snapshot();
        let mut holder = self.holder.lock();
        let mut paged_in = 0usize;

        for chunk in raw {
            if resident.iter().any(|h| h.chunk_id == chunk.chunk_id) {
                continue;
            }

            let slot = encode_chunk_meta(partition.id(), chunk.chunk_id);
            let columns: Vec<&[u8]> = chunk.columns.iter().map(|c| c.as_slice()).collect();
            let (meta, regions) = holder.allocate_chunk(&slot, &columns)?;

            partition.add_paged_chunk(ChunkHandle {
                chunk_id: chunk.chunk_id,
                num_samples: chunk.num_samples,
                meta,
                columns: regions,
            });
            paged_in += 1;
        }

        holder.mark_used_blocks_reclaimable(self.retention);

        if paged_in > 0 {
            self.stats
                .chunks_paged_in
                .fetch_add(paged_in as u64, Ordering::Relaxed);
            counter!("chunks-paged-in").increment(paged_in as u64);
            debug!(
                partition = partition.id(),
                paged_in, "chunks paged in from sink"
            );
        }
        Ok(paged_in)
    }
}
