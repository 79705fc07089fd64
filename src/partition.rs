//! Per-series partition state: active write buffers, sealed chunks, flush.

use crate::block::{encode_chunk_meta, BlockHolder, BlockManager, BlockRegion};
use crate::buffer::{WriteBufferPool, WriteBufferSet};
use crate::{ChunkId, DataRow, PartitionId, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// An encoded, immutable chunk resident in the block arena.
#[derive(Debug, Clone)]
pub struct ChunkHandle {
    pub chunk_id: ChunkId,
    pub num_samples: usize,
    pub meta: BlockRegion,
    pub columns: Vec<BlockRegion>,
}

impl ChunkHandle {
    /// Decodes the chunk back into rows. Column 0 is timestamps (i64 LE),
    /// the rest are f64 LE value columns.
    pub fn decode(&self, mgr: &BlockManager) -> Vec<DataRow> {
        let mut rows = Vec::with_capacity(self.num_samples);
        let ts_bytes = mgr.read_region(self.columns[0]);

        for i in 0..self.num_samples {
            let at = i * 8;
            let timestamp = i64::from_le_bytes(ts_bytes[at..at + 8].try_into().unwrap());
            let mut values = Vec::with_capacity(self.columns.len() - 1);
            for column in &self.columns[1..] {
                let bytes = mgr.read_region(*column);
                values.push(f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()));
            }
            rows.push(DataRow { timestamp, values });
        }
        rows
    }
}

/// One encoded chunk as handed to the sink: owned copies of the column
/// vectors, detached from the block arena.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    pub partition_key: Vec<u8>,
    pub partition_id: PartitionId,
    pub chunk_id: ChunkId,
    pub num_samples: usize,
    pub columns: Vec<Bytes>,
}

impl ChunkSet {
    pub fn encoded_bytes(&self) -> usize {
        self.columns.iter().map(|c| c.len()).sum()
    }
}

/// A single time series within the shard.
///
/// Mutated only by the shard's single writer, except for `remove_chunks_at`
/// which the reclaim listener may invoke from any allocating thread. The
/// chunk list is copy-on-write behind a lock so query readers always observe
/// a consistent snapshot.
pub struct TimeSeriesPartition {
    id: PartitionId,
    bin_key: Vec<u8>,
    group: usize,
    buffers: Arc<WriteBufferPool>,
    active: Mutex<Option<WriteBufferSet>>,
    frozen: Mutex<Vec<WriteBufferSet>>,
    chunks: RwLock<Arc<Vec<ChunkHandle>>>,
    last_offset: AtomicI64,
}

impl TimeSeriesPartition {
    pub fn new(id: PartitionId, bin_key: Vec<u8>, group: usize, buffers: Arc<WriteBufferPool>) -> Self {
        Self {
            id,
            bin_key,
            group,
            buffers,
            active: Mutex::new(None),
            frozen: Mutex::new(Vec::new()),
            chunks: RwLock::new(Arc::new(Vec::new())),
            last_offset: AtomicI64::new(-1),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// The canonical binary partition key.
    pub fn bin_partition(&self) -> &[u8] {
        &self.bin_key
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn last_offset(&self) -> i64 {
        self.last_offset.load(Ordering::Acquire)
    }

    /// Appends one row into the active buffer set, sealing it when full.
    pub fn ingest(&self, row: &DataRow, offset: i64) -> Result<()> {
        let mut active = self.active.lock();
        let mut set = match active.take() {
            Some(set) => set,
            None => self.buffers.checkout()?,
        };

        if let Err(e) = set.append(self.buffers.arena(), row.timestamp, &row.values) {
            *active = Some(set);
            return Err(e);
        }

        if set.is_full() {
            self.frozen.lock().push(set);
        } else {
            *active = Some(set);
        }

        self.last_offset.store(offset, Ordering::Release);
        Ok(())
    }

    /// Seals the active buffer. A fresh set is checked out lazily on the
    /// next ingest.
    pub fn switch_buffers(&self) {
        let mut active = self.active.lock();
        if let Some(set) = active.take() {
            if set.is_empty() {
                self.buffers.release(set);
            } else {
                self.frozen.lock().push(set);
            }
        }
    }

    /// Encodes every frozen buffer set into chunks allocated from `holder`,
    /// emitting one [`ChunkSet`] per set, then releases the sets.
    pub fn make_flush_chunks(&self, holder: &mut BlockHolder) -> Result<Vec<ChunkSet>> {
        let sets: Vec<WriteBufferSet> = std::mem::take(&mut *self.frozen.lock());
        if sets.is_empty() {
            return Ok(Vec::new());
        }

        let arena = self.buffers.arena();
        let mut out = Vec::with_capacity(sets.len());
        let mut handles = Vec::with_capacity(sets.len());

        for set in sets {
            // Sets are sealed non-empty except via switch_buffers, which
            // filters empties, so first_timestamp is present.
            let Some(chunk_id) = set.first_timestamp(arena) else {
                self.buffers.release(set);
                continue;
            };

            let columns: Vec<&[u8]> = (0..set.num_columns())
                .map(|c| set.column_bytes(arena, c))
                .collect();
            let slot = encode_chunk_meta(self.id, chunk_id);
            let (meta, regions) = holder.allocate_chunk(&slot, &columns)?;

            out.push(ChunkSet {
                partition_key: self.bin_key.clone(),
                partition_id: self.id,
                chunk_id,
                num_samples: set.len(),
                columns: columns.iter().map(|c| Bytes::copy_from_slice(c)).collect(),
            });
            handles.push(ChunkHandle {
                chunk_id,
                num_samples: set.len(),
                meta,
                columns: regions,
            });

            self.buffers.release(set);
        }

        if !handles.is_empty() {
            let mut chunks = self.chunks.write();
            let mut next: Vec<ChunkHandle> = (**chunks).clone();
            next.extend(handles);
            next.sort_by_key(|h| h.chunk_id);
            *chunks = Arc::new(next);
        }

        Ok(out)
    }

    /// Drops the reference to a reclaimed chunk. Safe from any thread.
    pub fn remove_chunks_at(&self, chunk_id: ChunkId) {
        let mut chunks = self.chunks.write();
        if !chunks.iter().any(|h| h.chunk_id == chunk_id) {
            return;
        }
        let next: Vec<ChunkHandle> = chunks
            .iter()
            .filter(|h| h.chunk_id != chunk_id)
            .cloned()
            .collect();
        *chunks = Arc::new(next);
    }

    /// Attaches a demand-paged chunk, keeping the list time-ordered.
    pub fn add_paged_chunk(&self, handle: ChunkHandle) {
        let mut chunks = self.chunks.write();
        if chunks.iter().any(|h| h.chunk_id == handle.chunk_id) {
            return;
        }
        let mut next: Vec<ChunkHandle> = (**chunks).clone();
        next.push(handle);
        next.sort_by_key(|h| h.chunk_id);
        *chunks = Arc::new(next);
    }

    /// Consistent snapshot of the sealed chunk list.
    pub fn chunks_snapshot(&self) -> Arc<Vec<ChunkHandle>> {
        self.chunks.read().clone()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.read().len()
    }

    /// Rows still sitting in write buffers (active + frozen), in append order.
    pub fn buffered_rows(&self) -> Vec<DataRow> {
        let arena = self.buffers.arena();
        let mut rows = Vec::new();

        let frozen = self.frozen.lock();
        for set in frozen.iter() {
            Self::read_set(arena, set, &mut rows);
        }
        drop(frozen);

        let active = self.active.lock();
        if let Some(set) = active.as_ref() {
            Self::read_set(arena, set, &mut rows);
        }
        rows
    }

    fn read_set(arena: &crate::arena::OffHeapArena, set: &WriteBufferSet, rows: &mut Vec<DataRow>) {
        let ts = set.column_bytes(arena, 0);
        for i in 0..set.len() {
            let at = i * 8;
            let timestamp = i64::from_le_bytes(ts[at..at + 8].try_into().unwrap());
            let mut values = Vec::with_capacity(set.num_columns() - 1);
            for c in 1..set.num_columns() {
                let col = set.column_bytes(arena, c);
                values.push(f64::from_le_bytes(col[at..at + 8].try_into().unwrap()));
            }
            rows.push(DataRow { timestamp, values });
        }
    }

    /// True while the partition has unencoded samples or sealed-but-unflushed
    /// buffers. The eviction policy refuses such partitions.
    pub fn is_actively_ingesting(&self) -> bool {
        let buffered = self
            .active
            .lock()
            .as_ref()
            .is_some_and(|set| !set.is_empty());
        buffered || !self.frozen.lock().is_empty()
    }

    /// Returns every held buffer set to the pool. Called on eviction and
    /// shard reset; buffered samples are dropped.
    pub fn release_buffers(&self) {
        if let Some(set) = self.active.lock().take() {
            self.buffers.release(set);
        }
        for set in self.frozen.lock().drain(..) {
            self.buffers.release(set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockManager, ReclaimListener};

    struct NopListener;
    impl ReclaimListener for NopListener {
        fn on_reclaim(&self, _metadata: &[u8]) {}
    }

    fn fixtures() -> (Arc<WriteBufferPool>, Arc<BlockManager>) {
        let buffers = Arc::new(WriteBufferPool::new(4, 8, 2).unwrap());
        let blocks = Arc::new(BlockManager::new(1, 4, Arc::new(NopListener)).unwrap());
        (buffers, blocks)
    }

    fn row(timestamp: i64, value: f64) -> DataRow {
        DataRow {
            timestamp,
            values: vec![value],
        }
    }

    #[test]
    fn ingest_seals_full_buffer_sets() {
        let (buffers, _) = fixtures();
        let part = TimeSeriesPartition::new(1, vec![1, 2, 3], 0, buffers.clone());

        for i in 0..4 {
            part.ingest(&row(1000 + i, i as f64), 10 + i).unwrap();
        }
        // Capacity 4: the set sealed itself, no active buffer remains.
        assert!(part.is_actively_ingesting());
        assert_eq!(part.last_offset(), 13);
        assert_eq!(part.buffered_rows().len(), 4);
    }

    #[test]
    fn switch_buffers_freezes_active() {
        let (buffers, _) = fixtures();
        let part = TimeSeriesPartition::new(1, vec![0], 0, buffers.clone());

        part.ingest(&row(1000, 1.0), 1).unwrap();
        part.switch_buffers();
        assert!(part.is_actively_ingesting());

        // Switching with no active buffer is a no-op.
        part.switch_buffers();
        assert_eq!(part.buffered_rows().len(), 1);
    }

    #[test]
    fn make_flush_chunks_encodes_and_attaches() {
        let (buffers, blocks) = fixtures();
        let part = TimeSeriesPartition::new(7, vec![9], 0, buffers.clone());

        part.ingest(&row(5000, 1.5), 1).unwrap();
        part.ingest(&row(5001, 2.5), 2).unwrap();
        part.switch_buffers();

        let mut holder = crate::block::BlockHolder::new(blocks.clone());
        let sets = part.make_flush_chunks(&mut holder).unwrap();

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].chunk_id, 5000);
        assert_eq!(sets[0].num_samples, 2);
        assert_eq!(sets[0].partition_id, 7);

        assert_eq!(part.num_chunks(), 1);
        let chunks = part.chunks_snapshot();
        let rows = chunks[0].decode(&blocks);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 5000);
        assert_eq!(rows[1].values, vec![2.5]);

        // Buffers returned to the pool, nothing left unflushed.
        assert!(!part.is_actively_ingesting());
        assert_eq!(buffers.pool_size(), buffers.total_sets());
    }

    #[test]
    fn remove_chunks_at_drops_only_target() {
        let (buffers, blocks) = fixtures();
        let part = TimeSeriesPartition::new(1, vec![0], 0, buffers.clone());
        let mut holder = crate::block::BlockHolder::new(blocks.clone());

        for batch in 0..2 {
            for i in 0..2 {
                part.ingest(&row(batch * 100 + i, 0.0), batch * 10 + i).unwrap();
            }
            part.switch_buffers();
            part.make_flush_chunks(&mut holder).unwrap();
        }
        assert_eq!(part.num_chunks(), 2);

        part.remove_chunks_at(0);
        let chunks = part.chunks_snapshot();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, 100);

        // Removing an unknown chunk is silent.
        part.remove_chunks_at(42);
        assert_eq!(part.num_chunks(), 1);
    }

    #[test]
    fn snapshot_is_stable_across_mutation() {
        let (buffers, blocks) = fixtures();
        let part = TimeSeriesPartition::new(1, vec![0], 0, buffers.clone());
        let mut holder = crate::block::BlockHolder::new(blocks);

        part.ingest(&row(1, 0.0), 1).unwrap();
        part.switch_buffers();
        part.make_flush_chunks(&mut holder).unwrap();

        let snapshot = part.chunks_snapshot();
        part.remove_chunks_at(1);
        // The earlier snapshot still sees the chunk; the live list does not.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(part.num_chunks(), 0);
    }

    #[test]
    fn release_buffers_returns_sets_to_pool() {
        let (buffers, _) = fixtures();
        let part = TimeSeriesPartition::new(1, vec![0], 0, buffers.clone());

        part.ingest(&row(1, 0.0), 1).unwrap();
        part.switch_buffers();
        part.ingest(&row(2, 0.0), 2).unwrap();
        assert!(buffers.pool_size() < buffers.total_sets());

        part.release_buffers();
        assert_eq!(buffers.pool_size(), buffers.total_sets());
        assert!(!part.is_actively_ingesting());
    }
}
