//! The shard engine.
//!
//! Owns partition identity, group bookkeeping, the off-heap pools, eviction,
//! grouped flush orchestration with checkpointing, and query dispatch. All
//! state-mutating operations (ingest, partition creation, buffer switches,
//! eviction, reset, shutdown) assume a single-writer discipline: they are
//! executed serially by one ingestion thread (see [`crate::feed`]). Flush
//! I/O runs on a separate executor and may overlap ingest of the next window
//! once the writer has switched the group's buffers.

use crate::block::{decode_chunk_meta, BlockHolder, BlockHolderPool, BlockManager, ReclaimListener};
use crate::buffer::WriteBufferPool;
use crate::config::ShardConfig;
use crate::eviction::{CapacityEvictionPolicy, EvictionPolicy};
use crate::index::{FilterExpr, PartitionKeyIndex};
use crate::label::marshal_series_key;
use crate::pagecache::DemandPagedChunkStore;
use crate::partition::{ChunkSet, TimeSeriesPartition};
use crate::sink::{ColumnSink, MetaStore, NoopMetaStore, NoopSink, WriteResponse};
use crate::{DataRow, DatasetSchema, IngestRecord, Label, MemShardError, PartitionId, Result};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Largest partition ID before the allocator wraps back to zero.
const MAX_PARTITION_ID: u32 = i32::MAX as u32;

/// Describes one flush invocation for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushGroup {
    pub group_num: usize,
    /// Offset up to which this flush makes the group durable. Must be
    /// positive for a checkpoint to be written.
    pub flush_watermark: i64,
}

/// Outcome of a flush task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResponse {
    /// Chunks and partition keys are durable and the checkpoint advanced.
    Success,
    /// Nothing to persist (or non-positive watermark); no checkpoint.
    NotApplied,
    /// A sink or metastore write failed after retries; the window's data is
    /// lost and will be replayed from the previous checkpoint.
    DataDropped,
}

/// A partition enumeration request.
#[derive(Debug, Clone)]
pub enum PartitionScan {
    SingleKey(Vec<Label>),
    MultiKey(Vec<Vec<Label>>),
    Filtered(Vec<FilterExpr>),
}

/// Point-in-time view of shard health, served by the ingestion handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatus {
    pub num_partitions: usize,
    pub latest_offset: i64,
    pub rows_ingested: u64,
    pub rows_skipped: u64,
}

/// Shard counters. Mirrors of the operational metrics, readable by tests.
#[derive(Default)]
pub struct ShardStats {
    pub(crate) rows_ingested: AtomicU64,
    pub(crate) rows_ingested_lifetime: AtomicU64,
    pub(crate) rows_skipped: AtomicU64,
    pub(crate) partitions_created: AtomicU64,
    pub(crate) partitions_evicted: AtomicU64,
    pub(crate) partitions_queried: AtomicU64,
    pub(crate) chunks_encoded: AtomicU64,
    pub(crate) chunks_queried: AtomicU64,
    pub(crate) chunks_paged_in: AtomicU64,
    pub(crate) chunk_ids_evicted: AtomicU64,
    pub(crate) samples_encoded: AtomicU64,
    pub(crate) encoded_bytes: AtomicU64,
    pub(crate) flushes_successful: AtomicU64,
    pub(crate) flushes_failed_partition_write: AtomicU64,
    pub(crate) flushes_failed_chunk_write: AtomicU64,
    pub(crate) flushes_failed_other: AtomicU64,
}

macro_rules! stat_reader {
    ($($name:ident),* $(,)?) => {
        $(pub fn $name(&self) -> u64 {
            self.$name.load(Ordering::Relaxed)
        })*
    };
}

impl ShardStats {
    stat_reader!(
        rows_ingested,
        rows_ingested_lifetime,
        rows_skipped,
        partitions_created,
        partitions_evicted,
        partitions_queried,
        chunks_encoded,
        chunks_queried,
        chunks_paged_in,
        chunk_ids_evicted,
        samples_encoded,
        encoded_bytes,
        flushes_successful,
        flushes_failed_partition_write,
        flushes_failed_chunk_write,
        flushes_failed_other,
    );
}

/// Reaches evicted-or-live partitions through the 12-byte metadata slot and
/// a shard-scoped lookup, keeping the block arena a pure byte store.
struct ShardReclaimListener {
    partitions: Arc<DashMap<PartitionId, Arc<TimeSeriesPartition>>>,
    stats: Arc<ShardStats>,
}

impl ReclaimListener for ShardReclaimListener {
    fn on_reclaim(&self, metadata: &[u8]) {
        let (partition_id, chunk_id) = decode_chunk_meta(metadata);
        self.stats.chunk_ids_evicted.fetch_add(1, Ordering::Relaxed);
        counter!("chunk-ids-evicted").increment(1);

        // The partition may already be evicted; the slot is then stale.
        if let Some(partition) = self.partitions.get(&partition_id) {
            partition.remove_chunks_at(chunk_id);
        }
    }
}

/// Builder for a [`TimeSeriesShard`].
pub struct ShardBuilder {
    schema: DatasetSchema,
    shard_num: u32,
    config: ShardConfig,
    sink: Arc<dyn ColumnSink>,
    metastore: Arc<dyn MetaStore>,
    policy: Arc<dyn EvictionPolicy>,
}

impl ShardBuilder {
    pub fn new(schema: DatasetSchema, shard_num: u32) -> Self {
        Self {
            schema,
            shard_num,
            config: ShardConfig::default(),
            sink: Arc::new(NoopSink),
            metastore: Arc::new(NoopMetaStore),
            policy: Arc::new(CapacityEvictionPolicy::default()),
        }
    }

    pub fn with_config(mut self, config: ShardConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ColumnSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metastore(mut self, metastore: Arc<dyn MetaStore>) -> Self {
        self.metastore = metastore;
        self
    }

    pub fn with_eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<Arc<TimeSeriesShard>> {
        self.config.validate()?;

        let num_groups = self.config.groups_per_shard;
        let buffers = Arc::new(WriteBufferPool::new(
            self.config.max_chunks_size,
            self.config.max_num_partitions,
            self.schema.num_columns(),
        )?);

        let partitions: Arc<DashMap<PartitionId, Arc<TimeSeriesPartition>>> =
            Arc::new(DashMap::new());
        let stats = Arc::new(ShardStats::default());

        let listener = Arc::new(ShardReclaimListener {
            partitions: partitions.clone(),
            stats: stats.clone(),
        });
        let blocks = Arc::new(BlockManager::new(
            self.config.shard_memory_mb,
            self.config.num_block_pages,
            listener,
        )?);
        let holders = BlockHolderPool::new(blocks.clone(), num_groups);

        let page_store = DemandPagedChunkStore::new(
            blocks.clone(),
            self.sink.clone(),
            self.schema.dataset.clone(),
            self.shard_num,
            self.config.demand_paged_retention(),
            stats.clone(),
        );

        let group_watermarks: Vec<AtomicI64> = (0..num_groups).map(|_| AtomicI64::new(0)).collect();
        for (group, offset) in self
            .metastore
            .read_checkpoints(&self.schema.dataset, self.shard_num)?
        {
            if group < num_groups && offset > 0 {
                group_watermarks[group].store(offset, Ordering::Relaxed);
                info!(group, offset, "recovered group watermark");
            }
        }

        let shard = Arc::new(TimeSeriesShard {
            schema: Arc::new(self.schema),
            shard_num: self.shard_num,
            config: self.config,
            num_groups,
            partitions,
            key_map: DashMap::new(),
            key_index: RwLock::new(PartitionKeyIndex::new()),
            partition_groups: (0..num_groups)
                .map(|_| RwLock::new(RoaringBitmap::new()))
                .collect(),
            part_keys_to_flush: (0..num_groups)
                .map(|_| [RwLock::new(RoaringBitmap::new()), RwLock::new(RoaringBitmap::new())])
                .collect(),
            group_watermarks,
            next_partition_id: AtomicU32::new(0),
            blocks,
            holders,
            buffers,
            page_store,
            sink: self.sink,
            metastore: self.metastore,
            policy: self.policy,
            stats,
            latest_offset: AtomicI64::new(0),
            terminal: AtomicBool::new(false),
        });

        Ok(shard)
    }
}

/// One shard of the in-memory store.
pub struct TimeSeriesShard {
    schema: Arc<DatasetSchema>,
    shard_num: u32,
    config: ShardConfig,
    num_groups: usize,
    partitions: Arc<DashMap<PartitionId, Arc<TimeSeriesPartition>>>,
    key_map: DashMap<Vec<u8>, PartitionId>,
    key_index: RwLock<PartitionKeyIndex>,
    /// Per-group membership bitmap.
    partition_groups: Vec<RwLock<RoaringBitmap>>,
    /// Double-buffered pending-flush bitmaps per group: slot 0 accumulates
    /// keys created since the last switch, slot 1 is what the in-flight
    /// flush persists.
    part_keys_to_flush: Vec<[RwLock<RoaringBitmap>; 2]>,
    group_watermarks: Vec<AtomicI64>,
    next_partition_id: AtomicU32,
    blocks: Arc<BlockManager>,
    holders: BlockHolderPool,
    buffers: Arc<WriteBufferPool>,
    page_store: DemandPagedChunkStore,
    sink: Arc<dyn ColumnSink>,
    metastore: Arc<dyn MetaStore>,
    policy: Arc<dyn EvictionPolicy>,
    stats: Arc<ShardStats>,
    latest_offset: AtomicI64,
    terminal: AtomicBool,
}

impl TimeSeriesShard {
    pub fn shard_num(&self) -> u32 {
        self.shard_num
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn stats(&self) -> &ShardStats {
        &self.stats
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Offset of the last record seen by `ingest`.
    pub fn latest_offset(&self) -> i64 {
        self.latest_offset.load(Ordering::Acquire)
    }

    /// Durable watermark of one group. Advanced only by successful
    /// checkpoints, never rewound.
    pub fn group_watermark(&self, group: usize) -> i64 {
        self.group_watermarks
            .get(group)
            .map(|w| w.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Deterministic group assignment; a pure function of the key.
    pub fn group_for_key(&self, bin_key: &[u8]) -> usize {
        (xxh3_64(bin_key) % self.num_groups as u64) as usize
    }

    /// Group assignment for a label set (canonicalized first).
    pub fn group_for_labels(&self, labels: &[Label]) -> Result<usize> {
        Ok(self.group_for_key(&marshal_series_key(labels)?))
    }

    fn ensure_operational(&self) -> Result<()> {
        if self.terminal.load(Ordering::Acquire) {
            return Err(MemShardError::ShardTerminal);
        }
        Ok(())
    }

    fn check_group(&self, group: usize) -> Result<()> {
        if group >= self.num_groups {
            return Err(MemShardError::UnknownGroup {
                group,
                num_groups: self.num_groups,
            });
        }
        Ok(())
    }

    /// Ingests one ordered batch from the source feed. Records below their
    /// group's watermark are skipped (recovery idempotence). Returns the
    /// offset of the last record in the batch.
    ///
    /// Must be called from the single ingestion thread.
    pub fn ingest(&self, records: &[IngestRecord]) -> Result<i64> {
        self.ensure_operational()?;

        let mut ingested = 0u64;
        let mut skipped = 0u64;

        for record in records {
            let bin_key = match marshal_series_key(&record.labels) {
                Ok(key) => key,
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "record rejected");
                    continue;
                }
            };
            let group = self.group_for_key(&bin_key);

            if record.offset < self.group_watermark(group) {
                skipped += 1;
                continue;
            }

            let partition = match self.key_map.get(&bin_key).map(|e| *e.value()) {
                Some(id) => self.partitions.get(&id).map(|e| e.value().clone()),
                None => None,
            };
            let partition = match partition {
                Some(p) => p,
                None => self.add_partition(bin_key, true)?,
            };

            if let Err(e) = partition.ingest(&record.row, record.offset) {
                warn!(
                    partition = partition.id(),
                    offset = record.offset,
                    error = %e,
                    "record rejected"
                );
                continue;
            }
            ingested += 1;
        }

        if let Some(last) = records.last() {
            self.latest_offset.store(last.offset, Ordering::Release);
            gauge!("shard-offset-latest-inmemory").set(last.offset as f64);
        }
        self.stats.rows_ingested.fetch_add(ingested, Ordering::Relaxed);
        self.stats
            .rows_ingested_lifetime
            .fetch_add(ingested, Ordering::Relaxed);
        self.stats.rows_skipped.fetch_add(skipped, Ordering::Relaxed);
        counter!("rows-ingested").increment(ingested);
        counter!("rows-skipped").increment(skipped);

        Ok(self.latest_offset())
    }

    /// Creates and registers a partition for a canonical binary key.
    ///
    /// Runs the eviction check first; must be called from the ingestion
    /// thread.
    pub fn add_partition(
        &self,
        bin_key: Vec<u8>,
        needs_persistence: bool,
    ) -> Result<Arc<TimeSeriesPartition>> {
        self.ensure_operational()?;
        self.check_and_evict_partitions();

        let id = self.allocate_partition_id();
        let group = self.group_for_key(&bin_key);
        let partition = Arc::new(TimeSeriesPartition::new(
            id,
            bin_key.clone(),
            group,
            self.buffers.clone(),
        ));

        self.key_index.write().add_key(&bin_key, id)?;
        self.partitions.insert(id, partition.clone());
        self.key_map.insert(bin_key, id);

        self.partition_groups[group].write().insert(id);
        if needs_persistence {
            self.part_keys_to_flush[group][0].write().insert(id);
        }

        self.stats.partitions_created.fetch_add(1, Ordering::Relaxed);
        counter!("partitions-created").increment(1);
        self.publish_partition_gauges();
        debug!(id, group, "partition created");
        Ok(partition)
    }

    /// Allocates the next dense partition ID, wrapping to zero at the end of
    /// the non-negative i32 space. A wrapped ID colliding with a live
    /// partition is fatal: the ID space is exhausted with live inhabitants
    /// and the shard must be re-created.
    fn allocate_partition_id(&self) -> PartitionId {
        let id = self.next_partition_id.load(Ordering::Relaxed);
        assert!(
            !self.partitions.contains_key(&id),
            "partition ID {id} still live after wraparound; ID space exhausted"
        );
        let next = if id >= MAX_PARTITION_ID { 0 } else { id + 1 };
        self.next_partition_id.store(next, Ordering::Relaxed);
        id
    }

    /// Seals every member partition's active buffer, then rotates the
    /// group's double-buffered pending-flush bitmaps.
    ///
    /// Called by the flush orchestrator just before flushing the group, on
    /// the ingestion thread.
    pub fn switch_group_buffers(&self, group: usize) -> Result<()> {
        self.ensure_operational()?;
        self.check_group(group)?;

        let members: Vec<PartitionId> = self.partition_groups[group].read().iter().collect();
        for id in members {
            if let Some(partition) = self.partitions.get(&id) {
                partition.switch_buffers();
            }
        }

        // Slot 1 (keys the previous flush persisted) swaps out for slot 0
        // (keys accumulated since); the swapped-out set is cleared and
        // begins accumulating again.
        let pair = &self.part_keys_to_flush[group];
        let mut slot0 = pair[0].write();
        let mut slot1 = pair[1].write();
        std::mem::swap(&mut *slot0, &mut *slot1);
        slot0.clear();
        Ok(())
    }

    /// Builds the flush task for one group. The returned task performs the
    /// sink and metastore I/O when executed, typically on a flush executor.
    pub fn create_flush_task(self: &Arc<Self>, flush_group: FlushGroup) -> FlushTask {
        FlushTask {
            shard: self.clone(),
            flush_group,
        }
    }

    /// Writes the group checkpoint and advances the watermark on success.
    fn commit_checkpoint(&self, flush_group: &FlushGroup) -> FlushResponse {
        let FlushGroup {
            group_num,
            flush_watermark,
        } = *flush_group;

        if flush_watermark <= 0 {
            return FlushResponse::NotApplied;
        }

        match self.metastore.write_checkpoint(
            &self.schema.dataset,
            self.shard_num,
            group_num,
            flush_watermark,
        ) {
            Ok(()) => {
                let watermark = &self.group_watermarks[group_num];
                if flush_watermark > watermark.load(Ordering::Acquire) {
                    watermark.store(flush_watermark, Ordering::Release);
                }
                self.stats.flushes_successful.fetch_add(1, Ordering::Relaxed);
                counter!("flushes-successful").increment(1);
                self.publish_offset_gauges();
                info!(group = group_num, watermark = flush_watermark, "checkpoint committed");
                FlushResponse::Success
            }
            Err(e) => {
                error!(group = group_num, error = %e, "checkpoint write failed");
                self.stats.flushes_failed_other.fetch_add(1, Ordering::Relaxed);
                counter!("flushes-failed-other").increment(1);
                FlushResponse::DataDropped
            }
        }
    }

    fn publish_offset_gauges(&self) {
        let latest = (0..self.num_groups)
            .map(|g| self.group_watermark(g))
            .max()
            .unwrap_or(0);
        let earliest = (0..self.num_groups)
            .map(|g| self.group_watermark(g))
            .min()
            .unwrap_or(0);
        gauge!("shard-offset-flushed-latest").set(latest as f64);
        gauge!("shard-offset-flushed-earliest").set(earliest as f64);
    }

    fn publish_partition_gauges(&self) {
        gauge!("num-partitions").set(self.partitions.len() as f64);
        let index = self.key_index.read();
        gauge!("memstore-index-entries").set(index.entry_count() as f64);
        gauge!("memstore-index-bytes").set(index.approximate_bytes() as f64);
    }

    /// Evicts partitions if the policy demands it. Runs in-stream on the
    /// ingestion thread before a partition is created, so there are no
    /// concurrent mutators.
    pub fn check_and_evict_partitions(&self) {
        let count = self
            .policy
            .how_many_to_evict(self.partitions.len(), self.config.max_num_partitions);
        if count == 0 {
            return;
        }

        let mut ids: Vec<PartitionId> = self.partitions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        let mut evicted = RoaringBitmap::new();
        let mut victims: Vec<Arc<TimeSeriesPartition>> = Vec::new();
        for id in ids {
            if victims.len() == count {
                break;
            }
            let Some(partition) = self.partitions.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            if self.policy.can_evict(&partition) {
                evicted.insert(id);
                victims.push(partition);
            }
        }

        if victims.is_empty() {
            debug!(requested = count, "eviction requested but no partition is evictable");
            return;
        }

        self.key_index.write().remove_ids(&evicted);

        for group in 0..self.num_groups {
            *self.partition_groups[group].write() -= &evicted;
            // Slot 1 is untouched: a concurrent flush is reading it.
            *self.part_keys_to_flush[group][0].write() -= &evicted;
        }

        let evicted_count = victims.len() as u64;
        for partition in victims {
            self.partitions.remove(&partition.id());
            self.key_map.remove(partition.bin_partition());
            partition.release_buffers();
        }

        self.stats
            .partitions_evicted
            .fetch_add(evicted_count, Ordering::Relaxed);
        counter!("partitions-evicted").increment(evicted_count);
        self.publish_partition_gauges();
        info!(evicted = evicted_count, "partitions evicted");
    }

    /// Enumerates partitions matching the scan. The iterator is lazy:
    /// partitions are resolved as they are yielded, IDs that raced with
    /// eviction are silently skipped, and every yielded partition counts
    /// toward `partitions-queried`.
    pub fn scan_partitions(&self, scan: PartitionScan) -> PartitionIter {
        let (ids, residuals) = match scan {
            PartitionScan::SingleKey(labels) => {
                // Keys that cannot marshal cannot name a live partition.
                let ids = marshal_series_key(&labels)
                    .ok()
                    .and_then(|key| self.key_map.get(&key).map(|e| vec![*e.value()]))
                    .unwrap_or_default();
                (ids, Vec::new())
            }
            PartitionScan::MultiKey(keys) => {
                let ids = keys
                    .iter()
                    .filter_map(|labels| {
                        let key = marshal_series_key(labels).ok()?;
                        self.key_map.get(&key).map(|e| *e.value())
                    })
                    .collect();
                (ids, Vec::new())
            }
            PartitionScan::Filtered(filters) => {
                if filters.is_empty() {
                    (self.all_partition_ids(), Vec::new())
                } else {
                    let matched = self.key_index.read().parse_filters(&filters);
                    let ids = match matched.ids {
                        Some(bitmap) => bitmap.iter().collect(),
                        None => self.all_partition_ids(),
                    };
                    (ids, matched.residuals)
                }
            }
        };

        PartitionIter {
            ids: ids.into_iter(),
            partitions: self.partitions.clone(),
            stats: self.stats.clone(),
            residuals,
        }
    }

    /// Indexed column names, for introspection.
    pub fn index_names(&self) -> Vec<String> {
        self.key_index.read().index_names()
    }

    /// Indexed values under one column name, for introspection.
    pub fn index_values(&self, name: &str) -> Vec<Vec<u8>> {
        self.key_index.read().index_values(name)
    }

    fn all_partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Reads every sample of one partition: encoded chunks (demand-paging
    /// them in from the sink when none are resident) followed by buffered
    /// rows.
    pub fn read_partition_rows(&self, partition: &TimeSeriesPartition) -> Result<Vec<DataRow>> {
        let mut chunks = partition.chunks_snapshot();
        if chunks.is_empty() {
            self.page_store.page_in(partition)?;
            chunks = partition.chunks_snapshot();
        }

        let mut rows = Vec::new();
        for chunk in chunks.iter() {
            rows.extend(chunk.decode(&self.blocks));
        }
        self.stats
            .chunks_queried
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        counter!("chunks-queried").increment(chunks.len() as u64);

        rows.extend(partition.buffered_rows());
        Ok(rows)
    }

    /// Current health view.
    pub fn status(&self) -> ShardStatus {
        ShardStatus {
            num_partitions: self.partitions.len(),
            latest_offset: self.latest_offset(),
            rows_ingested: self.stats.rows_ingested(),
            rows_skipped: self.stats.rows_skipped(),
        }
    }

    /// Clears all logical state. Off-heap memory is retained; the shard
    /// remains usable and starts a fresh generation of partition IDs.
    pub fn reset(&self) {
        for entry in self.partitions.iter() {
            entry.value().release_buffers();
        }
        self.partitions.clear();
        self.key_map.clear();
        self.key_index.write().clear();

        for group in 0..self.num_groups {
            self.partition_groups[group].write().clear();
            self.part_keys_to_flush[group][0].write().clear();
            self.part_keys_to_flush[group][1].write().clear();
            self.group_watermarks[group].store(0, Ordering::Release);
        }

        self.stats.rows_ingested.store(0, Ordering::Relaxed);
        self.stats.rows_skipped.store(0, Ordering::Relaxed);
        self.latest_offset.store(0, Ordering::Release);
        self.next_partition_id.store(0, Ordering::Relaxed);
        self.publish_partition_gauges();
        self.publish_offset_gauges();
        info!(shard = self.shard_num, "shard reset");
    }

    /// Releases both off-heap arenas after a reset. The shard is terminal
    /// afterward; in-flight flushes lose unwritten data by design.
    pub fn shutdown(&self) {
        self.reset();
        self.terminal.store(true, Ordering::Release);
        self.blocks.release();
        self.buffers.release_physical_pages();
        info!(shard = self.shard_num, "shard shut down");
    }
}

/// Lazy iterator over scanned partitions.
pub struct PartitionIter {
    ids: std::vec::IntoIter<PartitionId>,
    partitions: Arc<DashMap<PartitionId, Arc<TimeSeriesPartition>>>,
    stats: Arc<ShardStats>,
    residuals: Vec<FilterExpr>,
}

impl PartitionIter {
    /// Filters the key index could not resolve; the caller applies them
    /// against the yielded partitions.
    pub fn residual_filters(&self) -> &[FilterExpr] {
        &self.residuals
    }
}

impl Iterator for PartitionIter {
    type Item = Arc<TimeSeriesPartition>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.ids.next()?;
            if let Some(partition) = self.partitions.get(&id) {
                self.stats.partitions_queried.fetch_add(1, Ordering::Relaxed);
                counter!("partitions-queried").increment(1);
                return Some(partition.value().clone());
            }
            // Raced with eviction; skip.
        }
    }
}

/// A pending flush of one group. Executing it performs sink and metastore
/// I/O; the shard itself never blocks on it.
#[must_use = "executing the task performs the flush"]
pub struct FlushTask {
    shard: Arc<TimeSeriesShard>,
    flush_group: FlushGroup,
}

impl FlushTask {
    pub fn group(&self) -> usize {
        self.flush_group.group_num
    }

    /// Runs the flush to completion and returns the merged outcome.
    ///
    /// Sink failures are swallowed into [`FlushResponse::DataDropped`] so the
    /// next group's flush can proceed; the holder is released on every path.
    pub fn execute(self) -> FlushResponse {
        let shard = &self.shard;
        let group = self.flush_group.group_num;
        if let Err(e) = shard.check_group(group) {
            warn!(error = %e, "flush requested for unknown group");
            return FlushResponse::NotApplied;
        }

        let members: Vec<PartitionId> = shard.partition_groups[group].read().iter().collect();
        if members.is_empty() {
            // Still checkpoint so the watermark advances and recovery does
            // not rewind over an idle group.
            return shard.commit_checkpoint(&self.flush_group);
        }

        let mut holder = match shard.holders.checkout() {
            Ok(holder) => holder,
            Err(e) => {
                error!(group, error = %e, "no flush holder available");
                shard.stats.flushes_failed_other.fetch_add(1, Ordering::Relaxed);
                counter!("flushes-failed-other").increment(1);
                return FlushResponse::DataDropped;
            }
        };

        let response = match Self::run(shard, &self.flush_group, &members, &mut holder) {
            Ok(response) => response,
            Err(e) => {
                error!(group, error = %e, "flush failed unexpectedly");
                shard.stats.flushes_failed_other.fetch_add(1, Ordering::Relaxed);
                counter!("flushes-failed-other").increment(1);
                FlushResponse::DataDropped
            }
        };

        holder.mark_used_blocks_reclaimable(shard.config.demand_paged_retention());
        shard.holders.release(holder);
        response
    }

    fn run(
        shard: &Arc<TimeSeriesShard>,
        flush_group: &FlushGroup,
        members: &[PartitionId],
        holder: &mut BlockHolder,
    ) -> Result<FlushResponse> {
        let group = flush_group.group_num;

        let partitions: Vec<Arc<TimeSeriesPartition>> = members
            .iter()
            .filter_map(|id| shard.partitions.get(id).map(|e| e.value().clone()))
            .collect();

        let mut stream = FlushChunkStream {
            partitions: partitions.into_iter(),
            pending: Vec::new().into_iter(),
            holder,
            stats: &*shard.stats,
        };
        let chunk_result =
            shard
                .sink
                .write_chunks(&shard.schema.dataset, shard.shard_num, &mut stream);

        let key_ids: Vec<PartitionId> = shard.part_keys_to_flush[group][1].read().iter().collect();
        let keys: Vec<Vec<u8>> = key_ids
            .iter()
            .filter_map(|id| {
                shard
                    .partitions
                    .get(id)
                    .map(|e| e.value().bin_partition().to_vec())
            })
            .collect();
        let key_result = shard.sink.write_partition_keys(
            &shard.schema.dataset,
            shard.shard_num,
            &mut keys.into_iter(),
        );

        match (chunk_result, key_result) {
            (Err(e), _) => {
                warn!(group, error = %e, "chunk write failed; window dropped");
                shard
                    .stats
                    .flushes_failed_chunk_write
                    .fetch_add(1, Ordering::Relaxed);
                counter!("flushes-failed-chunk-write").increment(1);
                Ok(FlushResponse::DataDropped)
            }
            (_, Err(e)) => {
                warn!(group, error = %e, "partition key write failed; window dropped");
                shard
                    .stats
                    .flushes_failed_partition_write
                    .fetch_add(1, Ordering::Relaxed);
                counter!("flushes-failed-partition-write").increment(1);
                Ok(FlushResponse::DataDropped)
            }
            (Ok(WriteResponse::NotApplied), Ok(_)) => Ok(FlushResponse::NotApplied),
            (Ok(WriteResponse::Success), Ok(_)) => Ok(shard.commit_checkpoint(flush_group)),
        }
    }
}

/// Lazily encodes each member partition's frozen buffers as the sink pulls
/// the stream, so no more than one partition's chunks are materialized ahead
/// of the write.
struct FlushChunkStream<'a> {
    partitions: std::vec::IntoIter<Arc<TimeSeriesPartition>>,
    pending: std::vec::IntoIter<ChunkSet>,
    holder: &'a mut BlockHolder,
    stats: &'a ShardStats,
}

impl Iterator for FlushChunkStream<'_> {
    type Item = ChunkSet;

    fn next(&mut self) -> Option<ChunkSet> {
        loop {
            if let Some(set) = self.pending.next() {
                self.stats.chunks_encoded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .samples_encoded
                    .fetch_add(set.num_samples as u64, Ordering::Relaxed);
                self.stats
                    .encoded_bytes
                    .fetch_add(set.encoded_bytes() as u64, Ordering::Relaxed);
                counter!("chunks-encoded").increment(1);
                counter!("samples-encoded").increment(set.num_samples as u64);
                counter!("encoded-bytes").increment(set.encoded_bytes() as u64);
                return Some(set);
            }

            let partition = self.partitions.next()?;
            match partition.make_flush_chunks(self.holder) {
                Ok(sets) => self.pending = sets.into_iter(),
                Err(e) => {
                    warn!(partition = partition.id(), error = %e, "chunk encode failed");
                    self.stats.flushes_failed_other.fetch_add(1, Ordering::Relaxed);
                    counter!("flushes-failed-other").increment(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryMetaStore, MemorySink};

    fn schema() -> DatasetSchema {
        DatasetSchema::new("telemetry", vec!["value".to_string()])
    }

    fn small_config() -> ShardConfig {
        ShardConfig::new()
            .with_max_chunks_size(4)
            .with_shard_memory_mb(1)
            .with_num_block_pages(4)
            .with_groups_per_shard(4)
            .with_max_num_partitions(16)
    }

    fn build_shard() -> Arc<TimeSeriesShard> {
        ShardBuilder::new(schema(), 0)
            .with_config(small_config())
            .build()
            .unwrap()
    }

    fn record(name: &str, offset: i64) -> IngestRecord {
        IngestRecord::new(
            vec![Label::new("series", name)],
            DataRow::new(offset * 10, vec![1.0]),
            offset,
        )
    }

    #[test]
    fn group_assignment_is_stable() {
        let shard = build_shard();
        let key = marshal_series_key(&[Label::new("series", "A")]).unwrap();
        let group = shard.group_for_key(&key);
        for _ in 0..10 {
            assert_eq!(shard.group_for_key(&key), group);
        }
        assert!(group < shard.num_groups());
    }

    #[test]
    fn dual_maps_agree_after_ingest() {
        let shard = build_shard();
        shard
            .ingest(&[record("A", 1), record("B", 2), record("A", 3)])
            .unwrap();

        assert_eq!(shard.num_partitions(), 2);
        for entry in shard.partitions.iter() {
            let id = *entry.key();
            let key = entry.value().bin_partition().to_vec();
            assert_eq!(*shard.key_map.get(&key).unwrap().value(), id);
        }
    }

    #[test]
    fn group_bitmaps_reference_live_partitions() {
        let shard = build_shard();
        shard
            .ingest(&[record("A", 1), record("B", 2), record("C", 3)])
            .unwrap();

        for group in 0..shard.num_groups() {
            for id in shard.partition_groups[group].read().iter() {
                let partition = shard.partitions.get(&id).expect("bitmap id must be live");
                assert_eq!(partition.group(), group);
            }
        }
    }

    #[test]
    fn partition_ids_are_dense_and_unique() {
        let shard = build_shard();
        for i in 0..5 {
            shard.ingest(&[record(&format!("s{i}"), i + 1)]).unwrap();
        }
        let mut ids: Vec<u32> = shard.partitions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn id_allocator_wraps_to_zero() {
        let shard = build_shard();
        shard
            .next_partition_id
            .store(MAX_PARTITION_ID, Ordering::Relaxed);
        let id = shard.allocate_partition_id();
        assert_eq!(id, MAX_PARTITION_ID);
        assert_eq!(shard.next_partition_id.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "ID space exhausted")]
    fn wrapped_id_collision_is_fatal() {
        let shard = build_shard();
        shard.ingest(&[record("A", 1)]).unwrap();
        // Force the allocator back onto the live ID 0.
        shard.next_partition_id.store(0, Ordering::Relaxed);
        shard.allocate_partition_id();
    }

    #[test]
    fn switch_rotates_pending_flush_bitmaps() {
        let shard = build_shard();
        shard.ingest(&[record("A", 1)]).unwrap();
        let key = marshal_series_key(&[Label::new("series", "A")]).unwrap();
        let group = shard.group_for_key(&key);

        assert_eq!(shard.part_keys_to_flush[group][0].read().len(), 1);
        assert_eq!(shard.part_keys_to_flush[group][1].read().len(), 0);

        shard.switch_group_buffers(group).unwrap();
        assert_eq!(shard.part_keys_to_flush[group][0].read().len(), 0);
        assert_eq!(shard.part_keys_to_flush[group][1].read().len(), 1);

        // The next switch clears the persisted set.
        shard.switch_group_buffers(group).unwrap();
        assert_eq!(shard.part_keys_to_flush[group][1].read().len(), 0);
    }

    #[test]
    fn scan_single_key_counts_queried() {
        let shard = build_shard();
        shard.ingest(&[record("A", 1), record("B", 2)]).unwrap();

        let found: Vec<_> = shard
            .scan_partitions(PartitionScan::SingleKey(vec![Label::new("series", "A")]))
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(shard.stats().partitions_queried(), 1);

        let missing: Vec<_> = shard
            .scan_partitions(PartitionScan::SingleKey(vec![Label::new("series", "Z")]))
            .collect();
        assert!(missing.is_empty());
    }

    #[test]
    fn scan_filtered_empty_filters_yields_all() {
        let shard = build_shard();
        shard
            .ingest(&[record("A", 1), record("B", 2), record("C", 3)])
            .unwrap();
        let found: Vec<_> = shard
            .scan_partitions(PartitionScan::Filtered(Vec::new()))
            .collect();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn reset_clears_state_but_stays_usable() {
        let shard = build_shard();
        shard.ingest(&[record("A", 5)]).unwrap();
        shard.reset();

        assert_eq!(shard.num_partitions(), 0);
        assert_eq!(shard.latest_offset(), 0);
        assert_eq!(shard.stats().rows_ingested(), 0);
        for group in 0..shard.num_groups() {
            assert_eq!(shard.group_watermark(group), 0);
        }

        // Fresh generation: ingest works and IDs restart at zero.
        shard.ingest(&[record("A", 6)]).unwrap();
        assert_eq!(shard.num_partitions(), 1);
        assert!(shard.partitions.contains_key(&0));
    }

    #[test]
    fn shutdown_is_terminal() {
        let shard = build_shard();
        shard.ingest(&[record("A", 1)]).unwrap();
        shard.shutdown();
        assert!(matches!(
            shard.ingest(&[record("B", 2)]),
            Err(MemShardError::ShardTerminal)
        ));
    }

    #[test]
    fn watermarks_recover_from_metastore() {
        let metastore = Arc::new(MemoryMetaStore::new());
        metastore.preload("telemetry", 0, 2, 77);

        let shard = ShardBuilder::new(schema(), 0)
            .with_config(small_config())
            .with_metastore(metastore)
            .build()
            .unwrap();
        assert_eq!(shard.group_watermark(2), 77);
    }

    #[test]
    fn flush_task_for_unknown_group_is_not_applied() {
        let shard = build_shard();
        let response = shard
            .create_flush_task(FlushGroup {
                group_num: 99,
                flush_watermark: 10,
            })
            .execute();
        assert_eq!(response, FlushResponse::NotApplied);
    }

    #[test]
    fn commit_checkpoint_rejects_non_positive_watermark() {
        let shard = build_shard();
        assert_eq!(
            shard.commit_checkpoint(&FlushGroup {
                group_num: 0,
                flush_watermark: 0,
            }),
            FlushResponse::NotApplied
        );
        assert_eq!(shard.group_watermark(0), 0);
    }

    #[test]
    fn watermark_never_rewinds() {
        let sink = Arc::new(MemorySink::new());
        let metastore = Arc::new(MemoryMetaStore::new());
        let shard = ShardBuilder::new(schema(), 0)
            .with_config(small_config())
            .with_sink(sink)
            .with_metastore(metastore)
            .build()
            .unwrap();

        assert_eq!(
            shard.commit_checkpoint(&FlushGroup {
                group_num: 1,
                flush_watermark: 100,
            }),
            FlushResponse::Success
        );
        assert_eq!(
            shard.commit_checkpoint(&FlushGroup {
                group_num: 1,
                flush_watermark: 50,
            }),
            FlushResponse::Success
        );
        assert_eq!(shard.group_watermark(1), 100);
    }
}
