//! In-memory collaborator doubles shared by unit and integration tests.

use crate::eviction::EvictionPolicy;
use crate::partition::{ChunkSet, TimeSeriesPartition};
use crate::sink::{ColumnSink, MetaStore, RawChunk, WriteResponse};
use crate::{MemShardError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Columnar sink that records every write and can be scripted to fail.
#[derive(Default)]
pub struct MemorySink {
    chunks: Mutex<Vec<ChunkSet>>,
    keys: Mutex<Vec<Vec<u8>>>,
    readback: Mutex<HashMap<Vec<u8>, Vec<RawChunk>>>,
    fail_chunk_writes: AtomicBool,
    fail_key_writes: AtomicBool,
    chunk_write_calls: AtomicUsize,
    key_write_calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_chunk_writes(&self, fail: bool) {
        self.fail_chunk_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_key_writes(&self, fail: bool) {
        self.fail_key_writes.store(fail, Ordering::SeqCst);
    }

    /// Registers chunks served by `read_chunks` for one partition key.
    pub fn preload_chunks(&self, partition_key: Vec<u8>, chunks: Vec<RawChunk>) {
        self.readback.lock().insert(partition_key, chunks);
    }

    pub fn written_chunks(&self) -> Vec<ChunkSet> {
        self.chunks.lock().clone()
    }

    pub fn written_keys(&self) -> Vec<Vec<u8>> {
        self.keys.lock().clone()
    }

    pub fn chunk_write_calls(&self) -> usize {
        self.chunk_write_calls.load(Ordering::SeqCst)
    }

    pub fn key_write_calls(&self) -> usize {
        self.key_write_calls.load(Ordering::SeqCst)
    }
}

impl ColumnSink for MemorySink {
    fn write_chunks(
        &self,
        _dataset: &str,
        _shard: u32,
        chunks: &mut dyn Iterator<Item = ChunkSet>,
    ) -> Result<WriteResponse> {
        self.chunk_write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_chunk_writes.load(Ordering::SeqCst) {
            return Err(MemShardError::SinkWrite {
                operation: "write_chunks".to_string(),
                details: "scripted failure".to_string(),
            });
        }

        let collected: Vec<ChunkSet> = chunks.collect();
        if collected.is_empty() {
            return Ok(WriteResponse::NotApplied);
        }
        self.chunks.lock().extend(collected);
        Ok(WriteResponse::Success)
    }

    fn write_partition_keys(
        &self,
        _dataset: &str,
        _shard: u32,
        keys: &mut dyn Iterator<Item = Vec<u8>>,
    ) -> Result<WriteResponse> {
        self.key_write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_key_writes.load(Ordering::SeqCst) {
            return Err(MemShardError::SinkWrite {
                operation: "write_partition_keys".to_string(),
                details: "scripted failure".to_string(),
            });
        }

        let collected: Vec<Vec<u8>> = keys.collect();
        if collected.is_empty() {
            return Ok(WriteResponse::NotApplied);
        }
        self.keys.lock().extend(collected);
        Ok(WriteResponse::Success)
    }

    fn read_chunks(
        &self,
        _dataset: &str,
        _shard: u32,
        partition_key: &[u8],
    ) -> Result<Vec<RawChunk>> {
        Ok(self
            .readback
            .lock()
            .get(partition_key)
            .cloned()
            .unwrap_or_default())
    }
}

/// Metastore double with per-group checkpoint storage and failure injection.
#[derive(Default)]
pub struct MemoryMetaStore {
    checkpoints: Mutex<HashMap<(String, u32, usize), i64>>,
    fail_writes: AtomicBool,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seeds a checkpoint as if written by a previous shard incarnation.
    pub fn preload(&self, dataset: &str, shard: u32, group: usize, offset: i64) {
        self.checkpoints
            .lock()
            .insert((dataset.to_string(), shard, group), offset);
    }

    pub fn checkpoint(&self, dataset: &str, shard: u32, group: usize) -> Option<i64> {
        self.checkpoints
            .lock()
            .get(&(dataset.to_string(), shard, group))
            .copied()
    }
}

impl MetaStore for MemoryMetaStore {
    fn write_checkpoint(&self, dataset: &str, shard: u32, group: usize, offset: i64) -> Result<()> {
        if offset <= 0 {
            return Err(MemShardError::InvalidCheckpointOffset { offset });
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MemShardError::Metastore {
                details: "scripted failure".to_string(),
            });
        }
        self.checkpoints
            .lock()
            .insert((dataset.to_string(), shard, group), offset);
        Ok(())
    }

    fn read_checkpoints(&self, dataset: &str, shard: u32) -> Result<Vec<(usize, i64)>> {
        Ok(self
            .checkpoints
            .lock()
            .iter()
            .filter(|((d, s, _), _)| d == dataset && *s == shard)
            .map(|((_, _, group), offset)| (*group, *offset))
            .collect())
    }
}

/// Eviction policy double: evicts exactly the scripted count on the next
/// check, then goes quiet.
#[derive(Default)]
pub struct ScriptedEvictionPolicy {
    pending: AtomicUsize,
}

impl ScriptedEvictionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evict_on_next_check(&self, count: usize) {
        self.pending.store(count, Ordering::SeqCst);
    }
}

impl EvictionPolicy for ScriptedEvictionPolicy {
    fn how_many_to_evict(&self, _current: usize, _max: usize) -> usize {
        self.pending.swap(0, Ordering::SeqCst)
    }

    fn can_evict(&self, partition: &TimeSeriesPartition) -> bool {
        !partition.is_actively_ingesting()
    }
}
