//! Interfaces to the durable columnar sink and the checkpoint metastore.
//!
//! Both collaborators live outside this crate; implementations are expected
//! to retry internally, so only post-retry failure surfaces as an error.

use crate::partition::ChunkSet;
use crate::{MemShardError, Result};

/// Outcome of a sink write that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResponse {
    Success,
    /// The sink accepted the call but applied nothing (e.g. empty stream).
    NotApplied,
}

/// A raw chunk read back from the sink for demand paging.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub chunk_id: i64,
    pub num_samples: usize,
    pub columns: Vec<Vec<u8>>,
}

/// The durable columnar sink.
pub trait ColumnSink: Send + Sync {
    /// Streams encoded chunks to the sink.
    fn write_chunks(
        &self,
        dataset: &str,
        shard: u32,
        chunks: &mut dyn Iterator<Item = ChunkSet>,
    ) -> Result<WriteResponse>;

    /// Streams newly created partition keys to the sink.
    fn write_partition_keys(
        &self,
        dataset: &str,
        shard: u32,
        keys: &mut dyn Iterator<Item = Vec<u8>>,
    ) -> Result<WriteResponse>;

    /// Reads back the persisted chunks for one partition key.
    fn read_chunks(&self, dataset: &str, shard: u32, partition_key: &[u8]) -> Result<Vec<RawChunk>>;
}

/// The checkpoint metastore.
pub trait MetaStore: Send + Sync {
    /// Persists a per-(dataset, shard, group) watermark. `offset` must be
    /// positive.
    fn write_checkpoint(&self, dataset: &str, shard: u32, group: usize, offset: i64) -> Result<()>;

    /// Reads all group watermarks for one shard; used at recovery.
    fn read_checkpoints(&self, dataset: &str, shard: u32) -> Result<Vec<(usize, i64)>>;
}

/// Sink that accepts and discards everything. Used for pure in-memory
/// operation.
pub struct NoopSink;

impl ColumnSink for NoopSink {
    fn write_chunks(
        &self,
        _dataset: &str,
        _shard: u32,
        chunks: &mut dyn Iterator<Item = ChunkSet>,
    ) -> Result<WriteResponse> {
        if chunks.next().is_none() {
            return Ok(WriteResponse::NotApplied);
        }
        chunks.for_each(drop);
        Ok(WriteResponse::Success)
    }

    fn write_partition_keys(
        &self,
        _dataset: &str,
        _shard: u32,
        keys: &mut dyn Iterator<Item = Vec<u8>>,
    ) -> Result<WriteResponse> {
        keys.for_each(drop);
        Ok(WriteResponse::Success)
    }

    fn read_chunks(
        &self,
        _dataset: &str,
        _shard: u32,
        _partition_key: &[u8],
    ) -> Result<Vec<RawChunk>> {
        Ok(Vec::new())
    }
}

/// Metastore that accepts every positive checkpoint and remembers nothing.
pub struct NoopMetaStore;

impl MetaStore for NoopMetaStore {
    fn write_checkpoint(
        &self,
        _dataset: &str,
        _shard: u32,
        _group: usize,
        offset: i64,
    ) -> Result<()> {
        if offset <= 0 {
            return Err(MemShardError::InvalidCheckpointOffset { offset });
        }
        Ok(())
    }

    fn read_checkpoints(&self, _dataset: &str, _shard: u32) -> Result<Vec<(usize, i64)>> {
        Ok(Vec::new())
    }
}
