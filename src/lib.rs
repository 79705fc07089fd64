//! memshard - the in-memory shard of a sharded, append-mostly time-series store.
//!
//! A shard owns a disjoint subset of the dataset's time series, ingests
//! ordered sample records, buffers recent samples off-heap, periodically
//! encodes them into immutable chunks, flushes chunks and partition keys to a
//! durable columnar sink in hash-assigned groups, and serves queries over
//! both in-memory and demand-paged chunks.

pub mod arena;
pub mod block;
pub mod buffer;
pub mod config;
pub mod eviction;
pub mod error;
pub mod feed;
pub mod index;
pub mod label;
pub mod pagecache;
pub mod partition;
pub mod shard;
pub mod sink;
pub mod test_support;

pub use config::ShardConfig;
pub use error::{MemShardError, Result};
pub use feed::{FailedRecord, IngestionHandle};
pub use index::FilterExpr;
pub use label::Label;
pub use shard::{
    FlushGroup, FlushResponse, PartitionScan, ShardBuilder, ShardStatus, TimeSeriesShard,
};

use serde::{Deserialize, Serialize};

/// Dense identifier of a partition within one shard generation.
pub type PartitionId = u32;

/// Time-ordered identifier of an encoded chunk (first sample timestamp).
pub type ChunkId = i64;

/// One sample row: a timestamp plus one value per schema value column.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub timestamp: i64,
    pub values: Vec<f64>,
}

impl DataRow {
    pub fn new(timestamp: i64, values: Vec<f64>) -> Self {
        Self { timestamp, values }
    }
}

/// One record from the source feed.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    /// Labels identifying the time series; canonicalized on ingest.
    pub labels: Vec<Label>,
    pub row: DataRow,
    /// Monotonic source offset.
    pub offset: i64,
}

impl IngestRecord {
    pub fn new(labels: Vec<Label>, row: DataRow, offset: i64) -> Self {
        Self {
            labels,
            row,
            offset,
        }
    }
}

/// Static schema of the dataset a shard serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub dataset: String,
    /// Names of the f64 value columns; the timestamp column is implicit.
    pub value_columns: Vec<String>,
}

impl DatasetSchema {
    pub fn new(dataset: impl Into<String>, value_columns: Vec<String>) -> Self {
        Self {
            dataset: dataset.into(),
            value_columns,
        }
    }

    /// Total column count including the implicit timestamp column.
    pub fn num_columns(&self) -> usize {
        1 + self.value_columns.len()
    }
}
