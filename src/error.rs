//! Error types for memshard.

use thiserror::Error;

/// Result type alias for memshard operations.
pub type Result<T> = std::result::Result<T, MemShardError>;

/// Main error type for memshard operations.
#[derive(Error, Debug)]
pub enum MemShardError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Off-heap arena '{arena}' exhausted: requested {requested} bytes")]
    ArenaExhausted { arena: String, requested: usize },

    #[error("Allocation of {requested} bytes exceeds block capacity of {capacity} bytes")]
    AllocationTooLarge { requested: usize, capacity: usize },

    #[error("Pool '{pool}' has no free entries")]
    PoolExhausted { pool: String },

    #[error("Shard has been shut down")]
    ShardTerminal,

    #[error("Row has {actual} value columns, schema expects {expected}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("Invalid series key: {0}")]
    InvalidSeriesKey(String),

    #[error("Partition {id} not found")]
    PartitionNotFound { id: u32 },

    #[error("Group {group} out of range for {num_groups} groups")]
    UnknownGroup { group: usize, num_groups: usize },

    #[error("Sink {operation} failed: {details}")]
    SinkWrite { operation: String, details: String },

    #[error("Metastore checkpoint write failed: {details}")]
    Metastore { details: String },

    #[error("Checkpoint offset {offset} must be positive")]
    InvalidCheckpointOffset { offset: i64 },

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("Channel receive error for {channel}")]
    ChannelReceive { channel: String },

    #[error("Channel timeout after {timeout_ms}ms")]
    ChannelTimeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl<T> From<crossbeam_channel::SendError<T>> for MemShardError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        MemShardError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvError> for MemShardError {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        MemShardError::ChannelReceive {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvTimeoutError> for MemShardError {
    fn from(e: crossbeam_channel::RecvTimeoutError) -> Self {
        match e {
            crossbeam_channel::RecvTimeoutError::Timeout => MemShardError::ChannelReceive {
                channel: "recv_timeout: deadline elapsed".to_string(),
            },
            crossbeam_channel::RecvTimeoutError::Disconnected => MemShardError::ChannelReceive {
                channel: "recv_timeout: channel disconnected".to_string(),
            },
        }
    }
}
