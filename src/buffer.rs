//! Off-heap write buffers for actively ingesting partitions.
//!
//! The pool owns its own arena, separate from the block store: write buffers
//! are mutable and short-lived, blocks are immutable once sealed. Each
//! partition holds at most one active buffer set at a time; on switch the set
//! is detached and becomes the frozen source for chunk encoding.

use crate::arena::OffHeapArena;
use crate::{MemShardError, Result};
use metrics::gauge;
use parking_lot::Mutex;

const SAMPLE_SIZE: usize = 8;

/// How much smaller than the full chunk size a fresh vector starts.
const INITIAL_CAPACITY_DIVISOR: usize = 8;

/// A set of per-column append buffers for one partition.
///
/// Column 0 is the timestamp column (i64), the rest are value columns (f64),
/// all fixed 8-byte little-endian samples. Each column has a region of
/// `max_capacity` samples reserved in the arena, but a fresh set starts with
/// a much smaller logical capacity and grows toward the reservation as
/// samples are appended.
pub struct WriteBufferSet {
    base: usize,
    num_columns: usize,
    /// Current logical capacity in samples; doubles up to `max_capacity`.
    capacity: usize,
    /// Samples reserved per column in the arena.
    max_capacity: usize,
    len: usize,
}

impl WriteBufferSet {
    fn column_base(&self, column: usize) -> usize {
        debug_assert!(column < self.num_columns);
        self.base + column * self.max_capacity * SAMPLE_SIZE
    }

    /// Number of samples appended so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the set has consumed its entire arena reservation.
    pub fn is_full(&self) -> bool {
        self.len == self.max_capacity
    }

    /// Current logical capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Appends one sample row. `values` must hold one entry per value column.
    pub fn append(&mut self, arena: &OffHeapArena, timestamp: i64, values: &[f64]) -> Result<()> {
        if values.len() != self.num_columns - 1 {
            return Err(MemShardError::SchemaMismatch {
                expected: self.num_columns - 1,
                actual: values.len(),
            });
        }
        if self.len == self.capacity {
            if self.capacity == self.max_capacity {
                return Err(MemShardError::ArenaExhausted {
                    arena: "write-buffer".to_string(),
                    requested: SAMPLE_SIZE * self.num_columns,
                });
            }
            // Grow within the reserved region; the column strides are fixed
            // at max_capacity, so this is pure capacity accounting.
            self.capacity = (self.capacity * 2).min(self.max_capacity);
        }

        let at = self.len * SAMPLE_SIZE;
        arena.write(self.column_base(0) + at, &timestamp.to_le_bytes());
        for (column, value) in values.iter().enumerate() {
            arena.write(self.column_base(column + 1) + at, &value.to_le_bytes());
        }
        self.len += 1;
        Ok(())
    }

    /// The raw bytes of one column, covering the appended samples.
    pub fn column_bytes<'a>(&self, arena: &'a OffHeapArena, column: usize) -> &'a [u8] {
        arena.read(self.column_base(column), self.len * SAMPLE_SIZE)
    }

    /// Timestamp of the first appended sample, if any.
    pub fn first_timestamp(&self, arena: &OffHeapArena) -> Option<i64> {
        if self.is_empty() {
            return None;
        }
        let bytes = arena.read(self.column_base(0), SAMPLE_SIZE);
        Some(i64::from_le_bytes(bytes.try_into().ok()?))
    }
}

/// Pool of reusable write-buffer sets backed by a dedicated off-heap arena.
pub struct WriteBufferPool {
    arena: OffHeapArena,
    free: Mutex<Vec<WriteBufferSet>>,
    total: usize,
    initial_capacity: usize,
}

impl WriteBufferPool {
    /// Sizes the arena at `max_chunks_size * 8 * max_num_partitions *
    /// num_columns` bytes and pre-carves one buffer-set reservation per
    /// partition slot. Sets are handed out undersized (an eighth of the
    /// chunk size) and grow into their reservation on demand.
    pub fn new(max_chunks_size: usize, max_num_partitions: usize, num_columns: usize) -> Result<Self> {
        if max_chunks_size == 0 || max_num_partitions == 0 || num_columns == 0 {
            return Err(MemShardError::InvalidConfiguration(
                "write buffer pool dimensions must be non-zero".to_string(),
            ));
        }

        let set_size = max_chunks_size * SAMPLE_SIZE * num_columns;
        let arena_size = set_size
            .checked_mul(max_num_partitions)
            .ok_or_else(|| MemShardError::InvalidConfiguration("buffer arena overflow".into()))?;
        let arena = OffHeapArena::new("write-buffer", arena_size)?;

        let initial_capacity = (max_chunks_size / INITIAL_CAPACITY_DIVISOR).max(1);
        let free = (0..max_num_partitions)
            .map(|i| WriteBufferSet {
                base: i * set_size,
                num_columns,
                capacity: initial_capacity,
                max_capacity: max_chunks_size,
                len: 0,
            })
            .collect();

        let pool = Self {
            arena,
            free: Mutex::new(free),
            total: max_num_partitions,
            initial_capacity,
        };
        pool.publish_size();
        Ok(pool)
    }

    pub(crate) fn arena(&self) -> &OffHeapArena {
        &self.arena
    }

    /// Number of sets currently available.
    pub fn pool_size(&self) -> usize {
        self.free.lock().len()
    }

    pub fn total_sets(&self) -> usize {
        self.total
    }

    fn publish_size(&self) {
        gauge!("memstore-writebuffer-pool-size").set(self.pool_size() as f64);
    }

    pub fn checkout(&self) -> Result<WriteBufferSet> {
        let set = self.free.lock().pop().ok_or(MemShardError::PoolExhausted {
            pool: "write-buffer".to_string(),
        })?;
        self.publish_size();
        Ok(set)
    }

    pub fn release(&self, mut set: WriteBufferSet) {
        set.len = 0;
        set.capacity = self.initial_capacity;
        self.free.lock().push(set);
        self.publish_size();
    }

    /// Returns physical pages to the OS. Used at shard shutdown.
    pub fn release_physical_pages(&self) {
        self.arena.release_physical_pages();
    }
}
