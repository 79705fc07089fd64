//! Page-aligned block store for encoded chunks.
//!
//! The block arena is a single off-heap region carved into fixed-size blocks.
//! Flush holders fill blocks sequentially with (metadata-slot, payload) pairs;
//! under allocation pressure the manager recycles reclaimable blocks and
//! notifies the reclaim listener once per metadata slot so logical owners can
//! drop their chunk references.

use crate::arena::{OffHeapArena, PAGE_SIZE};
use crate::{MemShardError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Size of one chunk metadata slot: 4-byte partition ID + 8-byte chunk ID.
pub const CHUNK_META_SIZE: usize = 12;

/// Encodes a chunk metadata slot (little-endian, bit-exact layout).
pub fn encode_chunk_meta(partition_id: u32, chunk_id: i64) -> [u8; CHUNK_META_SIZE] {
    let mut slot = [0u8; CHUNK_META_SIZE];
    slot[0..4].copy_from_slice(&partition_id.to_le_bytes());
    slot[4..12].copy_from_slice(&chunk_id.to_le_bytes());
    slot
}

/// Decodes a chunk metadata slot. The slot must be exactly 12 bytes.
pub fn decode_chunk_meta(slot: &[u8]) -> (u32, i64) {
    assert_eq!(
        slot.len(),
        CHUNK_META_SIZE,
        "chunk metadata slot must be {CHUNK_META_SIZE} bytes, got {}",
        slot.len()
    );
    let partition_id = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
    let chunk_id = i64::from_le_bytes([
        slot[4], slot[5], slot[6], slot[7], slot[8], slot[9], slot[10], slot[11],
    ]);
    (partition_id, chunk_id)
}

/// Invoked once per metadata slot when a block is recycled.
///
/// Runs synchronously on whichever thread demanded the allocation. The
/// listener must not allocate from the block arena.
pub trait ReclaimListener: Send + Sync {
    fn on_reclaim(&self, metadata: &[u8]);
}

/// Index of a block within the arena.
pub type BlockId = usize;

/// A contiguous span inside the block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRegion {
    pub offset: usize,
    pub len: usize,
}

struct BlockState {
    /// Metadata slots written into this block, in write order.
    meta_slots: Vec<BlockRegion>,
    retain_until: Option<Instant>,
}

struct ManagerState {
    free: VecDeque<BlockId>,
    /// FIFO in mark order.
    reclaimable: VecDeque<BlockId>,
    blocks: Vec<BlockState>,
}

/// Owns the off-heap block arena and the reclaim protocol.
pub struct BlockManager {
    arena: OffHeapArena,
    block_size: usize,
    num_blocks: usize,
    state: Mutex<ManagerState>,
    listener: Arc<dyn ReclaimListener>,
    released: AtomicBool,
    blocks_reclaimed: AtomicU64,
}

impl BlockManager {
    pub fn new(
        shard_memory_mb: usize,
        num_block_pages: usize,
        listener: Arc<dyn ReclaimListener>,
    ) -> Result<Self> {
        let block_size = num_block_pages
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| MemShardError::InvalidConfiguration("block size overflow".into()))?;
        let arena_size = shard_memory_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| MemShardError::InvalidConfiguration("arena size overflow".into()))?;
        let num_blocks = arena_size / block_size;

        if num_blocks == 0 {
            return Err(MemShardError::InvalidConfiguration(format!(
                "shard memory of {shard_memory_mb} MiB holds no {num_block_pages}-page blocks"
            )));
        }

        let arena = OffHeapArena::new("block", num_blocks * block_size)?;
        let blocks = (0..num_blocks)
            .map(|_| BlockState {
                meta_slots: Vec::new(),
                retain_until: None,
            })
            .collect();

        Ok(Self {
            arena,
            block_size,
            num_blocks,
            state: Mutex::new(ManagerState {
                free: (0..num_blocks).collect(),
                reclaimable: VecDeque::new(),
                blocks,
            }),
            listener,
            released: AtomicBool::new(false),
            blocks_reclaimed: AtomicU64::new(0),
        })
    }

    /// Capacity of a single block in bytes.
    pub fn block_capacity(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_free_blocks(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn num_reclaimable_blocks(&self) -> usize {
        self.state.lock().reclaimable.len()
    }

    pub fn blocks_reclaimed(&self) -> u64 {
        self.blocks_reclaimed.load(Ordering::Relaxed)
    }

    fn base(&self, block: BlockId) -> usize {
        block * self.block_size
    }

    /// Hands out an empty block, recycling a reclaimable one under pressure.
    pub(crate) fn request_block(&self) -> Result<BlockId> {
        if self.released.load(Ordering::Acquire) {
            return Err(MemShardError::ShardTerminal);
        }

        let (block, slots) = {
            let mut state = self.state.lock();

            if let Some(block) = state.free.pop_front() {
                return Ok(block);
            }

            let now = Instant::now();
            let aged = state
                .reclaimable
                .iter()
                .position(|&b| state.blocks[b].retain_until.is_some_and(|t| t <= now));

            let block = match aged {
                Some(pos) => state.reclaimable.remove(pos),
                None => {
                    let block = state.reclaimable.pop_front();
                    if block.is_some() {
                        warn!("reclaiming block inside its retention horizon under pressure");
                    }
                    block
                }
            };

            let Some(block) = block else {
                return Err(MemShardError::ArenaExhausted {
                    arena: "block".to_string(),
                    requested: self.block_size,
                });
            };

            let slot_copies: Vec<[u8; CHUNK_META_SIZE]> = state.blocks[block]
                .meta_slots
                .iter()
                .map(|region| {
                    let mut copy = [0u8; CHUNK_META_SIZE];
                    copy.copy_from_slice(self.arena.read(region.offset, region.len));
                    copy
                })
                .collect();

            state.blocks[block].meta_slots.clear();
            state.blocks[block].retain_until = None;
            (block, slot_copies)
        };

        // Listener runs outside the state lock, on the thread demanding the
        // allocation. The block is not visible to anyone else yet.
        for slot in &slots {
            self.listener.on_reclaim(slot);
        }

        self.blocks_reclaimed.fetch_add(1, Ordering::Relaxed);
        debug!(block, slots = slots.len(), "block_reclaimed");
        Ok(block)
    }

    /// Queues a block for recycling once `horizon` has elapsed.
    pub fn mark_reclaimable(&self, block: BlockId, horizon: Duration) {
        let mut state = self.state.lock();
        state.blocks[block].retain_until = Some(Instant::now() + horizon);
        state.reclaimable.push_back(block);
    }

    pub(crate) fn record_meta_slot(&self, block: BlockId, region: BlockRegion) {
        self.state.lock().blocks[block].meta_slots.push(region);
    }

    pub(crate) fn arena(&self) -> &OffHeapArena {
        &self.arena
    }

    /// Reads the bytes of a previously allocated region.
    pub fn read_region(&self, region: BlockRegion) -> &[u8] {
        self.arena.read(region.offset, region.len)
    }

    /// Drops all block bookkeeping and returns physical pages to the OS.
    /// The manager is terminal afterward.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.free.clear();
        state.reclaimable.clear();
        for block in &mut state.blocks {
            block.meta_slots.clear();
            block.retain_until = None;
        }
        self.arena.release_physical_pages();
    }
}

/// A checked-out allocation context filling one block at a time.
///
/// Holders are borrowed from [`BlockHolderPool`] for a single flush (or a
/// demand-paging batch), then returned after marking the blocks they wrote.
pub struct BlockHolder {
    mgr: Arc<BlockManager>,
    current: Option<BlockId>,
    cursor: usize,
    used: Vec<BlockId>,
}

impl BlockHolder {
    pub(crate) fn new(mgr: Arc<BlockManager>) -> Self {
        Self {
            mgr,
            current: None,
            cursor: 0,
            used: Vec::new(),
        }
    }

    /// Ensures the current block has `need` contiguous bytes available.
    fn ensure_capacity(&mut self, need: usize) -> Result<BlockId> {
        if need > self.mgr.block_capacity() {
            return Err(MemShardError::AllocationTooLarge {
                requested: need,
                capacity: self.mgr.block_capacity(),
            });
        }

        match self.current {
            Some(block) if self.cursor + need <= self.mgr.block_capacity() => Ok(block),
            _ => {
                if let Some(full) = self.current.take() {
                    self.used.push(full);
                }
                let block = self.mgr.request_block()?;
                self.current = Some(block);
                self.cursor = 0;
                Ok(block)
            }
        }
    }

    fn append(&mut self, block: BlockId, bytes: &[u8]) -> BlockRegion {
        let offset = self.mgr.base(block) + self.cursor;
        self.mgr.arena().write(offset, bytes);
        self.cursor += bytes.len();
        BlockRegion {
            offset,
            len: bytes.len(),
        }
    }

    /// Appends a 12-byte chunk metadata slot into the current block.
    pub fn allocate_metadata(&mut self, slot: &[u8; CHUNK_META_SIZE]) -> Result<BlockRegion> {
        let block = self.ensure_capacity(CHUNK_META_SIZE)?;
        let region = self.append(block, slot);
        self.mgr.record_meta_slot(block, region);
        Ok(region)
    }

    /// Appends payload bytes into the current block.
    pub fn allocate_payload(&mut self, bytes: &[u8]) -> Result<BlockRegion> {
        let block = self.ensure_capacity(bytes.len())?;
        Ok(self.append(block, bytes))
    }

    /// Appends one chunk as a (metadata-slot, payload columns) pair,
    /// guaranteed co-located in a single block so reclaiming that block
    /// notifies the owner of every payload it invalidates.
    pub fn allocate_chunk(
        &mut self,
        slot: &[u8; CHUNK_META_SIZE],
        columns: &[&[u8]],
    ) -> Result<(BlockRegion, Vec<BlockRegion>)> {
        let total = CHUNK_META_SIZE + columns.iter().map(|c| c.len()).sum::<usize>();
        self.ensure_capacity(total)?;

        let meta = self.allocate_metadata(slot)?;
        let mut regions = Vec::with_capacity(columns.len());
        for column in columns {
            regions.push(self.allocate_payload(column)?);
        }
        Ok((meta, regions))
    }

    /// Queues every block this holder wrote for recycling after `horizon`.
    pub fn mark_used_blocks_reclaimable(&mut self, horizon: Duration) {
        if let Some(block) = self.current.take() {
            self.used.push(block);
        }
        self.cursor = 0;
        for block in self.used.drain(..) {
            self.mgr.mark_reclaimable(block, horizon);
        }
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.mgr
    }
}

/// Bounded pool of block holders.
pub struct BlockHolderPool {
    free: Mutex<Vec<BlockHolder>>,
    capacity: usize,
}

impl BlockHolderPool {
    pub fn new(mgr: Arc<BlockManager>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let free = (0..capacity).map(|_| BlockHolder::new(mgr.clone())).collect();
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn checkout(&self) -> Result<BlockHolder> {
        self.free.lock().pop().ok_or(MemShardError::PoolExhausted {
            pool: "block-holder".to_string(),
        })
    }

    pub fn release(&self, mut holder: BlockHolder) {
        // A well-behaved caller marked its blocks already; anything left is
        // recycled immediately so pooled holders never pin blocks.
        holder.mark_used_blocks_reclaimable(Duration::ZERO);
        self.free.lock().push(holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct RecordingListener {
        seen: PlMutex<Vec<(u32, i64)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: PlMutex::new(Vec::new()),
            })
        }
    }

    impl ReclaimListener for RecordingListener {
        fn on_reclaim(&self, metadata: &[u8]) {
            self.seen.lock().push(decode_chunk_meta(metadata));
        }
    }

    fn small_manager(listener: Arc<dyn ReclaimListener>) -> Arc<BlockManager> {
        // 1 MiB arena, 4-page (16 KiB) blocks -> 64 blocks.
        Arc::new(BlockManager::new(1, 4, listener).unwrap())
    }

    #[test]
    fn meta_slot_layout_is_bit_exact() {
        let slot = encode_chunk_meta(7, 0x0102_0304_0506_0708);
        assert_eq!(&slot[0..4], &7u32.to_le_bytes());
        assert_eq!(&slot[4..12], &0x0102_0304_0506_0708i64.to_le_bytes());
        assert_eq!(decode_chunk_meta(&slot), (7, 0x0102_0304_0506_0708));
    }

    #[test]
    #[should_panic(expected = "12 bytes")]
    fn decode_rejects_wrong_slot_size() {
        decode_chunk_meta(&[0u8; 8]);
    }

    #[test]
    fn holder_allocates_chunk_in_one_block() {
        let mgr = small_manager(RecordingListener::new());
        let mut holder = BlockHolder::new(mgr.clone());

        let slot = encode_chunk_meta(1, 100);
        let payload = vec![0xABu8; 256];
        let (meta, cols) = holder.allocate_chunk(&slot, &[&payload, &payload]).unwrap();

        assert_eq!(mgr.read_region(meta), &slot);
        assert_eq!(cols.len(), 2);
        assert!(mgr.read_region(cols[0]).iter().all(|&b| b == 0xAB));
        // Same block: all regions within one block span.
        let block = meta.offset / mgr.block_capacity();
        for col in &cols {
            assert_eq!(col.offset / mgr.block_capacity(), block);
        }
    }

    #[test]
    fn oversized_allocation_is_rejected() {
        let mgr = small_manager(RecordingListener::new());
        let mut holder = BlockHolder::new(mgr.clone());
        let too_big = vec![0u8; mgr.block_capacity() + 1];
        assert!(matches!(
            holder.allocate_payload(&too_big),
            Err(MemShardError::AllocationTooLarge { .. })
        ));
    }

    #[test]
    fn reclaim_notifies_listener_per_meta_slot() {
        let listener = RecordingListener::new();
        let mgr = small_manager(listener.clone());
        let mut holder = BlockHolder::new(mgr.clone());

        holder
            .allocate_chunk(&encode_chunk_meta(3, 30), &[&[1u8; 64][..]])
            .unwrap();
        holder
            .allocate_chunk(&encode_chunk_meta(4, 40), &[&[2u8; 64][..]])
            .unwrap();
        holder.mark_used_blocks_reclaimable(Duration::ZERO);

        // Exhaust the free list so the next request reclaims.
        while mgr.num_free_blocks() > 0 {
            let _ = mgr.request_block().unwrap();
        }
        let _ = mgr.request_block().unwrap();

        let seen = listener.seen.lock();
        assert_eq!(&*seen, &[(3, 30), (4, 40)]);
    }

    #[test]
    fn exhausted_arena_without_reclaimables_errors() {
        let mgr = small_manager(RecordingListener::new());
        while mgr.num_free_blocks() > 0 {
            let _ = mgr.request_block().unwrap();
        }
        assert!(matches!(
            mgr.request_block(),
            Err(MemShardError::ArenaExhausted { .. })
        ));
    }

    #[test]
    fn pool_checkout_release_cycles() {
        let mgr = small_manager(RecordingListener::new());
        let pool = BlockHolderPool::new(mgr, 2);

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert!(matches!(
            pool.checkout(),
            Err(MemShardError::PoolExhausted { .. })
        ));
        pool.release(a);
        pool.release(b);
        assert!(pool.checkout().is_ok());
    }

    #[test]
    fn release_makes_manager_terminal() {
        let mgr = small_manager(RecordingListener::new());
        mgr.release();
        assert!(matches!(
            mgr.request_block(),
            Err(MemShardError::ShardTerminal)
        ));
    }
}
