//! Anonymous off-heap memory regions.
//!
//! Both the block store and the write-buffer pool carve their allocations out
//! of a fixed-size anonymous mapping so buffered samples never touch the heap.

use crate::{MemShardError, Result};
use memmap2::MmapMut;

/// Page size assumed when sizing blocks.
pub const PAGE_SIZE: usize = 4096;

/// A fixed-size anonymous off-heap region.
///
/// Owners hand out non-overlapping `(offset, len)` regions; reads and writes
/// go through raw pointers so readers of one region can proceed while the
/// single writer fills another. Bounds are asserted on every access.
pub struct OffHeapArena {
    // Held for ownership; all access goes through `ptr`.
    _map: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// The arena itself is just a span of bytes; region disjointness is enforced
// by the allocating owner (BlockManager / WriteBufferPool).
unsafe impl Send for OffHeapArena {}
unsafe impl Sync for OffHeapArena {}

impl OffHeapArena {
    /// Maps a new zero-filled anonymous region of `len` bytes.
    pub fn new(name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(MemShardError::InvalidConfiguration(format!(
                "arena '{name}' must have a non-zero size"
            )));
        }

        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(MemShardError::Io)?;
        let ptr = map.as_mut_ptr();

        #[cfg(unix)]
        {
            // Chunk access is scattered; avoid read-ahead on the whole span.
            unsafe {
                libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_RANDOM);
            }
        }

        Ok(Self {
            _map: map,
            ptr,
            len,
        })
    }

    /// Total capacity in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "arena read out of bounds: offset={offset} len={len} capacity={}",
            self.len
        );
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    /// Writes `bytes` at `offset`. Callers must hold a region that does not
    /// overlap any region concurrently read or written.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset
                .checked_add(bytes.len())
                .is_some_and(|end| end <= self.len),
            "arena write out of bounds: offset={offset} len={} capacity={}",
            bytes.len(),
            self.len
        );
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
    }

    /// Returns physical pages to the OS. The mapping stays valid (pages read
    /// back as zero); used when a shard shuts down.
    pub fn release_physical_pages(&self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::madvise(self.ptr as *mut libc::c_void, self.len, libc::MADV_DONTNEED);
            }
        }
    }
}
