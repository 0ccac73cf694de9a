//! Footprint-limited allocator over one shared memfd segment.
//!
//! Every standalone blob is carved out of a single [`SharedMemorySegment`]
//! created at startup. The free list is a first-fit linked list living inside
//! the segment itself (`linked_list_allocator::Heap`), so blocks never move:
//! a block stays at the address it was handed out at until it is freed, which
//! is what lets object ids be derived from addresses.
//!
//! ```text
//! segment (memfd, MAP_SHARED)
//! ┌──────────┬──────┬────────────┬──────┬──────────────────────────────┐
//! │ block A  │ hole │  block B   │ hole │             hole             │
//! └──────────┴──────┴────────────┴──────┴──────────────────────────────┘
//! ^ base                                                  base + capacity ^
//! ```
//!
//! The ceiling is the segment size: once no hole is large enough,
//! [`BulkAllocator::memalign`] returns `None` and the caller decides what to
//! report. There is no retry and no eviction.

use super::defaults::BLOCK_SIZE;
use super::{MemorySegment, SharedMemorySegment};
use crate::error::{Error, Result};
use linked_list_allocator::Heap;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Where a block lives, as a client sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    /// Descriptor of the backing segment.
    pub fd: RawFd,
    /// Size of the whole mapping behind `fd`.
    pub map_size: usize,
    /// Offset of the block from the start of the mapping.
    pub offset: usize,
}

/// General-purpose allocator over a single shared segment.
pub struct BulkAllocator {
    segment: SharedMemorySegment,
    heap: Mutex<SegmentHeap>,
}

/// The free list, which lives inside the segment.
struct SegmentHeap(Heap);

// SAFETY: the heap only points into the segment, which is valid from any
// thread, and every access goes through the mutex.
unsafe impl Send for SegmentHeap {}

impl BulkAllocator {
    /// Map a segment of `capacity` bytes and place an empty heap over it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughMemory`] if the segment cannot be created or
    /// is too small to hold the allocator's bookkeeping.
    pub fn new(name: &str, capacity: usize) -> Result<Self> {
        if capacity < BLOCK_SIZE {
            return Err(Error::NotEnoughMemory(format!(
                "capacity {capacity} is below the minimum of {BLOCK_SIZE}"
            )));
        }
        let segment = SharedMemorySegment::new(name, capacity)?;

        // SAFETY: the segment is a fresh mapping of `capacity` bytes that
        // nothing else references yet, and it outlives the heap because both
        // are owned by `self` and the heap is never handed out.
        let heap = unsafe { Heap::new(segment.as_mut_ptr(), segment.len()) };

        tracing::info!(
            fd = segment.as_raw_fd(),
            capacity,
            base = format_args!("{:#x}", segment.base_address()),
            "bulk allocator initialized"
        );

        Ok(Self {
            segment,
            heap: Mutex::new(SegmentHeap(heap)),
        })
    }

    /// Allocate at least `size` bytes aligned to `alignment`.
    ///
    /// Returns `None` if the footprint ceiling would be exceeded or the
    /// request is malformed (zero size, alignment not a power of two).
    pub fn memalign(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, alignment).ok()?;
        self.heap.lock().0.allocate_first_fit(layout).ok()
    }

    /// Return a block previously obtained from [`memalign`](Self::memalign).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `memalign` on this allocator with the same `size`,
    /// and must not have been freed already.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        // The heap only looks at the size when a block is returned.
        let Ok(layout) = Layout::from_size_align(size, 1) else {
            tracing::error!(size, "refusing to free block with invalid size");
            return;
        };
        // SAFETY: upheld by the caller.
        unsafe { self.heap.lock().0.deallocate(ptr, layout) };
    }

    /// Bytes currently committed to live blocks.
    pub fn allocated(&self) -> usize {
        self.heap.lock().0.used()
    }

    /// The ceiling on committed bytes.
    pub fn footprint_limit(&self) -> usize {
        self.segment.len()
    }

    /// Descriptor, mapping size and offset of a block inside the segment.
    ///
    /// Returns `None` if `ptr` is not inside the segment.
    pub fn map_info(&self, ptr: *const u8) -> Option<MapInfo> {
        let address = ptr as usize;
        if !self.segment.contains_range(address, 1) {
            return None;
        }
        Some(MapInfo {
            fd: self.segment.as_raw_fd(),
            map_size: self.segment.len(),
            offset: address - self.segment.base_address(),
        })
    }

    /// The backing segment.
    pub fn segment(&self) -> &SharedMemorySegment {
        &self.segment
    }
}

impl std::fmt::Debug for BulkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkAllocator")
            .field("segment", &self.segment)
            .field("allocated", &self.allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(capacity: usize) -> BulkAllocator {
        BulkAllocator::new("test-allocator", capacity).unwrap()
    }

    #[test]
    fn test_memalign_is_aligned_and_inside_segment() {
        let alloc = allocator(1024 * 1024);
        for size in [1, 63, 64, 100, 4096] {
            let ptr = alloc.memalign(size, BLOCK_SIZE).unwrap();
            assert_eq!(ptr.as_ptr() as usize % BLOCK_SIZE, 0);
            assert!(alloc.segment().contains_range(ptr.as_ptr() as usize, size));
        }
    }

    #[test]
    fn test_allocated_tracks_free() {
        let alloc = allocator(1024 * 1024);
        let baseline = alloc.allocated();

        let a = alloc.memalign(1000, BLOCK_SIZE).unwrap();
        let b = alloc.memalign(3000, BLOCK_SIZE).unwrap();
        assert!(alloc.allocated() >= baseline + 4000);

        unsafe {
            alloc.free(a, 1000);
            alloc.free(b, 3000);
        }
        assert_eq!(alloc.allocated(), baseline);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let alloc = allocator(64 * 1024);
        assert_eq!(alloc.footprint_limit(), 64 * 1024);
        assert!(alloc.memalign(128 * 1024, BLOCK_SIZE).is_none());

        let mut blocks = Vec::new();
        while let Some(ptr) = alloc.memalign(4096, BLOCK_SIZE) {
            blocks.push(ptr);
        }
        assert!(!blocks.is_empty());
        assert!(alloc.allocated() <= alloc.footprint_limit());

        // Freeing one block makes room again.
        let first = blocks[0];
        unsafe { alloc.free(first, 4096) };
        assert!(alloc.memalign(4096, BLOCK_SIZE).is_some());
    }

    #[test]
    fn test_blocks_do_not_move_or_overlap() {
        let alloc = allocator(1024 * 1024);
        let blocks: Vec<(usize, usize)> = (1..20)
            .map(|i| {
                let size = i * 97;
                let ptr = alloc.memalign(size, BLOCK_SIZE).unwrap();
                unsafe { std::ptr::write_bytes(ptr.as_ptr(), i as u8, size) };
                (ptr.as_ptr() as usize, size)
            })
            .collect();

        let mut sorted = blocks.clone();
        sorted.sort();
        for pair in sorted.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        for (i, &(address, size)) in blocks.iter().enumerate() {
            let data = unsafe { std::slice::from_raw_parts(address as *const u8, size) };
            assert!(data.iter().all(|&b| b == (i + 1) as u8));
        }
    }

    #[test]
    fn test_map_info() {
        let alloc = allocator(1024 * 1024);
        let ptr = alloc.memalign(256, BLOCK_SIZE).unwrap();
        let info = alloc.map_info(ptr.as_ptr()).unwrap();
        assert_eq!(info.fd, alloc.segment().as_raw_fd());
        assert_eq!(info.map_size, 1024 * 1024);
        assert_eq!(
            info.offset,
            ptr.as_ptr() as usize - alloc.segment().base_address()
        );
        assert!(alloc.map_info(std::ptr::null()).is_none());
    }

    #[test]
    fn test_zero_and_bad_requests() {
        let alloc = allocator(64 * 1024);
        assert!(alloc.memalign(0, BLOCK_SIZE).is_none());
        assert!(alloc.memalign(64, 3).is_none());
        assert!(matches!(
            BulkAllocator::new("tiny", 1),
            Err(Error::NotEnoughMemory(_))
        ));
    }
}
