//! Memory segment trait and types.

use std::os::unix::io::RawFd;

/// Handle for sharing a segment with other processes.
///
/// The fd should be sent via `SCM_RIGHTS` over a Unix socket; the receiver
/// maps `size` bytes of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcHandle {
    /// The raw file descriptor.
    pub fd: RawFd,
    /// Size of the memory region.
    pub size: usize,
}

/// Trait for mapped memory backends.
///
/// A memory segment represents a contiguous region of memory. Both the
/// allocator's backing segment and every client arena implement it.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid (and never move) for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get an IPC handle for sharing this segment with other processes.
    fn ipc_handle(&self) -> IpcHandle;

    /// Base address as an integer.
    fn base_address(&self) -> usize {
        self.as_ptr() as usize
    }

    /// Does `[address, address + len)` lie inside this segment?
    fn contains_range(&self, address: usize, len: usize) -> bool {
        let base = self.base_address();
        address >= base
            && address
                .checked_add(len)
                .is_some_and(|end| end <= base + self.len())
    }

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}
