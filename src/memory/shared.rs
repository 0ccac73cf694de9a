//! Shared memory segment using Linux memfd.
//!
//! This module provides a memory segment backed by anonymous shared memory
//! created via `memfd_create`. Clients get zero-copy access by receiving the
//! file descriptor over a Unix socket and mapping it themselves.

use super::{IpcHandle, MemorySegment};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// A memory segment backed by Linux memfd (anonymous shared memory).
///
/// Used both for the allocator's single backing segment and for every
/// client arena. The mapping is `MAP_SHARED`, so pages written here are the
/// same physical pages a client sees through its own mapping of the fd.
///
/// # Features
///
/// - Anonymous: No filesystem visibility (unlike `shm_open`)
/// - Auto-cleanup: Kernel reclaims memory when all references are closed
///
/// # Example
///
/// ```rust,ignore
/// use bulkstore::memory::{SharedMemorySegment, MemorySegment};
///
/// // Create a 1MB shared memory segment
/// let segment = SharedMemorySegment::new("my-arena", 1024 * 1024)?;
///
/// // Send segment.ipc_handle().fd over a Unix socket...
/// ```
pub struct SharedMemorySegment {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the segment.
    len: usize,
    /// Debug name.
    name: String,
}

impl SharedMemorySegment {
    /// Create a new shared memory segment.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name for the segment (visible in `/proc/self/fd/`).
    /// * `size` - Size in bytes. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughMemory`] if `size` is zero or if
    /// `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::NotEnoughMemory(
                "size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::Invalid(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::NotEnoughMemory(format!("memfd_create failed: {e}")))?;

        rustix::fs::ftruncate(&fd, size as u64).map_err(|e| {
            Error::NotEnoughMemory(format!("ftruncate failed, size = {size}: {e}"))
        })?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| Error::NotEnoughMemory(format!("mmap failed, size = {size}: {e}")))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::NotEnoughMemory("mmap returned null".into()))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: name.to_string(),
        })
    }

    /// Map a segment received from another process.
    ///
    /// The size is taken from the descriptor itself. This is how a client
    /// opens the store segment or an arena after receiving its fd.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let stat = rustix::fs::fstat(&fd)?;
        let size = usize::try_from(stat.st_size)
            .map_err(|_| Error::Invalid(format!("bad segment size {}", stat.st_size)))?;
        if size == 0 {
            return Err(Error::Invalid("received segment is empty".into()));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Invalid("mmap returned null".into()))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: "received".to_string(),
        })
    }

    /// Get the raw file descriptor.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Get the debug name of this segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pre-fault the memory to avoid page faults during use.
    ///
    /// This touches every page to ensure physical memory is allocated.
    pub fn prefault(&self) {
        let page_size = super::reclaim::page_size();
        let ptr = self.ptr.as_ptr();
        for offset in (0..self.len).step_by(page_size) {
            unsafe {
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn ipc_handle(&self) -> IpcHandle {
        IpcHandle {
            fd: self.fd.as_raw_fd(),
            size: self.len,
        }
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: SharedMemorySegment is Send + Sync because:
// - The memory is shared and can be accessed from any thread
// - The fd is reference-counted by the kernel
// - We don't hold any thread-local state
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("name", &self.name)
            .field("fd", &self.as_raw_fd())
            .field("base", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
