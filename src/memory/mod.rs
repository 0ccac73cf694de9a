//! Shared memory management for the blob store.
//!
//! This module owns every mapping the store hands out to clients.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: Trait for mapped memory backends
//! - [`SharedMemorySegment`]: memfd-backed `MAP_SHARED` mapping
//! - [`BulkAllocator`]: first-fit allocator over one segment, for standalone blobs
//! - [`ArenaManager`]: client-carved arenas committed as spans
//! - [`Reclaimer`]: finds uncovered gaps and releases their pages
//! - [`ipc`]: descriptor passing and message framing over Unix sockets
//!
//! # Example
//!
//! ```rust,ignore
//! use bulkstore::memory::{BulkAllocator, defaults};
//!
//! let allocator = BulkAllocator::new(defaults::SEGMENT_NAME, 64 * 1024 * 1024)?;
//! let block = allocator.memalign(1000, defaults::BLOCK_SIZE).expect("not enough memory");
//! let info = allocator.map_info(block.as_ptr()).expect("block is in the segment");
//! // Send info.fd to the client, which maps it and reads at info.offset
//! ```

mod allocator;
mod arena;
pub mod defaults;
pub mod ipc;
pub mod reclaim;
mod segment;
mod shared;

pub use allocator::{BulkAllocator, MapInfo};
pub use arena::{Arena, ArenaManager, Finalized, Released};
pub use reclaim::{MadviseAdvisor, PageAdvisor, Reclaimer, page_size, uncovered_gaps};
pub use segment::{IpcHandle, MemorySegment};
pub use shared::SharedMemorySegment;
