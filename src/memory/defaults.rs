//! Default sizes and configuration constants.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bulkstore::memory::defaults;
//!
//! let store = BulkStore::pre_allocate(defaults::DEFAULT_CAPACITY)?;
//! ```

// =============================================================================
// Segment
// =============================================================================

/// Default capacity of the backing segment (256 MiB).
pub const DEFAULT_CAPACITY: usize = 256 * 1024 * 1024;

/// Alignment of every standalone blob.
///
/// Blocks are aligned to this granularity so that arena gap arithmetic and
/// client-side views never straddle an odd boundary.
pub const BLOCK_SIZE: usize = 64;

/// Debug name of the backing memfd (visible in `/proc/<pid>/fd/`).
pub const SEGMENT_NAME: &str = "bulkstore-segment";

/// Debug name of arena memfds.
pub const ARENA_NAME: &str = "bulkstore-arena";

// =============================================================================
// Arenas
// =============================================================================

/// `make_arena` size meaning "as large as the footprint limit".
pub const ARENA_SIZE_FOOTPRINT: usize = usize::MAX;

// =============================================================================
// Convenience Functions
// =============================================================================

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}
