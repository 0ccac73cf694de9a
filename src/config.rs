//! Store configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use bulkstore::{BulkStore, StoreConfig};
//!
//! let config = StoreConfig::default()
//!     .with_capacity(1024 * 1024 * 1024)   // 1 GiB segment
//!     .with_prefault(true);                // touch every page up front
//! let store = BulkStore::new(config)?;
//! ```

use crate::error::{Error, Result};
use crate::memory::defaults::{BLOCK_SIZE, DEFAULT_CAPACITY, SEGMENT_NAME};

/// Configuration of a [`BulkStore`](crate::BulkStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Size of the backing segment, which is also the footprint limit.
    pub capacity: usize,
    /// Alignment of every standalone blob. Must be a power of two.
    pub block_size: usize,
    /// Debug name of the backing memfd.
    pub segment_name: String,
    /// Touch every page of the segment at startup.
    pub prefault: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            block_size: BLOCK_SIZE,
            segment_name: SEGMENT_NAME.to_string(),
            prefault: false,
        }
    }
}

impl StoreConfig {
    /// Set the segment size.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the blob alignment.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the debug name of the backing memfd.
    pub fn with_segment_name(mut self, name: impl Into<String>) -> Self {
        self.segment_name = name.into();
        self
    }

    /// Enable or disable prefaulting.
    pub fn with_prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    /// Check the configuration before anything is mapped.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::NotEnoughMemory("capacity must be greater than 0".into()));
        }
        if !self.block_size.is_power_of_two() {
            return Err(Error::UserInputError(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.segment_name.contains('\0') {
            return Err(Error::UserInputError(
                "segment name contains a NUL byte".into(),
            ));
        }
        Ok(())
    }
}
