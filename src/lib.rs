//! # bulkstore
//!
//! Shared-memory blob store for an in-memory object store server.
//!
//! Blobs live in memfd-backed mappings that clients receive over Unix
//! sockets and map themselves, so payload bytes are never copied between
//! server and client.
//!
//! ## Features
//!
//! - **Standalone blobs**: carved from one large segment by a first-fit
//!   allocator; ids are derived from addresses
//! - **Arenas**: a client fills a private memfd, then commits the spans it
//!   used; unused pages go back to the kernel
//! - **Page reclamation**: gaps between live arena blobs are released with
//!   `madvise(MADV_REMOVE)` while the mapping stays valid
//! - **Concurrent registry**: sharded maps keyed by object id and external id
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bulkstore::prelude::*;
//!
//! let store = BulkStore::pre_allocate(64 * 1024 * 1024)?;
//!
//! // Standalone blob
//! let blob = store.create(1024)?;
//! assert!(store.exists(blob.object_id));
//!
//! // Arena: client writes two spans, the rest is reclaimed
//! let arena = store.make_arena(1024 * 1024)?;
//! let finalized = store.finalize_arena(arena.fd, &[0, 4096], &[100, 200])?;
//! assert_eq!(finalized.ids.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod memory;
pub mod object_id;
pub mod observability;
pub mod payload;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::StoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{Arena, MemorySegment, PageAdvisor, SharedMemorySegment};
    pub use crate::object_id::{ExternalId, ObjectId};
    pub use crate::payload::Payload;
    pub use crate::session::Session;
    pub use crate::store::BulkStore;
}

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use store::BulkStore;
