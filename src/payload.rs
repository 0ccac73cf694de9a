//! Blob metadata.

use crate::object_id::{ExternalId, ObjectId};
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::sync::{Arc, LazyLock};

/// Descriptor value used when a payload has no backing descriptor.
pub const NO_FD: RawFd = -1;

/// Metadata of one blob in shared memory.
///
/// A client maps `fd` (received out of band) with `map_size` bytes and finds
/// the blob `offset` bytes into the mapping. The base address is only
/// meaningful inside the server and never goes over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Address-derived identifier.
    pub object_id: ObjectId,
    /// Caller-supplied secondary key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    /// Logical blob size in bytes.
    pub data_size: usize,
    /// Caller-supplied size attached to the external id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_size: Option<usize>,
    /// Descriptor of the mapping that holds the blob.
    pub fd: RawFd,
    /// Size of the mapping behind `fd`.
    pub map_size: usize,
    /// Offset of the blob inside the mapping.
    pub offset: usize,
    /// Server-side address of the first byte.
    #[serde(skip)]
    pub base_address: usize,
    /// Descriptor of the owning arena for arena-origin blobs.
    #[serde(skip)]
    pub arena_fd: Option<RawFd>,
}

static EMPTY_PAYLOAD: LazyLock<Arc<Payload>> = LazyLock::new(|| Arc::new(Payload::empty()));

impl Payload {
    /// Metadata of a blob carved out of the allocator's segment.
    pub fn standalone(
        object_id: ObjectId,
        data_size: usize,
        base_address: usize,
        fd: RawFd,
        map_size: usize,
        offset: usize,
    ) -> Self {
        Self {
            object_id,
            external_id: None,
            data_size,
            external_size: None,
            fd,
            map_size,
            offset,
            base_address,
            arena_fd: None,
        }
    }

    /// Metadata of a blob committed from a finalized arena.
    pub fn from_arena(
        object_id: ObjectId,
        data_size: usize,
        base_address: usize,
        arena_fd: RawFd,
        map_size: usize,
        offset: usize,
    ) -> Self {
        Self {
            object_id,
            external_id: None,
            data_size,
            external_size: None,
            fd: arena_fd,
            map_size,
            offset,
            base_address,
            arena_fd: Some(arena_fd),
        }
    }

    /// Attach an external id and its size.
    pub fn with_external(mut self, external_id: ExternalId, external_size: usize) -> Self {
        self.external_id = Some(external_id);
        self.external_size = Some(external_size);
        self
    }

    /// The zero-length blob.
    pub fn empty() -> Self {
        Self {
            object_id: ObjectId::EMPTY_BLOB,
            external_id: None,
            data_size: 0,
            external_size: None,
            fd: NO_FD,
            map_size: 0,
            offset: 0,
            base_address: 0,
            arena_fd: None,
        }
    }

    /// Shared instance of the zero-length blob.
    pub fn shared_empty() -> Arc<Payload> {
        Arc::clone(&EMPTY_PAYLOAD)
    }

    /// Was this blob committed from an arena?
    #[inline]
    pub fn is_arena_origin(&self) -> bool {
        self.arena_fd.is_some()
    }

    /// Is this the zero-length blob?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }

    /// One past the last byte, as an offset into the mapping.
    #[inline]
    pub fn end_offset(&self) -> usize {
        self.offset + self.data_size
    }
}
