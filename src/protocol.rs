//! JSON wire messages for the buffer and arena commands.
//!
//! Every message is an object whose `type` field names the command:
//!
//! ```text
//! {"type":"create_buffer_request","size":1024}
//! {"type":"create_buffer_reply","id":9223372036854779904,"created":{...},"fds":1}
//! {"type":"error_reply","code":12,"message":"object not exists: ..."}
//! ```
//!
//! Replies that can hand out memory carry `fds`, the number of descriptors
//! sent right after the reply frame. Every other reply is followed by none.

use crate::error::{Error, Result};
use crate::memory::Arena;
use crate::object_id::{ExternalId, ObjectId};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Allocate a blob, optionally indexed by an external id.
    #[serde(rename = "create_buffer_request")]
    CreateBuffer {
        /// Blob size in bytes.
        size: usize,
        /// Secondary key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_id: Option<ExternalId>,
        /// Size attached to the secondary key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_size: Option<usize>,
    },

    /// Fetch metadata of many blobs.
    #[serde(rename = "get_buffers_request")]
    GetBuffers {
        /// Ids to look up.
        ids: Vec<ObjectId>,
    },

    /// Fetch metadata of many blobs by external id.
    #[serde(rename = "get_buffers_by_external_request")]
    GetBuffersByExternal {
        /// External ids to look up.
        external_ids: Vec<ExternalId>,
    },

    /// Delete one blob.
    #[serde(rename = "drop_buffer_request")]
    DropBuffer {
        /// Id to delete.
        id: ObjectId,
    },

    /// Ask whether one blob exists.
    #[serde(rename = "exists_request")]
    Exists {
        /// Id to look up.
        id: ObjectId,
    },

    /// Create an arena.
    #[serde(rename = "make_arena_request")]
    MakeArena {
        /// Arena size in bytes; `usize::MAX` means the footprint limit.
        size: usize,
    },

    /// Commit the used spans of an arena.
    #[serde(rename = "finalize_arena_request")]
    FinalizeArena {
        /// Arena descriptor as returned by `make_arena_reply`.
        fd: RawFd,
        /// Span offsets from the arena base.
        offsets: Vec<usize>,
        /// Span sizes.
        sizes: Vec<usize>,
    },

    /// Delete every blob.
    #[serde(rename = "clear_request")]
    Clear,
}

impl Request {
    /// Wire name of the request.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::CreateBuffer { .. } => "create_buffer_request",
            Request::GetBuffers { .. } => "get_buffers_request",
            Request::GetBuffersByExternal { .. } => "get_buffers_by_external_request",
            Request::DropBuffer { .. } => "drop_buffer_request",
            Request::Exists { .. } => "exists_request",
            Request::MakeArena { .. } => "make_arena_request",
            Request::FinalizeArena { .. } => "finalize_arena_request",
            Request::Clear => "clear_request",
        }
    }
}

/// A server reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    /// The blob that was created.
    #[serde(rename = "create_buffer_reply")]
    CreateBuffer {
        /// Id of the new blob.
        id: ObjectId,
        /// Its metadata.
        created: Payload,
        /// Descriptors following this reply.
        #[serde(default)]
        fds: usize,
    },

    /// Metadata of the blobs that were found.
    #[serde(rename = "get_buffers_reply")]
    GetBuffers {
        /// Found payloads; unknown ids are omitted.
        payloads: Vec<Payload>,
        /// Descriptors following this reply.
        #[serde(default)]
        fds: usize,
    },

    /// The blob was deleted.
    #[serde(rename = "drop_buffer_reply")]
    DropBuffer,

    /// Whether the blob asked about exists.
    #[serde(rename = "exists_reply")]
    Exists {
        /// Whether the blob is registered.
        exists: bool,
    },

    /// The arena that was created.
    #[serde(rename = "make_arena_reply")]
    MakeArena {
        /// Arena descriptor, sent alongside the reply.
        fd: RawFd,
        /// Arena size in bytes.
        size: usize,
        /// Server-side base address.
        base: usize,
        /// Descriptors following this reply.
        #[serde(default)]
        fds: usize,
    },

    /// The arena was finalized.
    #[serde(rename = "finalize_arena_reply")]
    FinalizeArena,

    /// Every blob was deleted.
    #[serde(rename = "clear_reply")]
    Clear,

    /// The request failed.
    #[serde(rename = "error_reply")]
    Error {
        /// Stable error code.
        code: i32,
        /// Human-readable message.
        message: String,
    },
}

impl Reply {
    /// Build the error envelope for `error`.
    pub fn from_error(error: &Error) -> Self {
        Reply::Error {
            code: error.code(),
            message: error.to_string(),
        }
    }

    /// Build the reply to `make_arena_request`. The descriptor count
    /// starts at zero; see [`Reply::with_fds`].
    pub fn from_arena(arena: &Arena) -> Self {
        Reply::MakeArena {
            fd: arena.fd,
            size: arena.size,
            base: arena.base_address,
            fds: 0,
        }
    }

    /// Announce `count` descriptors after this reply.
    ///
    /// Replies that never carry descriptors are returned unchanged.
    pub fn with_fds(mut self, count: usize) -> Self {
        match &mut self {
            Reply::CreateBuffer { fds, .. }
            | Reply::GetBuffers { fds, .. }
            | Reply::MakeArena { fds, .. } => *fds = count,
            _ => {}
        }
        self
    }

    /// Number of descriptors the peer must receive after this reply.
    pub fn fd_count(&self) -> usize {
        match self {
            Reply::CreateBuffer { fds, .. }
            | Reply::GetBuffers { fds, .. }
            | Reply::MakeArena { fds, .. } => *fds,
            _ => 0,
        }
    }

    /// Is this an error envelope?
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}

/// Parse one request.
pub fn decode_request(text: &str) -> Result<Request> {
    Ok(serde_json::from_str(text)?)
}

/// Serialize one request.
pub fn encode_request(request: &Request) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

/// Parse one reply.
pub fn decode_reply(text: &str) -> Result<Reply> {
    Ok(serde_json::from_str(text)?)
}

/// Serialize one reply.
pub fn encode_reply(reply: &Reply) -> Result<String> {
    Ok(serde_json::to_string(reply)?)
}
