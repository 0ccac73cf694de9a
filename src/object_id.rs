//! Blob identifiers.
//!
//! An [`ObjectId`] is derived from the blob's base address: the top bit marks
//! the id as a blob id and the remaining 63 bits carry the address. User-space
//! addresses fit in 63 bits, so the mapping is injective and preserves address
//! order for as long as the blob lives at that address.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker bit set on every blob id.
const BLOB_ID_MARKER: u64 = 0x8000_0000_0000_0000;

/// Mask selecting the address bits of a blob id.
const BLOB_ADDRESS_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Address-derived identifier of a blob.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The id of the zero-length blob. Never stored in the registry.
    pub const EMPTY_BLOB: ObjectId = ObjectId::from_address(0);

    /// The id under which the whole backing segment is registered.
    pub const WHOLE_SEGMENT: ObjectId = ObjectId::from_address(usize::MAX);

    /// Derive the id of a blob living at `address`.
    #[inline]
    pub const fn from_address(address: usize) -> Self {
        ObjectId(BLOB_ID_MARKER | (address as u64 & BLOB_ADDRESS_MASK))
    }

    /// Wrap a raw id received from the wire.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        ObjectId(raw)
    }

    /// The raw 64-bit value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Is this the empty-blob sentinel?
    #[inline]
    pub const fn is_empty_blob(self) -> bool {
        self.0 == Self::EMPTY_BLOB.0
    }

    /// Is this one of the two ids that `delete` ignores?
    #[inline]
    pub const fn is_sentinel(self) -> bool {
        self.0 == Self::EMPTY_BLOB.0 || self.0 == Self::WHOLE_SEGMENT.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{:016x}", self.0)
    }
}

/// Caller-supplied secondary identifier of a blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Create an external id.
    pub fn new(id: impl Into<String>) -> Self {
        ExternalId(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExternalId {
    fn from(id: &str) -> Self {
        ExternalId::new(id)
    }
}

impl From<String> for ExternalId {
    fn from(id: String) -> Self {
        ExternalId(id)
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
