//! Error types for the blob store.

use thiserror::Error;

/// Result type alias using the store's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for store operations.
///
/// Every variant is request-fatal but never process-fatal: the store does
/// not retry, it reports the failure to the caller and keeps serving.
#[derive(Error, Debug)]
pub enum Error {
    /// The allocator or an arena mapping is exhausted.
    #[error("not enough memory: {0}")]
    NotEnoughMemory(String),

    /// Unknown object id, external id, or arena descriptor.
    #[error("object not exists: {0}")]
    ObjectNotExists(String),

    /// Malformed request arguments (e.g. mismatched offsets and sizes).
    #[error("user input error: {0}")]
    UserInputError(String),

    /// Internal invariant violation.
    #[error("invalid: {0}")]
    Invalid(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// Malformed wire message.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl Error {
    /// Stable numeric code carried in error replies.
    pub fn code(&self) -> i32 {
        match self {
            Error::Invalid(_) | Error::Protocol(_) => 1,
            Error::Io(_) | Error::System(_) => 4,
            Error::UserInputError(_) => 8,
            Error::ObjectNotExists(_) => 12,
            Error::NotEnoughMemory(_) => 16,
        }
    }

    /// Whether this is an [`Error::ObjectNotExists`].
    pub fn is_object_not_exists(&self) -> bool {
        matches!(self, Error::ObjectNotExists(_))
    }
}
