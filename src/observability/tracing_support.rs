//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span per client session.
    pub session_spans: bool,
    /// Whether to create a span per request.
    pub request_spans: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            session_spans: true,
            request_spans: false, // Can be expensive
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Create a new tracing config with all spans enabled.
    pub fn all() -> Self {
        Self {
            session_spans: true,
            request_spans: true,
            level: Level::DEBUG,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            session_spans: false,
            request_spans: false,
            level: Level::INFO,
        }
    }
}

/// Create a span for one client connection.
#[inline]
pub fn span_session(session: u64) -> Span {
    span!(Level::INFO, "session", session = session)
}

/// Create a span for one request.
///
/// # Example
///
/// ```rust,ignore
/// use bulkstore::observability::span_request;
///
/// let span = span_request("create_buffer_request");
/// let _guard = span.enter();
/// // Request handling here...
/// ```
#[inline]
pub fn span_request(kind: &str) -> Span {
    span!(Level::DEBUG, "request", kind = %kind)
}

/// Create a span for work on one arena.
#[inline]
pub fn span_arena(fd: i32, size: usize) -> Span {
    span!(Level::DEBUG, "arena", fd = fd, size = size)
}

/// Log a failed request.
#[inline]
pub fn trace_request_failed(kind: &str, error: &crate::Error) {
    tracing::error!(
        kind = %kind,
        code = error.code(),
        error = %error,
        "request failed"
    );
}
