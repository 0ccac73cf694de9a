//! Observability features: metrics and tracing.
//!
//! ## Metrics
//!
//! The store exposes the following metrics, each labelled with `store`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `bulkstore_footprint_bytes` | Gauge | Bytes committed by the bulk allocator |
//! | `bulkstore_blobs_created` | Counter | Blobs created (standalone and arena) |
//! | `bulkstore_blobs_deleted` | Counter | Blobs deleted |
//! | `bulkstore_reclaimed_bytes` | Counter | Bytes released by page advisories |
//! | `bulkstore_arenas_finalized` | Counter | Arenas finalized |
//! | `bulkstore_finalize_time_ns` | Histogram | Time to finalize one arena |
//!
//! ## Tracing
//!
//! Spans are emitted per session, per request (opt-in) and per arena
//! finalization; see [`TracingConfig`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulkstore::observability::init_metrics;
//!
//! // Initialize metrics (call once at startup)
//! init_metrics();
//!
//! // Use a metrics exporter (prometheus, statsd, etc.) to collect them
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{FinalizeTimer, StoreMetrics, init_metrics};
pub use tracing_support::{
    TracingConfig, span_arena, span_request, span_session, trace_request_failed,
};
