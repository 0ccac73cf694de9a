//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FOOTPRINT_BYTES: &str = "bulkstore_footprint_bytes";
const BLOBS_CREATED: &str = "bulkstore_blobs_created";
const BLOBS_DELETED: &str = "bulkstore_blobs_deleted";
const RECLAIMED_BYTES: &str = "bulkstore_reclaimed_bytes";
const ARENAS_FINALIZED: &str = "bulkstore_arenas_finalized";
const FINALIZE_TIME_NS: &str = "bulkstore_finalize_time_ns";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_gauge!(
        FOOTPRINT_BYTES,
        Unit::Bytes,
        "Bytes currently committed by the bulk allocator"
    );
    metrics::describe_counter!(BLOBS_CREATED, Unit::Count, "Total number of blobs created");
    metrics::describe_counter!(BLOBS_DELETED, Unit::Count, "Total number of blobs deleted");
    metrics::describe_counter!(
        RECLAIMED_BYTES,
        Unit::Bytes,
        "Total bytes handed back to the kernel by page advisories"
    );
    metrics::describe_counter!(
        ARENAS_FINALIZED,
        Unit::Count,
        "Total number of arenas finalized"
    );
    metrics::describe_histogram!(
        FINALIZE_TIME_NS,
        Unit::Nanoseconds,
        "Time to finalize one arena"
    );
}

/// Metrics handles for one store, labelled with its segment name.
#[derive(Clone)]
pub struct StoreMetrics {
    store: String,
    footprint: Gauge,
    created: Counter,
    deleted: Counter,
    reclaimed: Counter,
    arenas_finalized: Counter,
    finalize_time: Histogram,
}

impl StoreMetrics {
    /// Create the handles for the store named `store`.
    pub fn new(store: &str) -> Self {
        Self {
            store: store.to_string(),
            footprint: gauge!(FOOTPRINT_BYTES, "store" => store.to_string()),
            created: counter!(BLOBS_CREATED, "store" => store.to_string()),
            deleted: counter!(BLOBS_DELETED, "store" => store.to_string()),
            reclaimed: counter!(RECLAIMED_BYTES, "store" => store.to_string()),
            arenas_finalized: counter!(ARENAS_FINALIZED, "store" => store.to_string()),
            finalize_time: histogram!(FINALIZE_TIME_NS, "store" => store.to_string()),
        }
    }

    /// Record `count` blobs created.
    #[inline]
    pub fn record_created(&self, count: u64) {
        self.created.increment(count);
    }

    /// Record one blob deleted.
    #[inline]
    pub fn record_deleted(&self) {
        self.deleted.increment(1);
    }

    /// Record bytes advised away.
    #[inline]
    pub fn record_reclaimed(&self, bytes: usize) {
        if bytes > 0 {
            self.reclaimed.increment(bytes as u64);
        }
    }

    /// Record the allocator's current footprint.
    #[inline]
    pub fn record_footprint(&self, bytes: usize) {
        self.footprint.set(bytes as f64);
    }

    /// Record one arena finalized and the time it took.
    #[inline]
    pub fn record_finalized(&self, duration: Duration) {
        self.arenas_finalized.increment(1);
        self.finalize_time.record(duration.as_nanos() as f64);
    }

    /// Start timing an arena finalization.
    ///
    /// Nothing is recorded unless [`FinalizeTimer::finish`] is called, so a
    /// failed finalization leaves the counter and histogram untouched.
    pub fn start_finalize_timer(&self) -> FinalizeTimer<'_> {
        FinalizeTimer {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// Get the store label.
    pub fn store(&self) -> &str {
        &self.store
    }
}

impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Times one arena finalization.
#[must_use = "a finalization is only recorded by `finish`"]
pub struct FinalizeTimer<'a> {
    start: Instant,
    metrics: &'a StoreMetrics,
}

impl FinalizeTimer<'_> {
    /// Record a successful finalization and the time it took.
    pub fn finish(self) {
        self.metrics.record_finalized(self.start.elapsed());
    }
}
