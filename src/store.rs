//! The blob store: allocator, registry and arenas behind one entry point.
//!
//! ```text
//!                     ┌─────────────────────────┐
//!  create / get ────▶ │        BulkStore        │ ◀──── make_arena / finalize_arena
//!  exists / delete    └─┬──────────┬──────────┬─┘
//!                       │          │          │
//!                       ▼          ▼          ▼
//!              ┌─────────────┐ ┌────────┐ ┌──────────────┐
//!              │BulkAllocator│ │Registry│ │ ArenaManager │──▶ Reclaimer
//!              └─────────────┘ └────────┘ └──────────────┘
//! ```
//!
//! Every operation is synchronous and safe to call from many threads.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::memory::defaults::ARENA_SIZE_FOOTPRINT;
use crate::memory::{
    Arena, ArenaManager, BulkAllocator, Finalized, MadviseAdvisor, MemorySegment, PageAdvisor,
    Reclaimer,
};
use crate::object_id::{ExternalId, ObjectId};
use crate::observability::{StoreMetrics, span_arena};
use crate::payload::Payload;
use crate::registry::Registry;
use rustix::fd::{AsFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;

/// Shared-memory blob store.
///
/// # Example
///
/// ```rust,ignore
/// use bulkstore::BulkStore;
///
/// let store = BulkStore::pre_allocate(64 * 1024 * 1024)?;
/// let blob = store.create(1000)?;
/// // Send blob.fd to the client; it writes at blob.offset
/// store.delete(blob.object_id)?;
/// ```
pub struct BulkStore {
    config: StoreConfig,
    allocator: BulkAllocator,
    registry: Registry,
    arenas: ArenaManager,
    metrics: StoreMetrics,
}

impl BulkStore {
    /// Create a store that releases pages with `madvise`.
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_advisor(config, Arc::new(MadviseAdvisor))
    }

    /// Create a store with a segment of `size` bytes and default settings.
    pub fn pre_allocate(size: usize) -> Result<Self> {
        Self::new(StoreConfig::default().with_capacity(size))
    }

    /// Create a store that releases pages through `advisor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughMemory`] if the backing segment cannot be
    /// mapped, or [`Error::UserInputError`] for a malformed configuration.
    pub fn with_advisor(config: StoreConfig, advisor: Arc<dyn PageAdvisor>) -> Result<Self> {
        config.validate()?;

        let allocator = BulkAllocator::new(&config.segment_name, config.capacity)?;
        if config.prefault {
            allocator.segment().prefault();
        }

        // The whole segment is registered so a client can map it once.
        let segment = allocator.segment();
        let registry = Registry::new();
        registry.insert(Payload::standalone(
            ObjectId::WHOLE_SEGMENT,
            segment.len(),
            segment.base_address(),
            segment.as_raw_fd(),
            segment.len(),
            0,
        ))?;

        let metrics = StoreMetrics::new(&config.segment_name);
        metrics.record_footprint(allocator.allocated());

        tracing::info!(
            name = %config.segment_name,
            capacity = config.capacity,
            block_size = config.block_size,
            "bulk store ready"
        );

        Ok(Self {
            config,
            allocator,
            registry,
            arenas: ArenaManager::new(Reclaimer::new(advisor)),
            metrics,
        })
    }

    /// Allocate a blob of `size` bytes.
    ///
    /// A zero size returns the shared empty blob without allocating.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughMemory`] if the segment has no room left.
    pub fn create(&self, size: usize) -> Result<Arc<Payload>> {
        if size == 0 {
            return Ok(Payload::shared_empty());
        }
        self.create_payload(size, None)
    }

    /// Allocate a blob of `size` bytes and index it under `external_id`.
    ///
    /// A zero size returns the shared empty blob and indexes nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::NotEnoughMemory`] if the segment has no room left.
    /// - [`Error::UserInputError`] if `external_id` is already in use.
    pub fn create_external(
        &self,
        size: usize,
        external_id: ExternalId,
        external_size: usize,
    ) -> Result<Arc<Payload>> {
        if size == 0 {
            return Ok(Payload::shared_empty());
        }
        self.create_payload(size, Some((external_id, external_size)))
    }

    fn create_payload(
        &self,
        size: usize,
        external: Option<(ExternalId, usize)>,
    ) -> Result<Arc<Payload>> {
        let ptr = self
            .allocator
            .memalign(size, self.config.block_size)
            .ok_or_else(|| {
                Error::NotEnoughMemory(format!(
                    "size = {size}, footprint = {}, limit = {}",
                    self.allocator.allocated(),
                    self.allocator.footprint_limit()
                ))
            })?;

        let Some(info) = self.allocator.map_info(ptr.as_ptr()) else {
            // SAFETY: `ptr` was just allocated with `size` and is unpublished.
            unsafe { self.allocator.free(ptr, size) };
            return Err(Error::Invalid(format!(
                "block at {:p} is outside the segment",
                ptr.as_ptr()
            )));
        };

        let address = ptr.as_ptr() as usize;
        let mut payload = Payload::standalone(
            ObjectId::from_address(address),
            size,
            address,
            info.fd,
            info.map_size,
            info.offset,
        );
        if let Some((external_id, external_size)) = external {
            payload = payload.with_external(external_id, external_size);
        }

        match self.registry.insert(payload) {
            Ok(payload) => {
                let footprint = self.allocator.allocated();
                self.metrics.record_created(1);
                self.metrics.record_footprint(footprint);
                tracing::debug!(
                    id = %payload.object_id,
                    size,
                    offset = payload.offset,
                    footprint,
                    "blob created"
                );
                Ok(payload)
            }
            Err(e) => {
                // SAFETY: the block was never published.
                unsafe { self.allocator.free(ptr, size) };
                Err(e)
            }
        }
    }

    /// Metadata of one blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotExists`] for an unknown id.
    pub fn get(&self, id: ObjectId) -> Result<Arc<Payload>> {
        if id.is_empty_blob() {
            return Ok(Payload::shared_empty());
        }
        self.registry
            .get(id)
            .ok_or_else(|| Error::ObjectNotExists(format!("get: id = {id}")))
    }

    /// Metadata of many blobs. Unknown ids are skipped.
    pub fn get_many(&self, ids: &[ObjectId]) -> Vec<Arc<Payload>> {
        ids.iter().filter_map(|&id| self.get(id).ok()).collect()
    }

    /// Metadata of many blobs by external id. Unknown ids are skipped.
    pub fn get_by_external(&self, external_ids: &[ExternalId]) -> Vec<Arc<Payload>> {
        external_ids
            .iter()
            .filter_map(|external_id| self.registry.get_external(external_id))
            .collect()
    }

    /// Is `id` registered?
    pub fn exists(&self, id: ObjectId) -> bool {
        self.registry.contains(id)
    }

    /// Is `external_id` registered?
    pub fn exists_external(&self, external_id: &ExternalId) -> bool {
        self.registry.contains_external(external_id)
    }

    /// Delete one blob.
    ///
    /// The empty blob and the whole-segment entry are silently ignored.
    /// Standalone blobs go back to the allocator; arena blobs have the gap
    /// around them reclaimed, and the arena is unmapped with its last blob.
    ///
    /// # Errors
    ///
    /// - [`Error::ObjectNotExists`] for an unknown id.
    /// - [`Error::Invalid`] if an arena neighbour is inconsistent.
    pub fn delete(&self, id: ObjectId) -> Result<()> {
        if id.is_sentinel() {
            return Ok(());
        }
        let not_found = || Error::ObjectNotExists(format!("delete: id = {id}"));
        let payload = self.registry.get(id).ok_or_else(not_found)?;

        if payload.is_arena_origin() {
            let released = self.arenas.release(&payload, &self.registry)?;
            self.registry.remove(id);
            self.metrics.record_reclaimed(released.reclaimed);
        } else {
            // Whoever removes the entry owns the block.
            let payload = self.registry.remove(id).ok_or_else(not_found)?;
            let ptr = NonNull::new(payload.base_address as *mut u8).ok_or_else(|| {
                Error::Invalid(format!("delete: {id} has no address"))
            })?;
            // SAFETY: the block came from `memalign` with `data_size` and the
            // registry entry that owned it is gone.
            unsafe { self.allocator.free(ptr, payload.data_size) };
        }

        let footprint = self.allocator.allocated();
        self.metrics.record_deleted();
        self.metrics.record_footprint(footprint);
        tracing::debug!(id = %id, footprint, "blob deleted");
        Ok(())
    }

    /// Delete the blob indexed under `external_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotExists`] for an unknown external id, plus
    /// anything [`delete`](Self::delete) returns.
    pub fn delete_external(&self, external_id: &ExternalId) -> Result<()> {
        let payload = self.registry.get_external(external_id).ok_or_else(|| {
            Error::ObjectNotExists(format!("delete: external id = {external_id}"))
        })?;
        self.delete(payload.object_id)
    }

    /// Snapshot of every registered id, the whole-segment entry included.
    pub fn list(&self) -> Vec<ObjectId> {
        self.registry.ids()
    }

    /// Number of registered ids, the whole-segment entry included.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Is nothing but the whole-segment entry registered?
    pub fn is_empty(&self) -> bool {
        self.registry.len() <= 1
    }

    /// Delete every blob, continuing past failures.
    ///
    /// Returns the first failure, if any.
    pub fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for id in self.registry.ids() {
            if id.is_sentinel() {
                continue;
            }
            match self.delete(id) {
                Ok(()) => {}
                // Deleted concurrently.
                Err(e) if e.is_object_not_exists() => {}
                Err(e) => {
                    tracing::warn!(id = %id, "clear: failed to delete blob: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Bytes currently committed by the allocator.
    pub fn footprint(&self) -> usize {
        self.allocator.allocated()
    }

    /// The allocator's ceiling.
    pub fn footprint_limit(&self) -> usize {
        self.allocator.footprint_limit()
    }

    /// Create an arena of `size` bytes for the client to fill.
    ///
    /// [`ARENA_SIZE_FOOTPRINT`] asks for an arena as large as the footprint
    /// limit.
    pub fn make_arena(&self, size: usize) -> Result<Arena> {
        let size = if size == ARENA_SIZE_FOOTPRINT {
            self.footprint_limit()
        } else {
            size
        };
        self.arenas.make_arena(size)
    }

    /// Commit the spans of an arena as blobs and reclaim the rest.
    ///
    /// See [`ArenaManager::finalize`] for the error cases.
    pub fn finalize_arena(
        &self,
        fd: RawFd,
        offsets: &[usize],
        sizes: &[usize],
    ) -> Result<Finalized> {
        // Sizes are unchecked client input until `finalize` validates them.
        let requested = sizes.iter().fold(0usize, |total, &len| total.saturating_add(len));
        let _span = span_arena(fd, requested).entered();
        let timer = self.metrics.start_finalize_timer();

        let finalized = self.arenas.finalize(fd, offsets, sizes, &self.registry)?;
        timer.finish();
        self.metrics.record_created(finalized.ids.len() as u64);
        self.metrics.record_reclaimed(finalized.reclaimed);
        Ok(finalized)
    }

    /// Duplicate the descriptor behind a payload's `fd`, so it can be sent to
    /// a client without racing a concurrent unmap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ObjectNotExists`] if `fd` is neither the store
    /// segment nor a live arena.
    pub fn duplicate_fd(&self, fd: RawFd) -> Result<OwnedFd> {
        let segment = self.allocator.segment();
        if fd == segment.as_raw_fd() {
            return Ok(segment.as_fd().try_clone_to_owned()?);
        }
        self.arenas
            .duplicate_fd(fd)
            .unwrap_or_else(|| Err(Error::ObjectNotExists(format!("no mapping for fd {fd}"))))
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The arena manager.
    pub fn arenas(&self) -> &ArenaManager {
        &self.arenas
    }

    /// Descriptor of the backing segment.
    pub fn segment_fd(&self) -> RawFd {
        self.allocator.segment().as_raw_fd()
    }
}

impl Drop for BulkStore {
    fn drop(&mut self) {
        for id in self.registry.ids() {
            if id.is_sentinel() {
                continue;
            }
            if let Err(e) = self.delete(id) {
                tracing::warn!(id = %id, "failed to delete blob on shutdown: {e}");
            }
        }
        tracing::info!(name = %self.config.segment_name, "bulk store closed");
    }
}

impl std::fmt::Debug for BulkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkStore")
            .field("config", &self.config)
            .field("blobs", &self.registry.len())
            .field("footprint", &self.footprint())
            .field("arenas", &self.arenas)
            .finish()
    }
}
