//! Client-driven bulk allocation regions.
//!
//! A client asks for an arena, receives its memfd, carves the region up
//! itself, then reports back which spans it actually used. The store turns
//! each span into a blob and hands the unused pages back to the kernel.
//!
//! ```text
//! make_arena(size)                 finalize_arena(fd, offsets, sizes)
//!       │                                      │
//!       ▼                                      ▼
//! ┌────────────┐   client writes   ┌──────────────────────────────┐
//! │ open arena │ ────────────────▶ │ finalized arena (span set)   │
//! │ {fd, size} │                   │ offset ─▶ object id          │
//! └────────────┘                   └──────────────────────────────┘
//!                                    │ last span deleted
//!                                    ▼
//!                                  munmap + close
//! ```
//!
//! One fd per arena instead of one fd per blob keeps descriptor usage
//! proportional to the number of bulk uploads, not the number of blobs.
//!
//! # Span sets
//!
//! Each finalized arena owns its own ordered span set behind its own lock.
//! Spans may overlap. Deleting a blob reclaims the window between the
//! furthest end of any live span before it and the start of the next live
//! span, so pages still inside another blob are never released:
//!
//! ```text
//!   A ├──────────────────────┤
//!   B       ├───┤
//!   C             ├───┤            delete C
//!                        ├─────────────────┤  reclaimed window
//!                        ^ end of A, not end of B
//! ```
//!
//! Span sets only shrink after finalization, so work on different arenas
//! never contends.

use super::reclaim::Reclaimer;
use super::{MemorySegment, SharedMemorySegment, defaults};
use crate::error::{Error, Result};
use crate::object_id::ObjectId;
use crate::payload::Payload;
use crate::registry::Registry;
use parking_lot::{Mutex, RwLock};
use rustix::fd::{AsFd, OwnedFd};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// What `make_arena` hands back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena {
    /// Descriptor of the arena memfd.
    pub fd: RawFd,
    /// Size of the mapping.
    pub size: usize,
    /// Server-side base address of the mapping.
    pub base_address: usize,
}

/// Result of finalizing one arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Finalized {
    /// Ids of the blobs registered, in span order.
    pub ids: Vec<ObjectId>,
    /// Bytes handed back to the kernel.
    pub reclaimed: usize,
}

/// Result of releasing one arena-origin blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    /// Bytes handed back to the kernel.
    pub reclaimed: usize,
    /// Whether this was the arena's last blob and the mapping is gone.
    pub unmapped: bool,
}

/// One live blob in an arena's span set.
#[derive(Debug, Clone, Copy)]
struct Span {
    id: ObjectId,
    len: usize,
}

/// A finalized arena: the mapping plus the blobs that still live in it.
struct FinalizedArena {
    segment: SharedMemorySegment,
    spans: Mutex<BTreeMap<usize, Span>>,
    /// Longest span ever registered; bounds the backward scan in `release`.
    longest: usize,
}

/// Tracks open and finalized arenas.
pub struct ArenaManager {
    open: Mutex<HashMap<RawFd, SharedMemorySegment>>,
    finalized: RwLock<HashMap<RawFd, Arc<FinalizedArena>>>,
    reclaimer: Reclaimer,
}

impl ArenaManager {
    /// Create a manager that reclaims through `reclaimer`.
    pub fn new(reclaimer: Reclaimer) -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            finalized: RwLock::new(HashMap::new()),
            reclaimer,
        }
    }

    /// Create and map a fresh arena of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughMemory`] if `size` is zero or the memfd or
    /// mapping cannot be created.
    pub fn make_arena(&self, size: usize) -> Result<Arena> {
        let segment = SharedMemorySegment::new(defaults::ARENA_NAME, size)?;
        let arena = Arena {
            fd: segment.as_raw_fd(),
            size: segment.len(),
            base_address: segment.base_address(),
        };
        self.open.lock().insert(arena.fd, segment);

        tracing::info!(
            fd = arena.fd,
            size = arena.size,
            base = format_args!("{:#x}", arena.base_address),
            "arena created"
        );
        Ok(arena)
    }

    /// Commit the spans the client used and reclaim the rest.
    ///
    /// Spans are `offsets[i]..offsets[i] + sizes[i]` relative to the arena
    /// base. Each becomes a blob whose id is derived from its address.
    ///
    /// # Errors
    ///
    /// - [`Error::UserInputError`] if the lists differ in length or a span
    ///   lies outside the arena. The arena stays open.
    /// - [`Error::ObjectNotExists`] if `fd` is not an open arena.
    /// - [`Error::Invalid`] if two spans share an offset. Spans before the
    ///   duplicate stay registered and nothing is reclaimed.
    pub fn finalize(
        &self,
        fd: RawFd,
        offsets: &[usize],
        sizes: &[usize],
        registry: &Registry,
    ) -> Result<Finalized> {
        if offsets.len() != sizes.len() {
            return Err(Error::UserInputError(format!(
                "finalize arena: offsets and sizes differ in length ({} != {})",
                offsets.len(),
                sizes.len()
            )));
        }

        let segment = {
            let mut open = self.open.lock();
            let size = open
                .get(&fd)
                .map(|segment| segment.len())
                .ok_or_else(|| Error::ObjectNotExists(format!("arena for fd {fd} not found")))?;
            check_spans(size, offsets, sizes)?;
            open.remove(&fd)
                .ok_or_else(|| Error::ObjectNotExists(format!("arena for fd {fd} not found")))?
        };
        let size = segment.len();
        let base = segment.base_address();

        let arena = Arc::new(FinalizedArena {
            segment,
            spans: Mutex::new(BTreeMap::new()),
            longest: sizes.iter().copied().max().unwrap_or(0),
        });

        // Publish the arena before any blob referencing it becomes visible,
        // and keep its span set locked until registration is complete.
        let mut spans = arena.spans.lock();
        self.finalized.write().insert(fd, Arc::clone(&arena));

        let mut ids = Vec::with_capacity(offsets.len());
        let mut covered = Vec::with_capacity(offsets.len());
        for (&offset, &len) in offsets.iter().zip(sizes) {
            let address = base + offset;
            let id = ObjectId::from_address(address);
            let registered = if spans.contains_key(&offset) {
                Err(Error::Invalid(format!(
                    "finalize arena: duplicate span at offset {offset} ({id})"
                )))
            } else {
                registry.insert(Payload::from_arena(id, len, address, fd, size, offset))
            };
            if let Err(e) = registered {
                let empty = spans.is_empty();
                drop(spans);
                if empty {
                    self.finalized.write().remove(&fd);
                }
                tracing::warn!(fd, registered = ids.len(), "finalize arena stopped: {e}");
                return Err(e);
            }
            spans.insert(offset, Span { id, len });
            ids.push(id);
            covered.push((offset, len));
        }
        drop(spans);

        let reclaimed = self.reclaimer.reclaim(base, 0..size, &covered);

        if ids.is_empty() {
            // Nothing references the mapping; unmap and close it now.
            self.finalized.write().remove(&fd);
        }

        tracing::info!(fd, size, blobs = ids.len(), reclaimed, "arena finalized");
        Ok(Finalized { ids, reclaimed })
    }

    /// Drop an arena-origin blob from its arena's span set and reclaim the
    /// gap it leaves between its neighbours.
    ///
    /// The caller removes the registry entry afterwards. When the last blob
    /// of an arena is released the mapping is unmapped and its fd closed.
    ///
    /// # Errors
    ///
    /// - [`Error::Invalid`] if the owning arena is unknown, or a neighbour
    ///   in the span set is missing from the registry.
    /// - [`Error::ObjectNotExists`] if the blob was already released.
    pub fn release(&self, payload: &Payload, registry: &Registry) -> Result<Released> {
        let fd = payload.arena_fd.ok_or_else(|| {
            Error::Invalid(format!("{} is not an arena blob", payload.object_id))
        })?;
        let arena = self
            .finalized
            .read()
            .get(&fd)
            .cloned()
            .ok_or_else(|| {
                if registry.contains(payload.object_id) {
                    Error::Invalid(format!("arena for fd {fd} not found"))
                } else {
                    // Lost a race with a concurrent delete of the last blob.
                    Error::ObjectNotExists(format!("{} already released", payload.object_id))
                }
            })?;

        let offset = payload.offset;
        let (window, covered, now_empty) = {
            let mut spans = arena.spans.lock();
            let deleted = match spans.get(&offset) {
                Some(span) if span.id == payload.object_id => *span,
                _ => {
                    return Err(Error::ObjectNotExists(format!(
                        "{} already released",
                        payload.object_id
                    )));
                }
            };

            let prev = spans.range(..offset).next_back().map(|(_, span)| span.id);
            if let Some(prev) = prev.filter(|&id| !registry.contains(id)) {
                return Err(Error::Invalid(format!(
                    "failed to find the previous blob {prev}"
                )));
            }
            let next = spans.range(offset + 1..).next().map(|(&at, span)| (at, span.id));
            if let Some((_, next)) = next.filter(|&(_, id)| !registry.contains(id)) {
                return Err(Error::Invalid(format!("failed to find the next blob {next}")));
            }

            // Furthest end of any live span that starts before this one.
            let mut lower = 0;
            for (&at, span) in spans.range(..offset).rev() {
                if at.saturating_add(arena.longest) <= lower {
                    break;
                }
                lower = lower.max(at + span.len);
            }

            // Up to the next span, or past it if this blob reached further.
            let end = offset + deleted.len;
            let upper = match next {
                Some((at, _)) => end.max(at),
                None => arena.segment.len(),
            };

            spans.remove(&offset);
            let covered: Vec<(usize, usize)> = spans
                .range(offset..upper)
                .map(|(&at, span)| (at, span.len))
                .collect();
            (lower..upper, covered, spans.is_empty())
        };

        let reclaimed =
            self.reclaimer
                .reclaim(arena.segment.base_address(), window, &covered);

        if now_empty {
            let mut finalized = self.finalized.write();
            if finalized.get(&fd).is_some_and(|current| Arc::ptr_eq(current, &arena)) {
                finalized.remove(&fd);
            }
            tracing::debug!(fd, "arena unmapped after its last blob was deleted");
        }

        Ok(Released {
            reclaimed,
            unmapped: now_empty,
        })
    }

    /// Duplicate the descriptor of an open or finalized arena.
    ///
    /// Returns `None` if `fd` is not an arena.
    pub fn duplicate_fd(&self, fd: RawFd) -> Option<Result<OwnedFd>> {
        if let Some(segment) = self.open.lock().get(&fd) {
            return Some(segment.as_fd().try_clone_to_owned().map_err(Error::from));
        }
        self.finalized.read().get(&fd).map(|arena| {
            arena
                .segment
                .as_fd()
                .try_clone_to_owned()
                .map_err(Error::from)
        })
    }

    /// Number of arenas waiting for `finalize`.
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Number of finalized arenas that still hold live blobs.
    pub fn finalized_count(&self) -> usize {
        self.finalized.read().len()
    }

    /// Number of live spans in the finalized arena behind `fd`.
    pub fn span_count(&self, fd: RawFd) -> Option<usize> {
        let arena = self.finalized.read().get(&fd).cloned()?;
        let count = arena.spans.lock().len();
        Some(count)
    }
}

impl std::fmt::Debug for ArenaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaManager")
            .field("open", &self.open_count())
            .field("finalized", &self.finalized_count())
            .finish()
    }
}

/// Reject spans that fall outside `[0, size)`.
fn check_spans(size: usize, offsets: &[usize], sizes: &[usize]) -> Result<()> {
    for (&offset, &len) in offsets.iter().zip(sizes) {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| offset < size && end <= size);
        if !in_bounds {
            return Err(Error::UserInputError(format!(
                "finalize arena: span [{offset}, +{len}) is outside the arena of {size} bytes"
            )));
        }
    }
    Ok(())
}
