//! Integration tests for standalone blob lifecycle.
//!
//! These tests exercise the store the way a server does: many threads
//! creating, reading and deleting blobs against one shared segment.

use bulkstore::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

const CAPACITY: usize = 16 * 1024 * 1024;

fn store() -> BulkStore {
    BulkStore::pre_allocate(CAPACITY).unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Created blobs report their size and never overlap.
#[test]
fn test_create_sizes_and_disjoint_ranges() {
    let store = store();
    let sizes = [1, 7, 64, 65, 1000, 4096, 10_000, 123_457];

    let blobs: Vec<_> = sizes.iter().map(|&s| store.create(s).unwrap()).collect();
    for (blob, &size) in blobs.iter().zip(&sizes) {
        assert_eq!(store.get(blob.object_id).unwrap().data_size, size);
        assert!(blob.offset + size <= blob.map_size);
    }

    let mut ranges: Vec<(usize, usize)> = blobs
        .iter()
        .map(|b| (b.base_address, b.base_address + b.data_size))
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlap: {pair:?}");
    }
}

/// Zero-sized creates all return the same sentinel and touch nothing.
#[test]
fn test_empty_blob_sentinel() {
    let store = store();
    let footprint = store.footprint();
    let before = store.len();

    let a = store.create(0).unwrap();
    let b = store.create_external(0, ExternalId::new("zero"), 0).unwrap();
    assert_eq!(a.object_id, ObjectId::EMPTY_BLOB);
    assert_eq!(b.object_id, ObjectId::EMPTY_BLOB);
    assert_eq!(store.footprint(), footprint);
    assert_eq!(store.len(), before);
    assert!(!store.exists(ObjectId::EMPTY_BLOB));
    assert!(!store.exists_external(&ExternalId::new("zero")));
    assert!(!store.list().contains(&ObjectId::EMPTY_BLOB));
    assert!(store.get(ObjectId::EMPTY_BLOB).unwrap().is_empty());
}

/// After delete the id is gone for good.
#[test]
fn test_delete_then_lookup_fails() {
    let store = store();
    let blob = store.create(512).unwrap();
    store.delete(blob.object_id).unwrap();

    assert!(!store.exists(blob.object_id));
    let err = store.get(blob.object_id).unwrap_err();
    assert!(matches!(err, Error::ObjectNotExists(_)));
    assert_eq!(err.code(), 12);
}

/// Footprint grows by at least the bytes created and returns to baseline.
#[test]
fn test_footprint_returns_to_baseline() {
    let store = store();
    let baseline = store.footprint();
    assert_eq!(store.footprint_limit(), CAPACITY);

    let sizes: Vec<usize> = (1..=50).map(|i| i * 131).collect();
    let total: usize = sizes.iter().sum();
    let ids: Vec<_> = sizes
        .iter()
        .map(|&s| store.create(s).unwrap().object_id)
        .collect();
    assert!(store.footprint() >= baseline + total);

    for id in ids {
        store.delete(id).unwrap();
    }
    assert_eq!(store.footprint(), baseline);
}

/// Freed space is reused once the segment is full.
#[test]
fn test_exhaustion_and_reuse() {
    let store = BulkStore::pre_allocate(256 * 1024).unwrap();
    let mut ids = Vec::new();
    loop {
        match store.create(8 * 1024) {
            Ok(blob) => ids.push(blob.object_id),
            Err(Error::NotEnoughMemory(_)) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(ids.len() >= 16);

    store.delete(ids[3]).unwrap();
    store.create(8 * 1024).unwrap();
}

/// Data written through one blob is not disturbed by its neighbours.
#[test]
fn test_blob_contents_are_isolated() {
    let store = store();
    let blobs: Vec<_> = (0..16u8)
        .map(|i| {
            let blob = store.create(1000).unwrap();
            unsafe { std::ptr::write_bytes(blob.base_address as *mut u8, i, 1000) };
            blob
        })
        .collect();

    store.delete(blobs[5].object_id).unwrap();
    let _reused = store.create(1000).unwrap();

    for (i, blob) in blobs.iter().enumerate() {
        if i == 5 {
            continue;
        }
        let data = unsafe { std::slice::from_raw_parts(blob.base_address as *const u8, 1000) };
        assert!(data.iter().all(|&b| b == i as u8), "blob {i} corrupted");
    }
}

// ============================================================================
// External Ids
// ============================================================================

/// External ids resolve to the same blob and are removed with it.
#[test]
fn test_external_id_lifecycle() {
    let store = store();
    let ids: Vec<ExternalId> = (0..4).map(|i| ExternalId::new(format!("ext-{i}"))).collect();
    for (i, external) in ids.iter().enumerate() {
        store.create_external(100 + i, external.clone(), i).unwrap();
    }

    let found = store.get_by_external(&ids);
    assert_eq!(found.len(), 4);
    for (i, payload) in found.iter().enumerate() {
        assert_eq!(payload.data_size, 100 + i);
        assert_eq!(payload.external_size, Some(i));
        assert_eq!(payload.external_id.as_ref(), Some(&ids[i]));
    }

    // Deleting by object id drops the external entry too.
    store.delete(found[0].object_id).unwrap();
    assert!(!store.exists_external(&ids[0]));

    // Deleting by external id drops the object entry too.
    store.delete_external(&ids[1]).unwrap();
    assert!(!store.exists(found[1].object_id));

    let err = store.delete_external(&ids[1]).unwrap_err();
    assert!(err.is_object_not_exists());
}

// ============================================================================
// Bulk Operations
// ============================================================================

/// `clear` empties everything but the whole-segment entry.
#[test]
fn test_clear_and_list() {
    let store = store();
    let baseline = store.footprint();
    for i in 1..=10 {
        store.create(i * 100).unwrap();
    }
    let arena = store.make_arena(64 * 1024).unwrap();
    store.finalize_arena(arena.fd, &[0, 8192], &[100, 100]).unwrap();
    assert_eq!(store.list().len(), 13);

    store.clear().unwrap();
    assert_eq!(store.list(), vec![ObjectId::WHOLE_SEGMENT]);
    assert_eq!(store.footprint(), baseline);
    assert_eq!(store.arenas().finalized_count(), 0);
}

// ============================================================================
// Concurrency
// ============================================================================

/// N threads × M creates: every id is unique and readable with its size.
#[test]
fn test_concurrent_creates() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let store = Arc::new(store());
    let before = store.len();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| {
                        let size = 1 + (t * PER_THREAD + i) % 977;
                        (store.create(size).unwrap().object_id, size)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let created: Vec<(ObjectId, usize)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(store.len(), before + THREADS * PER_THREAD);
    let unique: HashSet<ObjectId> = created.iter().map(|&(id, _)| id).collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);
    for &(id, size) in &created {
        assert_eq!(store.get(id).unwrap().data_size, size);
    }
}

/// Concurrent deletes of the same id succeed exactly once.
#[test]
fn test_concurrent_double_delete() {
    let store = Arc::new(store());
    let baseline = store.footprint();
    let ids: Vec<ObjectId> = (0..100).map(|_| store.create(256).unwrap().object_id).collect();
    let ids = Arc::new(ids);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let ids = Arc::clone(&ids);
            thread::spawn(move || ids.iter().filter(|&&id| store.delete(id).is_ok()).count())
        })
        .collect();
    let deleted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(deleted, 100);
    assert_eq!(store.footprint(), baseline);
}

/// Mixed create/delete churn leaves the allocator consistent.
#[test]
fn test_concurrent_churn() {
    let store = Arc::new(store());
    let baseline = store.footprint();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..500 {
                    let blob = store.create(64 + (t * 31 + i) % 2048).unwrap();
                    live.push(blob.object_id);
                    if i % 3 == 0 {
                        let id = live.swap_remove(live.len() / 2);
                        store.delete(id).unwrap();
                    }
                }
                for id in live {
                    store.delete(id).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(store.footprint(), baseline);
    assert_eq!(store.list(), vec![ObjectId::WHOLE_SEGMENT]);
}

/// Dropping the store with live blobs does not panic.
#[test]
fn test_drop_with_live_blobs() {
    let store = store();
    for _ in 0..10 {
        store.create(4096).unwrap();
    }
    let arena = store.make_arena(16 * 1024).unwrap();
    store.finalize_arena(arena.fd, &[0], &[10]).unwrap();
    drop(store);
}
