//! Tile store integration tests.
//!
//! Tests verify:
//! - Concurrent readers of one tile share a single decode
//! - Cancelled and failed decodes never populate the store
//! - Overflow to disk and promotion back to memory
//! - Several images share one store without interfering

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use raster_codec::error::{CodecError, CorruptDataError};
use raster_codec::{
    CancelFlag, OverflowConfig, RasterImage, TileKey, TileStore, TileStoreConfig,
};

use super::test_utils::{
    descriptor, dir_entries, gradient, CancelAfter, CountingSource, FailingSource,
};

fn counting_image(
    width: u32,
    height: u32,
    delay: Duration,
    store: Arc<TileStore>,
) -> (RasterImage, Arc<std::sync::atomic::AtomicUsize>) {
    let source = CountingSource::new(
        descriptor(width, height, 1, 8, 16),
        gradient(width, height, 1, 8),
        delay,
    );
    let counter = source.counter();
    (RasterImage::new(Box::new(source), store), counter)
}

// =============================================================================
// Single-flight
// =============================================================================

#[test]
fn test_concurrent_readers_share_one_decode() {
    let store = Arc::new(TileStore::in_memory());
    let (image, decodes) = counting_image(32, 32, Duration::from_millis(50), store.clone());
    let barrier = Barrier::new(8);

    let tiles: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    image.tile(1, 1, &CancelFlag::new()).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert!(tiles.iter().all(|t| Arc::ptr_eq(t, &tiles[0])));
    let stats = store.stats();
    assert_eq!(stats.decodes, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 7);
}

#[test]
fn test_concurrent_full_reads_decode_each_tile_once() {
    let store = Arc::new(TileStore::in_memory());
    let (image, decodes) = counting_image(64, 48, Duration::from_millis(5), store.clone());
    let expected = gradient(64, 48, 1, 8);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let samples = image.to_samples(&CancelFlag::new()).unwrap();
                assert_eq!(samples, expected);
            });
        }
    });

    assert_eq!(decodes.load(Ordering::SeqCst), 12);
    assert_eq!(store.len(), 12);
}

// =============================================================================
// Cancellation and Failure
// =============================================================================

#[test]
fn test_cancel_mid_read_caches_only_finished_tiles() {
    let store = Arc::new(TileStore::in_memory());
    let cancel = CancelFlag::new();
    let source = CancelAfter::new(
        descriptor(64, 64, 1, 8, 16),
        gradient(64, 64, 1, 8),
        3,
        cancel.clone(),
    );
    let image = RasterImage::new(Box::new(source), store.clone());

    let err = image.to_samples(&cancel).unwrap_err();
    assert!(matches!(err, CodecError::Cancelled));
    assert_eq!(store.len(), 3);
    for x in 0..3 {
        assert!(store.contains(&TileKey::new(image.id(), x, 0)));
    }
    assert!(!store.contains(&TileKey::new(image.id(), 3, 0)));

    // A fresh flag finishes the read from where the cancelled one stopped.
    let samples = image.to_samples(&CancelFlag::new()).unwrap();
    assert_eq!(samples, gradient(64, 64, 1, 8));
    assert_eq!(store.stats().decodes, 16);
}

#[test]
fn test_pre_cancelled_request_decodes_nothing() {
    let store = Arc::new(TileStore::in_memory());
    let (image, decodes) = counting_image(16, 16, Duration::ZERO, store.clone());
    let cancel = CancelFlag::new();
    cancel.cancel();

    assert!(image.tile(0, 0, &cancel).unwrap_err().is_cancelled());
    assert_eq!(decodes.load(Ordering::SeqCst), 0);
    assert!(store.is_empty());

    image.tile(0, 0, &CancelFlag::new()).unwrap();
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_decode_is_not_cached() {
    let store = Arc::new(TileStore::in_memory());
    let source = FailingSource::new(descriptor(16, 16, 1, 8, 16), gradient(16, 16, 1, 8), 0);
    let image = RasterImage::new(Box::new(source), store.clone());

    for _ in 0..2 {
        let err = image.tile(0, 0, &CancelFlag::new()).unwrap_err();
        assert!(matches!(
            err,
            CodecError::CorruptData(CorruptDataError::ShortRead { .. })
        ));
    }
    assert!(store.is_empty());
    assert_eq!(store.stats().decodes, 2);
}

// =============================================================================
// Overflow
// =============================================================================

#[test]
fn test_overflow_spills_and_promotes() {
    let spill_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        TileStore::new(TileStoreConfig {
            max_tiles: 2,
            overflow: Some(OverflowConfig {
                dir: Some(spill_dir.path().to_path_buf()),
                max_bytes: 1 << 20,
            }),
            ..TileStoreConfig::default()
        })
        .unwrap(),
    );
    let (image, decodes) = counting_image(32, 32, Duration::ZERO, store.clone());
    let expected = gradient(32, 32, 1, 8);

    assert_eq!(image.to_samples(&CancelFlag::new()).unwrap(), expected);
    assert_eq!(store.len(), 2);
    assert_eq!(store.spilled_len(), 2);
    assert_eq!(dir_entries(spill_dir.path()).len(), 2);

    // Every tile is found in one tier or the other.
    assert_eq!(image.to_samples(&CancelFlag::new()).unwrap(), expected);
    assert_eq!(decodes.load(Ordering::SeqCst), 4);
    let stats = store.stats();
    assert!(stats.overflow_hits >= 2);
    assert!(stats.spills >= 2);

    image.close(false).unwrap();
    assert_eq!(store.len(), 0);
    assert_eq!(store.spilled_len(), 0);
    assert!(dir_entries(spill_dir.path()).is_empty());
}

#[test]
fn test_tile_larger_than_overflow_budget_is_dropped() {
    let store = TileStore::new(TileStoreConfig {
        max_tiles: 1,
        overflow: Some(OverflowConfig {
            dir: None,
            max_bytes: 1,
        }),
        ..TileStoreConfig::default()
    })
    .unwrap();
    let store = Arc::new(store);
    let (image, decodes) = counting_image(32, 16, Duration::ZERO, store.clone());

    image.to_samples(&CancelFlag::new()).unwrap();
    assert_eq!(store.spilled_len(), 0);
    image.to_samples(&CancelFlag::new()).unwrap();
    assert_eq!(decodes.load(Ordering::SeqCst), 4);
}

// =============================================================================
// Shared Store
// =============================================================================

#[test]
fn test_images_share_store_without_collisions() {
    let store = Arc::new(TileStore::in_memory());
    let (first, _) = counting_image(32, 32, Duration::ZERO, store.clone());
    let second = RasterImage::from_samples(
        descriptor(32, 32, 3, 8, 16),
        gradient(32, 32, 3, 8),
        store.clone(),
    )
    .unwrap();
    assert_ne!(first.id(), second.id());

    assert_eq!(
        first.to_samples(&CancelFlag::new()).unwrap(),
        gradient(32, 32, 1, 8)
    );
    assert_eq!(
        second.to_samples(&CancelFlag::new()).unwrap(),
        gradient(32, 32, 3, 8)
    );
    assert_eq!(store.len(), 8);

    first.close(false).unwrap();
    assert_eq!(store.len(), 4);
    assert!(store.contains(&TileKey::new(second.id(), 0, 0)));

    drop(second);
    assert!(store.is_empty());
}
