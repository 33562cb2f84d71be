//! Async worker integration tests.
//!
//! Tests verify:
//! - Decode and export run on worker threads and report progress
//! - A cancel request from the async side stops an export cleanly

use std::sync::Arc;
use std::time::Duration;

use raster_codec::{
    spawn_decode, spawn_export, ContainerFormat, DecodeOptions, DecodeTask,
    ExportOptions, ExportTask, MetadataBundle, ProgressEvent, RasterImage, TiffExportOptions,
    TiffLayout, TileStore,
};

use super::test_utils::{descriptor, dir_entries, export_to, gradient, memory_image, CountingSource};

// =============================================================================
// Decode Then Export
// =============================================================================

#[tokio::test]
async fn test_decode_then_export_through_workers() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.tif");
    let output = dir.path().join("out.jpg");
    export_to(
        &memory_image(48, 40, 3, 8, 16),
        &MetadataBundle::new(),
        &input,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let store = Arc::new(TileStore::in_memory());
    let decoded = spawn_decode(DecodeTask {
        path: input.clone(),
        options: DecodeOptions {
            page: 0,
            store: Some(store.clone()),
        },
    })
    .join()
    .await
    .unwrap();
    assert_eq!(decoded.image.width(), 48);

    let image = Arc::new(decoded.image);
    let mut handle = spawn_export(ExportTask {
        image: image.clone(),
        metadata: decoded.metadata,
        destination: output.clone(),
        options: ExportOptions::for_format(ContainerFormat::Jpeg),
    });

    let mut events = Vec::new();
    while let Some(event) = handle.progress.recv().await {
        events.push(event);
    }
    let report = handle.join().await.unwrap();

    assert_eq!(events.first(), Some(&ProgressEvent::Started { total: 1 }));
    assert_eq!(events.last(), Some(&ProgressEvent::Finished));
    assert_eq!(report.format, ContainerFormat::Jpeg);
    assert!(!report.replaced);
    assert!(store.len() > 0);

    image.close(false).unwrap();
    assert!(store.is_empty());
    assert_eq!(dir_entries(dir.path()), vec!["in.tif", "out.jpg"]);
}

#[tokio::test]
async fn test_decode_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = spawn_decode(DecodeTask {
        path: dir.path().join("absent.tif"),
        options: DecodeOptions::default(),
    })
    .join()
    .await
    .unwrap_err();
    assert!(!err.is_cancelled());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_export_from_async_side() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("slow.tif");
    let source = CountingSource::new(
        descriptor(64, 64, 1, 8, 16),
        gradient(64, 64, 1, 8),
        Duration::from_millis(20),
    );
    let image = Arc::new(RasterImage::new(
        Box::new(source),
        Arc::new(TileStore::in_memory()),
    ));

    let mut handle = spawn_export(ExportTask {
        image: image.clone(),
        metadata: MetadataBundle::new(),
        destination: output.clone(),
        options: ExportOptions::Tiff(TiffExportOptions {
            layout: Some(TiffLayout::Tiles {
                width: 16,
                height: 16,
            }),
            ..TiffExportOptions::default()
        }),
    });

    while let Some(event) = handle.progress.recv().await {
        if matches!(event, ProgressEvent::Advanced { .. }) {
            handle.cancel();
        }
    }
    let err = handle.join().await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(!output.exists());
    assert!(dir_entries(dir.path()).is_empty());

    image.close(true).unwrap();
}
