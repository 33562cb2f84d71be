//! Atomic export integration tests.
//!
//! Tests verify:
//! - A failure while writing pixels leaves the destination untouched
//! - Cancellation leaves the destination untouched and no temp file behind
//! - An existing destination is replaced only by a complete file
//! - Unsupported combinations are rejected before anything is written

use std::sync::Arc;

use raster_codec::error::{CodecError, ExportIoError, FormatError};
use raster_codec::export::ProgressSink;
use raster_codec::{
    decode, AtomicExporter, ByteOrder, CancelFlag, ContainerFormat, ExportOptions, ExportState,
    FormatDescriptor, MetadataBundle, NoProgress, RasterImage, Samples, TiffExportOptions,
    TiffLayout, TileStore,
};

use super::test_utils::{
    descriptor, dir_entries, export_to, gradient, memory_image, scratch_path, FailingSource,
};

/// Records every progress call and raises `cancel` after `cancel_at` units.
struct Recorder {
    total: Option<u64>,
    advanced: u64,
    finished: bool,
    cancel_at: Option<(u64, CancelFlag)>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            total: None,
            advanced: 0,
            finished: false,
            cancel_at: None,
        }
    }

    fn cancelling_after(units: u64, cancel: CancelFlag) -> Self {
        Self {
            cancel_at: Some((units, cancel)),
            ..Self::new()
        }
    }
}

impl ProgressSink for Recorder {
    fn begin(&mut self, total_units: u64) {
        self.total = Some(total_units);
    }

    fn advance(&mut self, units: u64) {
        self.advanced += units;
        if let Some((at, cancel)) = &self.cancel_at {
            if self.advanced >= *at {
                cancel.cancel();
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

fn failing_image(width: u32, height: u32, fail_at: usize) -> RasterImage {
    let d = descriptor(width, height, 3, 8, 16);
    RasterImage::new(
        Box::new(FailingSource::new(d, gradient(width, height, 3, 8), fail_at)),
        Arc::new(TileStore::in_memory()),
    )
}

// =============================================================================
// Failure Paths
// =============================================================================

#[test]
fn test_write_failure_keeps_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "photo.tif");
    std::fs::write(&dest, b"previous contents").unwrap();

    for format in [ContainerFormat::Tiff, ContainerFormat::Jpeg] {
        let image = failing_image(64, 64, 3);
        let mut exporter = AtomicExporter::new(ExportOptions::for_format(format));
        let err = exporter
            .export(
                &image,
                &MetadataBundle::new(),
                &dest,
                &mut NoProgress,
                &CancelFlag::new(),
            )
            .unwrap_err();

        assert!(matches!(err, CodecError::CorruptData(_)), "{:?}", err);
        assert_eq!(exporter.state(), ExportState::Failed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous contents");
        assert_eq!(dir_entries(dir.path()), vec!["photo.tif".to_string()]);
    }
}

#[test]
fn test_write_failure_without_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "new.tif");
    let err = export_to(
        &failing_image(64, 64, 0),
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap_err();
    assert!(!err.is_cancelled());
    assert!(!dest.exists());
    assert!(dir_entries(dir.path()).is_empty());
}

#[test]
fn test_missing_directory_is_temp_file_error() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("no-such-dir").join("out.tif");
    let err = export_to(
        &memory_image(8, 8, 1, 8, 16),
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CodecError::ExportIo(ExportIoError::TempFile { .. })
    ));
}

#[test]
fn test_append_page_failure_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let other = scratch_path(&dir, "other.tif");
    let dest = scratch_path(&dir, "layered.tif");
    export_to(
        &memory_image(8, 8, 1, 8, 16),
        &MetadataBundle::new(),
        &other,
        &ExportOptions::Tiff(TiffExportOptions {
            byte_order: ByteOrder::BigEndian,
            ..TiffExportOptions::default()
        }),
    )
    .unwrap();

    let err = export_to(
        &memory_image(8, 8, 1, 8, 16),
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::Tiff(TiffExportOptions {
            append_page: Some(other),
            ..TiffExportOptions::default()
        }),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CodecError::Format(FormatError::UnsupportedLayout(_))
    ));
    assert_eq!(dir_entries(dir.path()), vec!["other.tif".to_string()]);
}

// =============================================================================
// Rejected Combinations
// =============================================================================

#[test]
fn test_jpeg_rejects_sixteen_bit_and_lab() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "out.jpg");
    let options = ExportOptions::for_format(ContainerFormat::Jpeg);

    let err = export_to(&memory_image(8, 8, 3, 16, 16), &MetadataBundle::new(), &dest, &options)
        .unwrap_err();
    assert!(matches!(
        err,
        CodecError::Format(FormatError::UnsupportedBitDepth(16))
    ));

    let lab = FormatDescriptor::for_raster(8, 8, 3, 8, Some(8), (16, 16)).unwrap();
    let image =
        RasterImage::from_samples(lab, Samples::U8(vec![50; 192]), Arc::new(TileStore::in_memory()))
            .unwrap();
    let err = export_to(&image, &MetadataBundle::new(), &dest, &options).unwrap_err();
    assert!(matches!(err, CodecError::Format(_)));
    assert!(dir_entries(dir.path()).is_empty());
}

#[test]
fn test_lab_tiff_keeps_photometric() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "lab.tif");
    let lab = FormatDescriptor::for_raster(8, 8, 3, 8, Some(8), (16, 16)).unwrap();
    let image =
        RasterImage::from_samples(lab, Samples::U8(vec![50; 192]), Arc::new(TileStore::in_memory()))
            .unwrap();
    export_to(
        &image,
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let decoded = decode(&dest).unwrap();
    assert_eq!(decoded.image.descriptor().photometric, 8);
    assert_eq!(
        decoded.image.descriptor().colorspace,
        raster_codec::ColorSpace::Lab
    );
}

#[test]
fn test_tile_size_must_be_multiple_of_sixteen() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "odd.tif");
    let err = export_to(
        &memory_image(8, 8, 1, 8, 16),
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::Tiff(TiffExportOptions {
            layout: Some(TiffLayout::Tiles {
                width: 20,
                height: 16,
            }),
            ..TiffExportOptions::default()
        }),
    )
    .unwrap_err();
    assert!(matches!(err, CodecError::Format(_)));
    assert!(!dest.exists());
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_mid_export_keeps_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "photo.tif");
    std::fs::write(&dest, b"keep me").unwrap();

    let cancel = CancelFlag::new();
    let mut progress = Recorder::cancelling_after(2, cancel.clone());
    let mut exporter = AtomicExporter::new(ExportOptions::Tiff(TiffExportOptions {
        layout: Some(TiffLayout::Strips { rows_per_strip: 8 }),
        ..TiffExportOptions::default()
    }));
    let err = exporter
        .export(
            &memory_image(32, 64, 3, 8, 16),
            &MetadataBundle::new(),
            &dest,
            &mut progress,
            &cancel,
        )
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(exporter.state(), ExportState::Cancelled);
    assert_eq!(progress.total, Some(8));
    assert_eq!(progress.advanced, 2);
    assert!(!progress.finished);
    assert_eq!(std::fs::read(&dest).unwrap(), b"keep me");
    assert_eq!(dir_entries(dir.path()), vec!["photo.tif".to_string()]);
}

#[test]
fn test_cancel_mid_jpeg_export() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "photo.jpg");

    let cancel = CancelFlag::new();
    let mut progress = Recorder::cancelling_after(1, cancel.clone());
    let err = raster_codec::encode(
        &memory_image(16, 200, 1, 8, 16),
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::for_format(ContainerFormat::Jpeg),
        &mut progress,
        &cancel,
    )
    .unwrap_err();

    // Discarding the half-written session must not mask the cancellation.
    assert!(err.is_cancelled(), "{:?}", err);
    assert_eq!(progress.total, Some(4));
    assert!(dir_entries(dir.path()).is_empty());
}

// =============================================================================
// Success Paths
// =============================================================================

#[test]
fn test_export_replaces_destination() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "photo.tif");
    std::fs::write(&dest, b"old").unwrap();

    let mut progress = Recorder::new();
    let mut exporter = AtomicExporter::new(ExportOptions::Tiff(TiffExportOptions {
        layout: Some(TiffLayout::Tiles {
            width: 16,
            height: 16,
        }),
        ..TiffExportOptions::default()
    }));
    let report = exporter
        .export(
            &memory_image(40, 20, 3, 8, 16),
            &MetadataBundle::new(),
            &dest,
            &mut progress,
            &CancelFlag::new(),
        )
        .unwrap();

    assert_eq!(exporter.state(), ExportState::Renamed);
    assert!(report.replaced);
    assert_eq!(report.units, 6);
    assert_eq!(report.bytes, std::fs::metadata(&dest).unwrap().len());
    assert_eq!((progress.total, progress.advanced), (Some(6), 6));
    assert!(progress.finished);
    assert_eq!(dir_entries(dir.path()), vec!["photo.tif".to_string()]);
    assert_eq!(
        decode(&dest)
            .unwrap()
            .image
            .to_samples(&CancelFlag::new())
            .unwrap(),
        gradient(40, 20, 3, 8)
    );
}

#[test]
fn test_export_while_destination_is_open() {
    let dir = tempfile::tempdir().unwrap();
    let dest = scratch_path(&dir, "photo.tif");
    export_to(
        &memory_image(16, 16, 1, 8, 16),
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    // The old file stays open through a registered read handle.
    let old = decode(&dest).unwrap();
    let report = export_to(
        &memory_image(24, 24, 3, 8, 16),
        &MetadataBundle::new(),
        &dest,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();
    assert!(report.replaced);
    drop(old);

    let new = decode(&dest).unwrap();
    assert_eq!(new.image.width(), 24);
}
