//! Encoding images to disk.
//!
//! - [`AtomicExporter`]: temp file, metadata, pixels, EXIF patch, rename
//! - [`ProgressSink`] and [`CancelFlag`]: per-unit progress and cooperative
//!   cancellation
//! - [`spawn_export`] / [`spawn_decode`]: the same operations on tokio
//!   blocking workers

mod exporter;
mod progress;
mod worker;

pub use exporter::{
    AtomicExporter, ExportOptions, ExportReport, ExportState, JpegExportOptions,
    TiffExportOptions, TiffLayout, DEFAULT_JPEG_QUALITY, DEFAULT_ROWS_PER_STRIP,
    DEFAULT_TILE_SIZE,
};
pub use progress::{CancelFlag, ChannelProgress, NoProgress, ProgressEvent, ProgressSink};
pub use worker::{spawn_decode, spawn_export, DecodeTask, ExportTask, TaskHandle};
