//! # Raster Codec
//!
//! A codec layer for tiled raster images stored as TIFF or JPEG files.
//!
//! Images are opened lazily: the header and embedded metadata are read up
//! front, pixel data is decoded tile by tile on demand and cached in a
//! shared, size-bounded [`TileStore`]. Exports go to a temporary file next
//! to the destination and are renamed over it only once complete, so a
//! failed or cancelled export never leaves a partial file behind.
//!
//! ## Features
//!
//! - **Formats**: 8 and 16-bit TIFF (strips or tiles, None/Deflate/PackBits)
//!   and baseline 8-bit JPEG, with 1 (gray), 3 (RGB or Lab) or 4 (CMYK)
//!   colour bands
//! - **Metadata**: EXIF (with GPS and Interoperability), IPTC, XMP, ICC and
//!   the descriptive TIFF text fields round-trip through both containers
//! - **Tile store**: single-flight decoding, LRU eviction with spill to an
//!   overflow directory
//! - **Export**: atomic replace, per-unit progress and cooperative
//!   cancellation, optionally on tokio blocking workers
//!
//! ## Architecture
//!
//! - [`codec`] - `decode` / `encode` entry points
//! - [`descriptor`] - pixel layout derived from a file header
//! - [`image`] - lazily decoded images over a tile source
//! - [`tile`] - tile sources and the shared tile store
//! - [`metadata`] - EXIF, IPTC, XMP and ICC codecs
//! - [`embed`] - writing metadata into an encode session
//! - [`export`] - the atomic exporter, progress and workers
//! - [`native`] - codec sessions behind serialized handles
//! - [`mod@format`] - TIFF structures and JPEG markers
//! - [`io`] - random-access file traits
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use raster_codec::{decode, encode, CancelFlag, ContainerFormat, ExportOptions, NoProgress};
//!
//! fn main() -> Result<(), raster_codec::CodecError> {
//!     let decoded = decode(Path::new("scan.tif"))?;
//!     encode(
//!         &decoded.image,
//!         &decoded.metadata,
//!         Path::new("scan.jpg"),
//!         &ExportOptions::for_format(ContainerFormat::Jpeg),
//!         &mut NoProgress,
//!         &CancelFlag::new(),
//!     )?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod embed;
pub mod error;
pub mod export;
pub mod format;
pub mod image;
pub mod io;
pub mod metadata;
pub mod native;
pub mod tile;

/// Name written to the TIFF Software tag. Files whose Software tag starts
/// with it are treated as layered documents written by this crate.
pub const SOFTWARE_NAME: &str = "raster-codec";

/// Software tag value: name and crate version.
pub fn software_string() -> String {
    format!("{} {}", SOFTWARE_NAME, env!("CARGO_PKG_VERSION"))
}

// Re-export commonly used types
pub use codec::{decode, decode_with, encode, DecodeOptions, Decoded};
pub use config::{Cli, Command, ConvertConfig, InfoConfig};
pub use descriptor::{ColorSpace, FormatDescriptor, HeaderFields};
pub use embed::{ExifPatch, MetadataEmbedder};
pub use error::{
    CodecError, CorruptDataError, ExportIoError, FormatError, NativeError, TiffError,
};
pub use export::{
    spawn_decode, spawn_export, AtomicExporter, CancelFlag, ChannelProgress, DecodeTask,
    ExportOptions, ExportReport, ExportState, ExportTask, JpegExportOptions, NoProgress,
    ProgressEvent, ProgressSink, TaskHandle, TiffExportOptions, TiffLayout,
};
pub use format::tiff::{ByteOrder, Compression, TiffTag};
pub use format::{detect_format, ContainerFormat};
pub use image::RasterImage;
pub use metadata::{
    ColorProfile, ExifDirectory, ExifValue, IptcDataSet, IptcDirectory, MetadataBundle,
    Resolution, ResolutionUnit, TextField, XmpPacket,
};
pub use native::{NativeCodecHandle, NativeSession};
pub use tile::{
    OverflowConfig, RasterTile, SampleType, Samples, TileKey, TileSource, TileStore,
    TileStoreConfig, TileStoreStats,
};
