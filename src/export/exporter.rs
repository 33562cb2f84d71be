//! Atomic, cancellable export of a [`RasterImage`] to TIFF or JPEG.
//!
//! # State Machine
//!
//! ```text
//! Idle -> TempFileOpen -> MetadataWritten -> PixelDataWriting
//!      -> PatchPending | PatchNotNeeded -> Renamed
//!
//! any non-terminal state -> Failed | Cancelled   (temp file removed)
//! ```
//!
//! The output is written to a temporary file in the destination directory,
//! so the final rename never crosses a filesystem. The destination is only
//! touched once the temporary file is complete, patched and synced.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};

use crate::descriptor::{ColorSpace, FormatDescriptor};
use crate::embed::{ExifPatch, MetadataEmbedder};
use crate::error::{CodecError, ExportIoError, FormatError};
use crate::format::tiff::{ByteOrder, Compression, PatchReport, SampleFormat, TiffTag};
use crate::format::ContainerFormat;
use crate::image::RasterImage;
use crate::metadata::MetadataBundle;
use crate::native::{self, JpegWriter, NativeCodecHandle, TiffWriter};
use crate::software_string;
use crate::tile::Samples;

use super::progress::{CancelFlag, ProgressSink};

/// Default rows per strip for strip-organized TIFF output.
pub const DEFAULT_ROWS_PER_STRIP: u32 = 32;

/// Default tile edge when the source is not tiled.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default JPEG quality.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Scanlines handed to the JPEG encoder per progress unit.
const JPEG_ROWS_PER_BATCH: u32 = 64;

// =============================================================================
// Options
// =============================================================================

/// Chunk organization of TIFF output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TiffLayout {
    Strips { rows_per_strip: u32 },
    Tiles { width: u32, height: u32 },
}

impl TiffLayout {
    /// Tiles matching the source tile size, rounded up to a multiple of 16,
    /// or [`DEFAULT_TILE_SIZE`] for strip sources.
    pub fn default_for(descriptor: &FormatDescriptor) -> Self {
        if descriptor.tiled {
            let round = |v: u32| v.div_ceil(16).max(1) * 16;
            TiffLayout::Tiles {
                width: round(descriptor.tile_width),
                height: round(descriptor.tile_height),
            }
        } else {
            TiffLayout::Tiles {
                width: DEFAULT_TILE_SIZE,
                height: DEFAULT_TILE_SIZE,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiffExportOptions {
    /// `None` picks [`TiffLayout::default_for`] the source
    pub layout: Option<TiffLayout>,
    pub compression: Compression,
    pub byte_order: ByteOrder,

    /// Software tag; metadata text and layered output take precedence
    pub software: String,

    /// First page of this TIFF becomes page 2 of the output
    pub append_page: Option<PathBuf>,
}

impl Default for TiffExportOptions {
    fn default() -> Self {
        Self {
            layout: None,
            compression: Compression::Deflate,
            byte_order: ByteOrder::LittleEndian,
            software: software_string(),
            append_page: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegExportOptions {
    pub quality: u8,
}

impl Default for JpegExportOptions {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOptions {
    Tiff(TiffExportOptions),
    Jpeg(JpegExportOptions),
}

impl ExportOptions {
    pub fn container(&self) -> ContainerFormat {
        match self {
            ExportOptions::Tiff(_) => ContainerFormat::Tiff,
            ExportOptions::Jpeg(_) => ContainerFormat::Jpeg,
        }
    }

    /// Default options for `format`.
    pub fn for_format(format: ContainerFormat) -> Self {
        match format {
            ContainerFormat::Tiff => ExportOptions::Tiff(TiffExportOptions::default()),
            ContainerFormat::Jpeg => ExportOptions::Jpeg(JpegExportOptions::default()),
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    Idle,
    TempFileOpen,
    MetadataWritten,
    PixelDataWriting,
    PatchPending,
    PatchNotNeeded,
    Renamed,
    Failed,
    Cancelled,
}

impl ExportState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExportState::Renamed | ExportState::Failed | ExportState::Cancelled
        )
    }
}

/// Outcome of a successful export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub format: ContainerFormat,
    pub bytes: u64,

    /// Strips, tiles or scanline batches written
    pub units: u64,

    /// Whether the EXIF block was relocated
    pub exif_patched: bool,

    /// Whether an existing file was replaced
    pub replaced: bool,
}

// =============================================================================
// AtomicExporter
// =============================================================================

/// Runs one export. Not reusable: create one per destination.
pub struct AtomicExporter {
    options: ExportOptions,
    state: ExportState,
}

impl AtomicExporter {
    pub fn new(options: ExportOptions) -> Self {
        Self {
            options,
            state: ExportState::Idle,
        }
    }

    pub fn state(&self) -> ExportState {
        self.state
    }

    fn transition(&mut self, next: ExportState) {
        debug!(from = ?self.state, to = ?next, "export state");
        self.state = next;
    }

    /// Encode `image` with `metadata` to `destination`.
    ///
    /// On any failure or cancellation the temporary file is removed and the
    /// destination is left exactly as it was.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` was set; a clean abort
    /// - `FormatError` if the image cannot be stored in the chosen container
    /// - `ExportIoError` if the temp file, EXIF patch, delete or rename fails
    /// - any read, encode or I/O failure along the way
    pub fn export(
        &mut self,
        image: &RasterImage,
        metadata: &MetadataBundle,
        destination: &Path,
        progress: &mut dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<ExportReport, CodecError> {
        if self.state != ExportState::Idle {
            return Err(CodecError::Worker(format!(
                "exporter already used (state {:?})",
                self.state
            )));
        }
        let result = self.run(image, metadata, destination, progress, cancel);
        match &result {
            Ok(report) => {
                info!(
                    path = %report.path.display(),
                    format = report.format.name(),
                    bytes = report.bytes,
                    units = report.units,
                    "export complete"
                );
            }
            Err(e) if e.is_cancelled() => {
                self.transition(ExportState::Cancelled);
                info!(path = %destination.display(), "export cancelled");
            }
            Err(e) => {
                self.transition(ExportState::Failed);
                debug!(path = %destination.display(), error = %e, "export failed");
            }
        }
        result
    }

    fn run(
        &mut self,
        image: &RasterImage,
        metadata: &MetadataBundle,
        destination: &Path,
        progress: &mut dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<ExportReport, CodecError> {
        cancel.check()?;
        check_container(&self.options, image.descriptor())?;

        // Dropping `temp` on any early return deletes the file.
        let temp = create_temp(destination)?;
        self.transition(ExportState::TempFileOpen);

        let options = self.options.clone();
        let (units, patch) = match &options {
            ExportOptions::Tiff(opts) => {
                self.write_tiff(image, metadata, &temp, opts, progress, cancel)?
            }
            ExportOptions::Jpeg(opts) => {
                self.write_jpeg(image, metadata, &temp, opts, progress, cancel)?
            }
        };

        let temp_path = temp.into_temp_path();
        let exif_patched = match patch {
            ExifPatch::Pending => {
                self.transition(ExportState::PatchPending);
                cancel.check()?;
                let report = patch_staged_exif(&temp_path)?;
                report.is_some()
            }
            ExifPatch::NotNeeded => {
                self.transition(ExportState::PatchNotNeeded);
                false
            }
        };
        cancel.check()?;

        let bytes = fs::metadata(&temp_path)?.len();
        let replaced = replace_destination(temp_path, destination)?;
        self.transition(ExportState::Renamed);
        progress.finish();

        Ok(ExportReport {
            path: destination.to_path_buf(),
            format: self.options.container(),
            bytes,
            units,
            exif_patched,
            replaced,
        })
    }

    // -------------------------------------------------------------------------
    // TIFF
    // -------------------------------------------------------------------------

    fn write_tiff(
        &mut self,
        image: &RasterImage,
        metadata: &MetadataBundle,
        temp: &NamedTempFile,
        opts: &TiffExportOptions,
        progress: &mut dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<(u64, ExifPatch), CodecError> {
        let d = image.descriptor();
        let layout = opts.layout.unwrap_or_else(|| TiffLayout::default_for(d));
        let writer = TiffWriter::new(temp.as_file().try_clone()?, opts.byte_order)?;
        let handle = NativeCodecHandle::new(temp.path(), writer);

        let result = (|| -> Result<(u64, ExifPatch), CodecError> {
            handle.with_session(|w| {
                set_layout_fields(w, d, layout, opts.compression)?;
                w.set_string(TiffTag::Software, &opts.software)
            })?;
            let patch = MetadataEmbedder::embed_tiff(&handle, metadata, d)?;
            if let Some(page) = &opts.append_page {
                handle.with_session(|w| w.append_page(page))?;
            }
            self.transition(ExportState::MetadataWritten);

            let count = handle.with_session(|w| w.chunk_count())?;
            progress.begin(count as u64);
            self.transition(ExportState::PixelDataWriting);
            for index in 0..count {
                cancel.check()?;
                let data = tiff_chunk(image, layout, index, opts.byte_order, cancel)?;
                handle.with_session(|w| w.write_chunk(index, &data))?;
                progress.advance(1);
            }
            Ok((count as u64, patch))
        })();

        finish_session(&handle, result)
    }

    // -------------------------------------------------------------------------
    // JPEG
    // -------------------------------------------------------------------------

    fn write_jpeg(
        &mut self,
        image: &RasterImage,
        metadata: &MetadataBundle,
        temp: &NamedTempFile,
        opts: &JpegExportOptions,
        progress: &mut dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<(u64, ExifPatch), CodecError> {
        let d = image.descriptor();
        let writer = JpegWriter::new(
            temp.as_file().try_clone()?,
            d.width,
            d.height,
            d.bands,
            opts.quality,
        )?;
        let handle = NativeCodecHandle::new(temp.path(), writer);

        let result = (|| -> Result<(u64, ExifPatch), CodecError> {
            MetadataEmbedder::embed_jpeg(&handle, metadata, d)?;
            self.transition(ExportState::MetadataWritten);

            let batches = d.height.div_ceil(JPEG_ROWS_PER_BATCH);
            progress.begin(batches as u64);
            self.transition(ExportState::PixelDataWriting);
            for batch in 0..batches {
                cancel.check()?;
                let y = batch * JPEG_ROWS_PER_BATCH;
                let rows = JPEG_ROWS_PER_BATCH.min(d.height - y);
                let Samples::U8(data) = image.read_rect(0, y, d.width, rows, cancel)? else {
                    return Err(FormatError::UnsupportedBitDepth(d.bits_per_sample).into());
                };
                handle.with_session(|w| w.write_scanlines(&data))?;
                progress.advance(1);
            }
            Ok((batches as u64, ExifPatch::NotNeeded))
        })();

        finish_session(&handle, result)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Reject images the container cannot hold before any file is created.
fn check_container(options: &ExportOptions, d: &FormatDescriptor) -> Result<(), FormatError> {
    match options {
        ExportOptions::Jpeg(_) => {
            if d.bits_per_sample != 8 {
                return Err(FormatError::UnsupportedBitDepth(d.bits_per_sample));
            }
            if !matches!(d.bands, 1 | 3 | 4) {
                return Err(FormatError::UnsupportedBandCount(d.bands));
            }
            if d.colorspace == ColorSpace::Lab {
                return Err(FormatError::UnsupportedLayout("Lab JPEG output".into()));
            }
        }
        ExportOptions::Tiff(opts) => {
            if !matches!(
                opts.compression,
                Compression::None | Compression::Deflate | Compression::PackBits
            ) {
                return Err(FormatError::UnsupportedLayout(format!(
                    "{} compression on write",
                    opts.compression.name()
                )));
            }
            let bad = match opts.layout {
                Some(TiffLayout::Strips { rows_per_strip }) => rows_per_strip == 0,
                Some(TiffLayout::Tiles { width, height }) => {
                    width == 0 || height == 0 || width % 16 != 0 || height % 16 != 0
                }
                None => false,
            };
            if bad {
                return Err(FormatError::UnsupportedLayout(format!(
                    "TIFF layout {:?}",
                    opts.layout
                )));
            }
        }
    }
    Ok(())
}

fn create_temp(destination: &Path) -> Result<NamedTempFile, CodecError> {
    let dir = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|e| {
            ExportIoError::TempFile {
                dir: dir.clone(),
                message: e.to_string(),
            }
            .into()
        })
}

/// Close the session. On success a failing close fails the export; on
/// failure the session is discarded and the original error wins.
fn finish_session<S: native::NativeSession, T>(
    handle: &NativeCodecHandle<S>,
    result: Result<T, CodecError>,
) -> Result<T, CodecError> {
    match result {
        Ok(value) => {
            handle.dispose(false)?;
            Ok(value)
        }
        Err(e) => {
            if let Err(close) = handle.dispose(true) {
                debug!(error = %close, "discarding session of failed export");
            }
            Err(e)
        }
    }
}

fn patch_staged_exif(path: &Path) -> Result<Option<PatchReport>, CodecError> {
    MetadataEmbedder::patch_tiff(path).map_err(|e| {
        ExportIoError::Patch {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}

fn set_layout_fields(
    w: &mut TiffWriter,
    d: &FormatDescriptor,
    layout: TiffLayout,
    compression: Compression,
) -> Result<(), CodecError> {
    let bands = d.bands as usize;
    w.set_int_field(TiffTag::ImageWidth, d.width)?;
    w.set_int_field(TiffTag::ImageLength, d.height)?;
    w.set_shorts(TiffTag::BitsPerSample, &vec![d.bits_per_sample; bands])?;
    w.set_shorts(TiffTag::SamplesPerPixel, &[d.bands])?;
    w.set_shorts(TiffTag::PhotometricInterpretation, &[photometric_for(d)])?;
    w.set_shorts(TiffTag::PlanarConfiguration, &[1])?;
    w.set_shorts(TiffTag::Compression, &[compression.as_u16()])?;
    if d.sample_format == SampleFormat::Int {
        w.set_shorts(TiffTag::SampleFormat, &vec![SampleFormat::Int.as_u16(); bands])?;
    }
    match layout {
        TiffLayout::Strips { rows_per_strip } => {
            w.set_int_field(TiffTag::RowsPerStrip, rows_per_strip.min(d.height))?;
        }
        TiffLayout::Tiles { width, height } => {
            w.set_int_field(TiffTag::TileWidth, width)?;
            w.set_int_field(TiffTag::TileLength, height)?;
        }
    }
    Ok(())
}

/// Photometric interpretation for the decoded colour bands.
fn photometric_for(d: &FormatDescriptor) -> u16 {
    if d.colorspace == ColorSpace::Lab || (d.photometric == 8 && d.bands == 3) {
        return 8;
    }
    match d.bands {
        1 => 1,
        4 => 5,
        _ => 2,
    }
}

/// Raw bytes of strip or tile `index`, edge tiles zero-padded to full size.
fn tiff_chunk(
    image: &RasterImage,
    layout: TiffLayout,
    index: u32,
    order: ByteOrder,
    cancel: &CancelFlag,
) -> Result<Vec<u8>, CodecError> {
    let (width, height) = (image.width(), image.height());
    let bands = image.bands() as usize;
    match layout {
        TiffLayout::Strips { rows_per_strip } => {
            let rps = rows_per_strip.min(height);
            let y = index * rps;
            let rows = rps.min(height - y);
            let samples = image.read_rect(0, y, width, rows, cancel)?;
            Ok(samples_to_bytes(&samples, order))
        }
        TiffLayout::Tiles {
            width: tw,
            height: th,
        } => {
            let across = width.div_ceil(tw);
            let x = (index % across) * tw;
            let y = (index / across) * th;
            let w = tw.min(width - x);
            let h = th.min(height - y);
            let samples = image.read_rect(x, y, w, h, cancel)?;
            let sample_bytes = samples.sample_type().bytes();
            let bytes = samples_to_bytes(&samples, order);
            if w == tw && h == th {
                return Ok(bytes);
            }
            let src_row = w as usize * bands * sample_bytes;
            let dst_row = tw as usize * bands * sample_bytes;
            let mut out = vec![0u8; dst_row * th as usize];
            for (row, chunk) in bytes.chunks_exact(src_row).enumerate() {
                out[row * dst_row..row * dst_row + src_row].copy_from_slice(chunk);
            }
            Ok(out)
        }
    }
}

fn samples_to_bytes(samples: &Samples, order: ByteOrder) -> Vec<u8> {
    match samples {
        Samples::U8(v) => v.clone(),
        Samples::U16(v) => {
            let mut out = Vec::with_capacity(v.len() * 2);
            for &s in v {
                order.put_u16(&mut out, s);
            }
            out
        }
    }
}

/// Move the finished temp file onto `destination`. Returns whether a file
/// was replaced.
///
/// An existing destination is deleted first. Delete and rename are each
/// retried once after closing every handle this process holds on the path.
fn replace_destination(temp: TempPath, destination: &Path) -> Result<bool, CodecError> {
    let replaced = match fs::symlink_metadata(destination) {
        Ok(_) => {
            retry_after_force_close(destination, "delete", || fs::remove_file(destination))
                .map_err(|e| ExportIoError::Delete {
                    path: destination.to_path_buf(),
                    message: e.to_string(),
                })?;
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    let temp = match temp.persist(destination) {
        Ok(()) => return Ok(replaced),
        Err(e) => {
            warn!(path = %destination.display(), error = %e.error, "rename failed, retrying");
            e.path
        }
    };
    let closed = native::force_close(destination);
    debug!(closed, "closed open handles before rename retry");
    temp.persist(destination).map_err(|e| {
        // `e.path` drops here and removes the temp file.
        ExportIoError::Rename {
            path: destination.to_path_buf(),
            message: e.error.to_string(),
        }
    })?;
    Ok(replaced)
}

fn retry_after_force_close(
    path: &Path,
    what: &str,
    mut op: impl FnMut() -> io::Result<()>,
) -> io::Result<()> {
    match op() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "{} failed, retrying", what);
            let closed = native::force_close(path);
            debug!(closed, "closed open handles before retry");
            match op() {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        }
    }
}
