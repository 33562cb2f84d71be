//! Top-level decode and encode entry points.
//!
//! ```text
//! decode: file -> codec session -> FormatDescriptor -> RasterImage (+ metadata)
//! encode: RasterImage + metadata -> AtomicExporter -> file
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::FormatDescriptor;
use crate::error::{CodecError, FormatError};
use crate::export::{AtomicExporter, CancelFlag, ExportOptions, ExportReport, ProgressSink};
use crate::format::{detect_format, ContainerFormat};
use crate::image::RasterImage;
use crate::metadata::MetadataBundle;
use crate::native::{self, JpegReader, NativeCodecHandle, TiffReader};
use crate::tile::{JpegTileSource, TiffTileSource, TileSource, TileStore};

/// How to open a file.
#[derive(Clone, Default)]
pub struct DecodeOptions {
    /// Zero-based page (TIFF directory) to open
    pub page: u32,

    /// Tile store to share with other images; a private in-memory store if
    /// unset
    pub store: Option<Arc<TileStore>>,
}

impl std::fmt::Debug for DecodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("page", &self.page)
            .field("shared_store", &self.store.is_some())
            .finish()
    }
}

/// An opened image with its metadata.
#[derive(Debug)]
pub struct Decoded {
    pub image: RasterImage,
    pub metadata: MetadataBundle,
}

/// Open `path` with default options.
///
/// # Errors
/// See [`decode_with`].
pub fn decode(path: &Path) -> Result<Decoded, CodecError> {
    decode_with(path, &DecodeOptions::default())
}

/// Open `path`: detect the container, read the header and metadata, and
/// wrap the session in a [`RasterImage`]. Pixel data is decoded lazily,
/// tile by tile.
///
/// # Errors
/// - `Native(Init)` if the codec engines failed their self-check
/// - `UnsupportedFormat` for unknown containers
/// - `FormatError` for layouts outside 8/16-bit, 1/3/4 bands
/// - `CorruptData` for structurally broken files
pub fn decode_with(path: &Path, options: &DecodeOptions) -> Result<Decoded, CodecError> {
    native::init()?;
    let format = detect_format(path)?;
    let store = options
        .store
        .clone()
        .unwrap_or_else(|| Arc::new(TileStore::in_memory()));

    let (source, metadata): (Box<dyn TileSource>, MetadataBundle) = match format {
        ContainerFormat::Tiff => {
            let mut reader = TiffReader::open(path)?;
            reader.select_directory(options.page as usize)?;
            let fields = reader.header_fields()?;
            let metadata = reader.metadata()?;
            let descriptor = FormatDescriptor::derive(fields)?;
            let handle = NativeCodecHandle::open_registered(path, reader);
            (Box::new(TiffTileSource::new(handle, descriptor)?), metadata)
        }
        ContainerFormat::Jpeg => {
            if options.page != 0 {
                return Err(FormatError::UnsupportedLayout(format!(
                    "page {} requested, JPEG has 1",
                    options.page + 1
                ))
                .into());
            }
            let reader = JpegReader::open(path)?;
            let fields = reader.header_fields()?;
            let metadata = reader.metadata();
            let descriptor = FormatDescriptor::derive(fields)?;
            let handle = NativeCodecHandle::open_registered(path, reader);
            (Box::new(JpegTileSource::new(handle, descriptor)?), metadata)
        }
    };

    debug!(
        path = %path.display(),
        format = format.name(),
        page = options.page,
        "decoded header"
    );
    Ok(Decoded {
        image: RasterImage::new(source, store),
        metadata,
    })
}

/// Encode `image` and `metadata` to `path`, atomically replacing any file
/// already there.
///
/// # Errors
/// See [`AtomicExporter::export`].
pub fn encode(
    image: &RasterImage,
    metadata: &MetadataBundle,
    path: &Path,
    options: &ExportOptions,
    progress: &mut dyn ProgressSink,
    cancel: &CancelFlag,
) -> Result<ExportReport, CodecError> {
    native::init()?;
    AtomicExporter::new(options.clone()).export(image, metadata, path, progress, cancel)
}
