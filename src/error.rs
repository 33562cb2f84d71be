//! Error taxonomy for the codec layer.
//!
//! Low-level failures are mapped onto [`CodecError`] at the native handle
//! boundary. Every type here is `Clone` so a single decode failure can be
//! handed to every caller waiting on the same tile.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur when parsing TIFF structures
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),
}

/// Unsupported pixel layouts and containers.
///
/// Never retried; surfaced to the caller as-is.
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    #[error("Unsupported bits per sample: {0} (expected 8 or 16)")]
    UnsupportedBitDepth(u16),

    #[error("Unsupported band count without a color profile: {0} (expected 1, 3 or 4)")]
    UnsupportedBandCount(u16),

    #[error("Unsupported sample layout: {0}")]
    UnsupportedLayout(String),

    /// File is not a recognized container
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },
}

/// A file or stream whose contents do not match what its headers promise.
#[derive(Debug, Clone, Error)]
pub enum CorruptDataError {
    #[error("TIFF structure error: {0}")]
    Tiff(#[from] TiffError),

    #[error("Short read on {unit} {index}: expected {expected} bytes, got {actual}")]
    ShortRead {
        unit: &'static str,
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Short write on {unit} {index}: expected {expected} bytes, wrote {actual}")]
    ShortWrite {
        unit: &'static str,
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid JPEG stream: {0}")]
    Jpeg(String),

    #[error("Invalid metadata block: {0}")]
    Metadata(String),

    #[error("Invalid compressed payload: {0}")]
    Compressed(String),
}

/// Failures surfaced from a codec session.
#[derive(Debug, Clone, Error)]
pub enum NativeError {
    /// The session was disposed before every scanline was processed.
    ///
    /// Benign after a user cancellation, fatal otherwise.
    #[error("Too few scanlines: {processed} of {expected} rows processed")]
    TooFewScanlines { processed: u32, expected: u32 },

    #[error("Codec session for {0} used after dispose")]
    Disposed(String),

    #[error("{codec} codec failure: {message}")]
    Codec {
        codec: &'static str,
        message: String,
    },

    #[error("Codec initialization failed: {0}")]
    Init(String),

    #[error("Metadata must be written before pixel data")]
    MetadataAfterPixels,
}

impl NativeError {
    pub(crate) fn codec(codec: &'static str, message: impl Into<String>) -> Self {
        NativeError::Codec {
            codec,
            message: message.into(),
        }
    }
}

/// Failures while moving the finished export into place.
#[derive(Debug, Clone, Error)]
pub enum ExportIoError {
    #[error("Cannot create temporary file in {dir}: {message}")]
    TempFile { dir: PathBuf, message: String },

    #[error("Cannot delete existing {path} after retry: {message}")]
    Delete { path: PathBuf, message: String },

    #[error("Cannot rename temporary file onto {path} after retry: {message}")]
    Rename { path: PathBuf, message: String },

    #[error("EXIF patch failed on {path}: {message}")]
    Patch { path: PathBuf, message: String },
}

/// Top-level error returned by decode and encode operations.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("Corrupt data: {0}")]
    CorruptData(#[from] CorruptDataError),

    #[error("Native library error: {0}")]
    Native(#[from] NativeError),

    /// User-requested abort. Not a failure.
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    ExportIo(#[from] ExportIoError),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Worker failed: {0}")]
    Worker(String),
}

impl CodecError {
    /// Whether this is a clean, user-requested abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CodecError::Cancelled)
    }
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        CodecError::Io(Arc::new(err))
    }
}

impl From<TiffError> for CodecError {
    fn from(err: TiffError) -> Self {
        CodecError::CorruptData(CorruptDataError::Tiff(err))
    }
}
