//! Codec sessions and the handle that serializes access to them.
//!
//! Each open file is one session: a [`TiffReader`], [`TiffWriter`],
//! [`JpegReader`] or [`JpegWriter`]. Sessions are not reentrant, so they are
//! only reachable through a [`NativeCodecHandle`], which holds the session
//! behind a lock and disposes it exactly once.
//!
//! Call [`init`] once at startup. It exercises the JPEG and Deflate engines
//! and caches the outcome, so a broken build fails loudly before any file is
//! touched.

mod handle;
mod jpeg_reader;
mod jpeg_writer;
mod registry;
mod tiff_reader;
mod tiff_writer;

use std::sync::OnceLock;

use tracing::debug;

use crate::error::{CodecError, NativeError};
use crate::format::tiff::{compress, decompress, Compression};

pub use handle::NativeCodecHandle;
pub use jpeg_reader::{JpegReader, JPEG_BAND_HEIGHT};
pub use jpeg_writer::JpegWriter;
pub use registry::{force_close, open_handle_count, register, ForceClose};
pub use tiff_reader::{ChunkLayout, TiffReader};
pub use tiff_writer::TiffWriter;

/// One open codec session.
///
/// `close` finishes the session: writers flush and finalize their file,
/// readers release their buffers. It is called at most once, by the owning
/// handle.
pub trait NativeSession: Send {
    fn close(&mut self) -> Result<(), CodecError>;
}

static INIT: OnceLock<Result<(), NativeError>> = OnceLock::new();

/// Initialise the codec engines. Idempotent; the first outcome is cached.
///
/// # Errors
/// Returns `NativeError::Init` if an engine fails its self-check.
pub fn init() -> Result<(), NativeError> {
    INIT.get_or_init(|| {
        let result = check_jpeg().and_then(|_| check_deflate());
        match &result {
            Ok(()) => debug!("codec engines initialised"),
            Err(e) => debug!(error = %e, "codec engine self-check failed"),
        }
        result
    })
    .clone()
}

/// Encode and decode a 1x1 gray image.
fn check_jpeg() -> Result<(), NativeError> {
    let mut encoded = Vec::new();
    jpeg_encoder::Encoder::new(&mut encoded, 90)
        .encode(&[128], 1, 1, jpeg_encoder::ColorType::Luma)
        .map_err(|e| NativeError::Init(format!("jpeg encoder: {}", e)))?;

    let pixels = jpeg_decoder::Decoder::new(encoded.as_slice())
        .decode()
        .map_err(|e| NativeError::Init(format!("jpeg decoder: {}", e)))?;
    match pixels.as_slice() {
        [value] if value.abs_diff(128) <= 2 => Ok(()),
        other => Err(NativeError::Init(format!(
            "jpeg round trip produced {:?}",
            other
        ))),
    }
}

fn check_deflate() -> Result<(), NativeError> {
    let sample = b"raster-codec deflate self-check";
    let packed = compress(Compression::Deflate, sample)
        .map_err(|e| NativeError::Init(format!("deflate: {}", e)))?;
    let unpacked = decompress(Compression::Deflate, &packed, sample.len())
        .map_err(|e| NativeError::Init(format!("inflate: {}", e)))?;
    if unpacked != sample {
        return Err(NativeError::Init("deflate round trip mismatch".into()));
    }
    Ok(())
}
