//! Container detection by magic bytes.
//!
//! Supported containers:
//!
//! - **TIFF**: "II*\0" or "MM\0*", classic or BigTIFF
//! - **JPEG**: SOI followed by any marker ("FF D8 FF")
//!
//! Anything else is a [`FormatError::UnsupportedFormat`].

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;

use crate::error::{CodecError, FormatError};

// =============================================================================
// ContainerFormat
// =============================================================================

/// Detected container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Tiff,
    Jpeg,
}

impl ContainerFormat {
    /// Get a human-readable name for the format.
    pub const fn name(&self) -> &'static str {
        match self {
            ContainerFormat::Tiff => "TIFF",
            ContainerFormat::Jpeg => "JPEG",
        }
    }

    /// Guess the container from a file extension (case-insensitive).
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "tif" | "tiff" => Some(ContainerFormat::Tiff),
            "jpg" | "jpeg" | "jpe" => Some(ContainerFormat::Jpeg),
            _ => None,
        }
    }
}

/// Bytes needed to tell the containers apart.
const MIN_HEADER_BYTES: usize = 4;

/// Check if bytes start with a TIFF or BigTIFF header.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < MIN_HEADER_BYTES {
        return false;
    }
    matches!(
        (&bytes[0..2], bytes[2], bytes[3]),
        (b"II", 42 | 43, 0) | (b"MM", 0, 42 | 43)
    )
}

/// Check if bytes start with a JPEG SOI followed by a marker.
pub fn is_jpeg_header(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF
}

/// Detect the container of an in-memory file prefix.
pub fn detect_bytes(bytes: &[u8]) -> Result<ContainerFormat, FormatError> {
    if is_tiff_header(bytes) {
        Ok(ContainerFormat::Tiff)
    } else if is_jpeg_header(bytes) {
        Ok(ContainerFormat::Jpeg)
    } else {
        Err(FormatError::UnsupportedFormat {
            reason: "not a TIFF or JPEG file".to_string(),
        })
    }
}

/// Detect the container of the file at `path` from its first bytes.
///
/// # Errors
/// Returns an I/O error if the file cannot be read, or
/// `FormatError::UnsupportedFormat` for unknown magic.
pub fn detect_format(path: &Path) -> Result<ContainerFormat, CodecError> {
    let mut head = Vec::with_capacity(MIN_HEADER_BYTES);
    File::open(path)?
        .take(MIN_HEADER_BYTES as u64)
        .read_to_end(&mut head)?;
    Ok(detect_bytes(&head)?)
}

// =============================================================================
// Tests
// =============================================================================
