//! Container formats: TIFF structures, JPEG marker streams and detection.
//!
//! Use [`detect::detect_format`] to identify a file before opening it.

pub mod detect;
pub mod jpeg;
pub mod tiff;

pub use detect::{detect_bytes, detect_format, is_jpeg_header, is_tiff_header, ContainerFormat};
