//! TIFF structures shared by the reader, the writer and the EXIF codec.
//!
//! # Key Concepts
//!
//! - **Byte order**: TIFF files declare their endianness (II = little-endian, MM = big-endian)
//!   in the header. All multi-byte values, 16-bit samples included, follow it.
//!
//! - **Classic TIFF vs BigTIFF**: classic TIFF uses 32-bit offsets, BigTIFF 64-bit ones.
//!   Both can be read; the writer produces classic TIFF.
//!
//! - **IFD (Image File Directory)**: tagged entries describing one image. Some entries
//!   point at nested directories (EXIF, GPS, Interoperability).
//!
//! - **Inline vs offset values**: values of at most 4 bytes (8 in BigTIFF) live in the
//!   entry itself, larger ones at an offset the entry points to.

mod compression;
mod encoder;
mod exif_patch;
mod parser;
mod tags;
mod values;

pub use compression::{compress, decompress};
pub use encoder::{IfdBuilder, IfdField};
pub use exif_patch::{patch_exif_pointer, PatchReport};
pub use parser::{ByteOrder, Ifd, IfdEntry, TiffHeader, BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE};
pub use tags::{
    Compression, ExtraSamples, FieldType, Photometric, PlanarConfig, SampleFormat, TiffTag,
};
pub use values::{parse_u64_array, ValueReader};
