//! Strip and tile payload compression.
//!
//! Deflate goes through `miniz_oxide`; PackBits is small enough to carry here.
//! Output never grows past the expected strip/tile size. A short result is
//! not an error here: the reader compares it against the expected size and
//! reports a short read.

use miniz_oxide::deflate::compress_to_vec_zlib;
use miniz_oxide::inflate::{decompress_to_vec_zlib_with_limit, TINFLStatus};

use crate::error::{CorruptDataError, TiffError};

use super::tags::Compression;

/// zlib level used for Deflate output.
const DEFLATE_LEVEL: u8 = 6;

/// Decompress one strip or tile payload.
///
/// # Errors
/// - `UnsupportedCompression` for schemes other than None, Deflate and PackBits
/// - `Compressed` when the payload is malformed or a Deflate stream inflates
///   past `expected_size`
pub fn decompress(
    compression: Compression,
    data: &[u8],
    expected_size: usize,
) -> Result<Vec<u8>, CorruptDataError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate | Compression::AdobeDeflate => {
            decompress_to_vec_zlib_with_limit(data, expected_size).map_err(|e| match e.status {
                TINFLStatus::HasMoreOutput => CorruptDataError::Compressed(format!(
                    "deflate: output exceeds {} bytes",
                    expected_size
                )),
                status => CorruptDataError::Compressed(format!("deflate: {:?}", status)),
            })
        }
        Compression::PackBits => unpack_bits(data, expected_size),
        other => Err(TiffError::UnsupportedCompression(other.name().to_string()).into()),
    }
}

/// Compress one strip or tile payload.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, CorruptDataError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate | Compression::AdobeDeflate => {
            Ok(compress_to_vec_zlib(data, DEFLATE_LEVEL))
        }
        Compression::PackBits => Ok(pack_bits(data)),
        other => Err(TiffError::UnsupportedCompression(other.name().to_string()).into()),
    }
}

// =============================================================================
// PackBits
// =============================================================================

/// Decode PackBits runs until `expected_size` bytes are produced or the
/// input ends.
fn unpack_bits(data: &[u8], expected_size: usize) -> Result<Vec<u8>, CorruptDataError> {
    let truncated = || CorruptDataError::Compressed("packbits: unexpected end of data".into());
    let mut out = Vec::with_capacity(expected_size);
    let mut i = 0;

    while i < data.len() && out.len() < expected_size {
        let header = data[i] as i8;
        i += 1;
        match header {
            0..=127 => {
                let count = header as usize + 1;
                let literal = data.get(i..i + count).ok_or_else(truncated)?;
                out.extend_from_slice(literal);
                i += count;
            }
            // No-op byte.
            -128 => {}
            _ => {
                let count = (-(header as isize)) as usize + 1;
                let value = *data.get(i).ok_or_else(truncated)?;
                i += 1;
                out.resize(out.len() + count, value);
            }
        }
    }

    Ok(out)
}

/// Encode with PackBits: runs of 3 or more identical bytes become repeat
/// packets, everything else is emitted as literals of at most 128 bytes.
fn pack_bits(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 128 + 1);
    let mut literal_start = 0;
    let mut i = 0;

    let flush_literal = |out: &mut Vec<u8>, from: usize, to: usize| {
        for chunk in data[from..to].chunks(128) {
            out.push((chunk.len() - 1) as u8);
            out.extend_from_slice(chunk);
        }
    };

    while i < data.len() {
        let mut run = 1;
        while i + run < data.len() && run < 128 && data[i + run] == data[i] {
            run += 1;
        }

        if run >= 3 {
            flush_literal(&mut out, literal_start, i);
            out.push((1i16 - run as i16) as i8 as u8);
            out.push(data[i]);
            i += run;
            literal_start = i;
        } else {
            i += run;
        }
    }
    flush_literal(&mut out, literal_start, data.len());

    out
}
