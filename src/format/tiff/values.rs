//! TIFF tag value reading.
//!
//! Values can be stored either inline in the IFD entry (for small values)
//! or at an offset in the file (for larger values like arrays). The reader
//! hides that distinction behind typed accessors.

use bytes::Bytes;

use crate::error::{CodecError, TiffError};
use crate::io::RandomRead;

use super::parser::{ByteOrder, IfdEntry, TiffHeader};
use super::tags::FieldType;

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values from a TIFF file.
///
/// Combines a random-access source with TIFF header information so values
/// are read in the file's byte order and offset width.
pub struct ValueReader<'a, R: RandomRead> {
    reader: &'a mut R,
    header: &'a TiffHeader,
}

impl<'a, R: RandomRead> ValueReader<'a, R> {
    /// Create a new ValueReader.
    pub fn new(reader: &'a mut R, header: &'a TiffHeader) -> Self {
        Self { reader, header }
    }

    /// Get the byte order from the header.
    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Read raw bytes for an IFD entry's value.
    ///
    /// For inline values, returns the bytes from the entry.
    /// For offset values, reads the bytes from the file.
    pub fn read_bytes(&mut self, entry: &IfdEntry) -> Result<Bytes, CodecError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            return Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ));
        }

        let offset = entry.value_offset(self.header.byte_order, self.header.is_bigtiff);
        let file_size = self.reader.size()?;
        if offset.checked_add(size).map_or(true, |end| end > file_size) {
            return Err(TiffError::InvalidTagValue {
                tag: "value",
                message: format!(
                    "tag {} points at {} bytes at offset {}, past end of file ({})",
                    entry.tag_id, size, offset, file_size
                ),
            }
            .into());
        }
        Ok(Bytes::from(self.reader.read_exact_at(offset, size as usize)?))
    }

    /// Read a single unsigned value from an entry.
    ///
    /// Handles Short and Long field types.
    pub fn read_u32(&mut self, entry: &IfdEntry) -> Result<u32, CodecError> {
        if let Some(value) = entry.inline_u32(self.header.byte_order) {
            return Ok(value);
        }
        let values = self.read_u64_array(entry)?;
        match values.as_slice() {
            [value] => u32::try_from(*value).map_err(|_| {
                TiffError::InvalidTagValue {
                    tag: "value",
                    message: format!("tag {} value {} exceeds 32 bits", entry.tag_id, value),
                }
                .into()
            }),
            _ => Err(TiffError::InvalidTagValue {
                tag: "value",
                message: format!("tag {}: expected count 1, got {}", entry.tag_id, entry.count),
            }
            .into()),
        }
    }

    /// Read an array of unsigned values from an entry, widened to u64.
    ///
    /// This is the method used for strip and tile offsets and byte counts.
    pub fn read_u64_array(&mut self, entry: &IfdEntry) -> Result<Vec<u64>, CodecError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;
        if entry.count == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.read_bytes(entry)?;
        parse_u64_array(&bytes, entry.count as usize, field_type, self.header.byte_order)
            .ok_or_else(|| {
                TiffError::InvalidTagValue {
                    tag: "value",
                    message: format!(
                        "tag {}: expected an unsigned integer type, got {:?}",
                        entry.tag_id, field_type
                    ),
                }
                .into()
            })
    }

    /// Read an array of Short values.
    pub fn read_u16_array(&mut self, entry: &IfdEntry) -> Result<Vec<u16>, CodecError> {
        self.read_u64_array(entry)?
            .into_iter()
            .map(|v| {
                u16::try_from(v).map_err(|_| {
                    TiffError::InvalidTagValue {
                        tag: "value",
                        message: format!("tag {} value {} exceeds 16 bits", entry.tag_id, v),
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Read the first Rational of an entry as a float.
    pub fn read_rational(&mut self, entry: &IfdEntry) -> Result<f64, CodecError> {
        if entry.field_type != Some(FieldType::Rational) || entry.count == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: "value",
                message: format!("tag {}: expected Rational", entry.tag_id),
            }
            .into());
        }
        let bytes = self.read_bytes(entry)?;
        let order = self.header.byte_order;
        let num = order.read_u32(&bytes[0..4]);
        let den = order.read_u32(&bytes[4..8]);
        Ok(if den == 0 { 0.0 } else { num as f64 / den as f64 })
    }

    /// Read a string value from an entry (ASCII type).
    ///
    /// The string is expected to be null-terminated. The null terminator
    /// is stripped from the result.
    pub fn read_string(&mut self, entry: &IfdEntry) -> Result<String, CodecError> {
        if entry.field_type != Some(FieldType::Ascii) {
            return Err(TiffError::InvalidTagValue {
                tag: "value",
                message: format!(
                    "tag {}: expected Ascii type for string, got {:?}",
                    entry.tag_id, entry.field_type
                ),
            }
            .into());
        }

        let bytes = self.read_bytes(entry)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

// =============================================================================
// Convenience functions for reading from bytes directly
// =============================================================================

/// Parse an array of unsigned values from raw bytes.
///
/// Returns `None` if `field_type` is not an unsigned integer type or if
/// `bytes` is too short for `count` values.
pub fn parse_u64_array(
    bytes: &[u8],
    count: usize,
    field_type: FieldType,
    byte_order: ByteOrder,
) -> Option<Vec<u64>> {
    let width = field_type.size_in_bytes();
    if bytes.len() < count.checked_mul(width)? {
        return None;
    }

    let read: fn(ByteOrder, &[u8]) -> u64 = match field_type {
        FieldType::Byte | FieldType::Undefined => |_, b| b[0] as u64,
        FieldType::Short => |o, b| o.read_u16(b) as u64,
        FieldType::Long | FieldType::Ifd => |o, b| o.read_u32(b) as u64,
        FieldType::Long8 | FieldType::Ifd8 => |o, b| o.read_u64(b),
        _ => return None,
    };

    Some(
        bytes
            .chunks_exact(width)
            .take(count)
            .map(|chunk| read(byte_order, chunk))
            .collect(),
    )
}

// =============================================================================
// Tests
// =============================================================================
