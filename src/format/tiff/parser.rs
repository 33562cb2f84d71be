//! TIFF header and directory parsing.
//!
//! This module handles the fixed-layout parts of a TIFF file: the header,
//! which fixes byte order and offset width, and the Image File Directories
//! whose entries describe every field of an image.
//!
//! # TIFF Header Structure
//!
//! ## Classic TIFF (8 bytes)
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! ## BigTIFF (16 bytes)
//! ```text
//! Bytes 0-1: Byte order
//! Bytes 2-3: Version (43 = 0x002B)
//! Bytes 4-5: Offset byte size (must be 8)
//! Bytes 6-7: Reserved (must be 0)
//! Bytes 8-15: Offset to first IFD (8 bytes)
//! ```
//!
//! # IFD Structure
//! ```text
//! count   : u16 (u64 in BigTIFF)
//! entries : count x { tag u16, type u16, count u32|u64, value/offset u32|u64 }
//! next    : u32 (u64 in BigTIFF), 0 for the last directory
//! ```

use std::collections::HashSet;

use crate::error::{CodecError, TiffError};
use crate::io::RandomRead;

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
const VERSION_TIFF: u16 = 42;

/// Version number for BigTIFF
const VERSION_BIGTIFF: u16 = 43;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of BigTIFF header in bytes
pub const BIGTIFF_HEADER_SIZE: usize = 16;

/// Upper bound on the directories followed in one chain.
const MAX_IFD_CHAIN: usize = 64;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
///
/// TIFF files declare their byte order in the first two bytes of the header.
/// All multi-byte values in the file are read and written in this order,
/// including 16-bit pixel samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    #[default]
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from the start of a byte slice.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 2 bytes.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(raw),
            ByteOrder::BigEndian => u16::from_be_bytes(raw),
        }
    }

    /// Read a u32 from the start of a byte slice.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 4 bytes.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
        }
    }

    /// Read a u64 from the start of a byte slice.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 8 bytes.
    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        match self {
            ByteOrder::LittleEndian => u64::from_le_bytes(raw),
            ByteOrder::BigEndian => u64::from_be_bytes(raw),
        }
    }

    #[inline]
    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::LittleEndian => value.to_le_bytes(),
            ByteOrder::BigEndian => value.to_be_bytes(),
        }
    }

    #[inline]
    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::LittleEndian => value.to_le_bytes(),
            ByteOrder::BigEndian => value.to_be_bytes(),
        }
    }

    /// Append a u16 to `out` in this byte order.
    #[inline]
    pub fn put_u16(self, out: &mut Vec<u8>, value: u16) {
        out.extend_from_slice(&self.u16_bytes(value));
    }

    /// Append a u32 to `out` in this byte order.
    #[inline]
    pub fn put_u32(self, out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&self.u32_bytes(value));
    }

    /// The two magic bytes that open a file in this order.
    pub const fn magic(self) -> [u8; 2] {
        match self {
            ByteOrder::LittleEndian => *b"II",
            ByteOrder::BigEndian => *b"MM",
        }
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed TIFF file header.
///
/// Contains the essential information needed to begin parsing IFDs:
/// - Byte order for reading all subsequent values
/// - Whether this is classic TIFF or BigTIFF (affects entry sizes and offset widths)
/// - Location of the first IFD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Whether this is a BigTIFF file (64-bit offsets)
    pub is_bigtiff: bool,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from raw bytes.
    ///
    /// # Arguments
    /// * `bytes` - Raw header bytes (at least 8, 16 for BigTIFF)
    /// * `file_size` - Total file size (used to validate the IFD offset)
    ///
    /// # Errors
    /// - `InvalidMagic` if byte order bytes are not II or MM
    /// - `InvalidVersion` if version is not 42 or 43
    /// - `InvalidBigTiffOffsetSize` if BigTIFF offset size is not 8
    /// - `FileTooSmall` if there aren't enough bytes for the header
    /// - `InvalidIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        // The magic is a byte pattern, so read it in a fixed order.
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        let (is_bigtiff, first_ifd_offset) = match version {
            VERSION_TIFF => (false, byte_order.read_u32(&bytes[4..8]) as u64),
            VERSION_BIGTIFF => {
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(TiffError::FileTooSmall {
                        required: BIGTIFF_HEADER_SIZE as u64,
                        actual: bytes.len() as u64,
                    });
                }
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::InvalidBigTiffOffsetSize(offset_size));
                }
                (true, byte_order.read_u64(&bytes[8..16]))
            }
            _ => return Err(TiffError::InvalidVersion(version)),
        };

        if first_ifd_offset >= file_size {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(TiffHeader {
            byte_order,
            is_bigtiff,
            first_ifd_offset,
        })
    }

    /// Read and parse the header at the start of `reader`.
    pub fn read<R: RandomRead>(reader: &mut R) -> Result<Self, CodecError> {
        let size = reader.size()?;
        let len = BIGTIFF_HEADER_SIZE.min(size as usize);
        let bytes = reader.read_exact_at(0, len)?;
        Ok(Self::parse(&bytes, size)?)
    }

    /// Encode a classic TIFF header pointing at `first_ifd_offset`.
    pub fn encode_classic(byte_order: ByteOrder, first_ifd_offset: u32) -> [u8; TIFF_HEADER_SIZE] {
        let mut out = [0u8; TIFF_HEADER_SIZE];
        out[..2].copy_from_slice(&byte_order.magic());
        out[2..4].copy_from_slice(&byte_order.u16_bytes(VERSION_TIFF));
        out[4..8].copy_from_slice(&byte_order.u32_bytes(first_ifd_offset));
        out
    }

    /// Size of an IFD entry in bytes (12 classic, 20 BigTIFF).
    #[inline]
    pub const fn ifd_entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    /// Size of the entry count field at the start of an IFD.
    #[inline]
    pub const fn ifd_count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    /// Size of the next IFD offset field at the end of an IFD.
    #[inline]
    pub const fn ifd_next_offset_size(&self) -> usize {
        self.value_offset_size()
    }

    /// Size of the value/offset field in an IFD entry.
    #[inline]
    pub const fn value_offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// One 12-byte (or 20-byte BigTIFF) directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    /// Numeric tag ID
    pub tag_id: u16,

    /// Decoded field type, `None` if the raw type is unknown
    pub field_type: Option<FieldType>,

    /// Raw field type as stored
    pub field_type_raw: u16,

    /// Number of values
    pub count: u64,

    /// The raw value/offset field, zero-padded to 8 bytes
    pub value_offset_bytes: [u8; 8],

    /// Whether the value is stored in `value_offset_bytes` itself
    pub is_inline: bool,
}

impl IfdEntry {
    /// Known tag for this entry, if any.
    #[inline]
    pub fn tag(&self) -> Option<TiffTag> {
        TiffTag::from_u16(self.tag_id)
    }

    /// Total byte size of the entry's value, `None` for unknown types.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type
            .and_then(|ty| (ty.size_in_bytes() as u64).checked_mul(self.count))
    }

    /// Interpret the value field as an offset.
    pub fn value_offset(&self, byte_order: ByteOrder, is_bigtiff: bool) -> u64 {
        if is_bigtiff {
            byte_order.read_u64(&self.value_offset_bytes)
        } else {
            byte_order.read_u32(&self.value_offset_bytes) as u64
        }
    }

    /// A single inline Short or Long value.
    pub fn inline_u32(&self, byte_order: ByteOrder) -> Option<u32> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes) as u32),
            FieldType::Long | FieldType::Ifd => Some(byte_order.read_u32(&self.value_offset_bytes)),
            _ => None,
        }
    }

    /// A single inline Short, Long or Long8 value.
    pub fn inline_u64(&self, byte_order: ByteOrder) -> Option<u64> {
        match self.field_type? {
            FieldType::Long8 | FieldType::Ifd8 if self.is_inline && self.count == 1 => {
                Some(byte_order.read_u64(&self.value_offset_bytes))
            }
            _ => self.inline_u32(byte_order).map(u64::from),
        }
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifd {
    /// File offset the directory was read from
    pub offset: u64,

    /// Entries in file order
    pub entries: Vec<IfdEntry>,

    /// Offset of the next directory, 0 if this is the last one
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// Total byte size of a directory with `entry_count` entries.
    pub fn calculate_size(entry_count: u64, header: &TiffHeader) -> usize {
        header.ifd_count_size()
            + entry_count as usize * header.ifd_entry_size()
            + header.ifd_next_offset_size()
    }

    /// Parse a directory from bytes starting at its entry count.
    ///
    /// # Arguments
    /// * `bytes` - The whole directory as returned by [`Ifd::calculate_size`]
    /// * `header` - File header, for byte order and entry width
    /// * `offset` - File offset the bytes were read from
    pub fn parse(bytes: &[u8], header: &TiffHeader, offset: u64) -> Result<Self, TiffError> {
        let order = header.byte_order;
        let count_size = header.ifd_count_size();
        if bytes.len() < count_size {
            return Err(TiffError::InvalidIfdOffset(offset));
        }

        let entry_count = if header.is_bigtiff {
            order.read_u64(bytes)
        } else {
            order.read_u16(bytes) as u64
        };
        let size = Self::calculate_size(entry_count, header);
        if bytes.len() < size {
            return Err(TiffError::InvalidTagValue {
                tag: "IFD",
                message: format!(
                    "directory at {} declares {} entries but only {} bytes are available",
                    offset,
                    entry_count,
                    bytes.len()
                ),
            });
        }

        let entry_size = header.ifd_entry_size();
        let value_size = header.value_offset_size();
        let mut entries = Vec::with_capacity(entry_count as usize);
        for i in 0..entry_count as usize {
            let raw = &bytes[count_size + i * entry_size..count_size + (i + 1) * entry_size];
            let tag_id = order.read_u16(&raw[0..2]);
            let field_type_raw = order.read_u16(&raw[2..4]);
            let field_type = FieldType::from_u16(field_type_raw);
            let (count, value_start) = if header.is_bigtiff {
                (order.read_u64(&raw[4..12]), 12)
            } else {
                (order.read_u32(&raw[4..8]) as u64, 8)
            };

            let mut value_offset_bytes = [0u8; 8];
            value_offset_bytes[..value_size]
                .copy_from_slice(&raw[value_start..value_start + value_size]);

            let is_inline = field_type.map_or(false, |ty| ty.fits_inline(count, header.is_bigtiff));

            entries.push(IfdEntry {
                tag_id,
                field_type,
                field_type_raw,
                count,
                value_offset_bytes,
                is_inline,
            });
        }

        let next_start = size - header.ifd_next_offset_size();
        let next_ifd_offset = if header.is_bigtiff {
            order.read_u64(&bytes[next_start..])
        } else {
            order.read_u32(&bytes[next_start..]) as u64
        };

        Ok(Ifd {
            offset,
            entries,
            next_ifd_offset,
        })
    }

    /// Read the directory at `offset`.
    pub fn read<R: RandomRead>(
        reader: &mut R,
        header: &TiffHeader,
        offset: u64,
    ) -> Result<Self, CodecError> {
        let file_size = reader.size()?;
        if offset + header.ifd_count_size() as u64 > file_size {
            return Err(TiffError::InvalidIfdOffset(offset).into());
        }

        let count_bytes = reader.read_exact_at(offset, header.ifd_count_size())?;
        let entry_count = if header.is_bigtiff {
            header.byte_order.read_u64(&count_bytes)
        } else {
            header.byte_order.read_u16(&count_bytes) as u64
        };

        let size = Self::calculate_size(entry_count, header);
        if offset + size as u64 > file_size {
            return Err(TiffError::InvalidIfdOffset(offset).into());
        }
        let bytes = reader.read_exact_at(offset, size)?;
        Ok(Self::parse(&bytes, header, offset)?)
    }

    /// Read every directory in the main chain, starting at the header's
    /// first IFD.
    ///
    /// # Errors
    /// Returns `InvalidIfdOffset` when the chain loops back on itself.
    pub fn read_chain<R: RandomRead>(
        reader: &mut R,
        header: &TiffHeader,
    ) -> Result<Vec<Self>, CodecError> {
        let mut seen = HashSet::new();
        let mut ifds = Vec::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 && ifds.len() < MAX_IFD_CHAIN {
            if !seen.insert(offset) {
                return Err(TiffError::InvalidIfdOffset(offset).into());
            }
            let ifd = Self::read(reader, header, offset)?;
            offset = ifd.next_ifd_offset;
            ifds.push(ifd);
        }

        Ok(ifds)
    }

    /// Find the entry for a known tag.
    pub fn get_entry(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.get_entry_by_id(tag.as_u16())
    }

    /// Find the entry for a raw tag ID.
    pub fn get_entry_by_id(&self, tag_id: u16) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag_id == tag_id)
    }

    /// Whether tag IDs appear in strictly ascending order.
    pub fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].tag_id < w[1].tag_id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // -------------------------------------------------------------------------
    // ByteOrder Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_byte_order_read() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(ByteOrder::LittleEndian.read_u16(&bytes), 0x0201);
        assert_eq!(ByteOrder::BigEndian.read_u16(&bytes), 0x0102);
        assert_eq!(ByteOrder::LittleEndian.read_u32(&bytes), 0x04030201);
        assert_eq!(ByteOrder::BigEndian.read_u32(&bytes), 0x01020304);
        assert_eq!(ByteOrder::BigEndian.read_u64(&bytes), 0x0102030405060708);
    }

    #[test]
    fn test_byte_order_write_matches_read() {
        for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
            let mut out = Vec::new();
            order.put_u16(&mut out, 0xBEEF);
            order.put_u32(&mut out, 0xDEADBEEF);
            assert_eq!(order.read_u16(&out), 0xBEEF);
            assert_eq!(order.read_u32(&out[2..]), 0xDEADBEEF);
        }
    }

    // -------------------------------------------------------------------------
    // TiffHeader Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_tiff_little_endian() {
        let header = [0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00];
        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::LittleEndian);
        assert!(!result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_tiff_big_endian() {
        let header = [0x4D, 0x4D, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x08];
        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert_eq!(result.byte_order, ByteOrder::BigEndian);
        assert_eq!(result.first_ifd_offset, 8);
    }

    #[test]
    fn test_parse_bigtiff() {
        let header = [
            0x49, 0x49, 0x2B, 0x00, 0x08, 0x00, 0x00, 0x00, //
            0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let result = TiffHeader::parse(&header, 1000).unwrap();
        assert!(result.is_bigtiff);
        assert_eq!(result.first_ifd_offset, 16);
        assert_eq!(result.ifd_entry_size(), 20);
    }

    #[test]
    fn test_parse_header_errors() {
        assert!(matches!(
            TiffHeader::parse(&[0x49, 0x49, 0x2A], 100),
            Err(TiffError::FileTooSmall { .. })
        ));
        assert!(matches!(
            TiffHeader::parse(&[0x12, 0x34, 0x2A, 0, 8, 0, 0, 0], 100),
            Err(TiffError::InvalidMagic(0x3412))
        ));
        assert!(matches!(
            TiffHeader::parse(&[0x49, 0x49, 0x2C, 0, 8, 0, 0, 0], 100),
            Err(TiffError::InvalidVersion(44))
        ));
        assert!(matches!(
            TiffHeader::parse(&[0x49, 0x49, 0x2A, 0, 200, 0, 0, 0], 100),
            Err(TiffError::InvalidIfdOffset(200))
        ));
    }

    #[test]
    fn test_encode_classic_round_trip() {
        for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
            let bytes = TiffHeader::encode_classic(order, 1234);
            let header = TiffHeader::parse(&bytes, 2000).unwrap();
            assert_eq!(header.byte_order, order);
            assert_eq!(header.first_ifd_offset, 1234);
        }
    }

    // -------------------------------------------------------------------------
    // Ifd Tests
    // -------------------------------------------------------------------------

    /// Two-entry little-endian directory at offset 8: ImageWidth=16 (Short)
    /// and an 8-byte Undefined value stored at offset 38.
    fn two_entry_file() -> Vec<u8> {
        let order = ByteOrder::LittleEndian;
        let mut out = TiffHeader::encode_classic(order, 8).to_vec();
        order.put_u16(&mut out, 2);

        order.put_u16(&mut out, 256);
        order.put_u16(&mut out, 3);
        order.put_u32(&mut out, 1);
        order.put_u16(&mut out, 16);
        order.put_u16(&mut out, 0);

        order.put_u16(&mut out, 34675);
        order.put_u16(&mut out, 7);
        order.put_u32(&mut out, 8);
        order.put_u32(&mut out, 38);

        order.put_u32(&mut out, 0);
        assert_eq!(out.len(), 38);
        out.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        out
    }

    #[test]
    fn test_read_ifd() {
        let mut cursor = Cursor::new(two_entry_file());
        let header = TiffHeader::read(&mut cursor).unwrap();
        let ifd = Ifd::read(&mut cursor, &header, header.first_ifd_offset).unwrap();

        assert_eq!(ifd.entries.len(), 2);
        assert_eq!(ifd.next_ifd_offset, 0);
        assert!(ifd.is_sorted());

        let width = ifd.get_entry(TiffTag::ImageWidth).unwrap();
        assert!(width.is_inline);
        assert_eq!(width.inline_u32(header.byte_order), Some(16));

        let icc = ifd.get_entry(TiffTag::IccProfile).unwrap();
        assert!(!icc.is_inline);
        assert_eq!(icc.value_byte_size(), Some(8));
        assert_eq!(icc.value_offset(header.byte_order, false), 38);
    }

    #[test]
    fn test_read_chain_detects_loop() {
        let mut bytes = two_entry_file();
        // Point the next-IFD field back at the directory itself.
        bytes[34..38].copy_from_slice(&8u32.to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        let header = TiffHeader::read(&mut cursor).unwrap();
        assert!(Ifd::read_chain(&mut cursor, &header).is_err());
    }

    #[test]
    fn test_truncated_ifd_is_rejected() {
        let mut bytes = two_entry_file();
        bytes.truncate(20);
        let mut cursor = Cursor::new(bytes);
        let header = TiffHeader::read(&mut cursor).unwrap();
        assert!(Ifd::read(&mut cursor, &header, 8).is_err());
    }
}
