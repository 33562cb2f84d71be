//! EXIF directory model and its binary encoding.
//!
//! An [`ExifDirectory`] is the EXIF sub-IFD (the target of tag 0x8769) with
//! optional GPS and Interoperability directories. It is encoded as a
//! self-contained block in which every offset is `base + position in block`:
//!
//! ```text
//! [EXIF IFD + values][Interop IFD + values][GPS IFD + values]
//! ```
//!
//! The Interop pointer lives in the EXIF IFD. The GPS pointer (0x8825)
//! belongs to IFD0, so the block only reports where the GPS directory
//! starts and the caller writes the pointer into its own IFD0.
//!
//! TIFF export encodes with `base = 0` and lets the EXIF patch add the block
//! position once the file is closed. JPEG export wraps the block in a TIFF
//! header and an IFD0 inside an APP1 segment, where the final position is
//! known up front.

use std::collections::BTreeMap;
use std::io::Cursor;

use serde::Serialize;
use tracing::debug;

use crate::error::{CodecError, CorruptDataError, TiffError};
use crate::format::jpeg::MAX_SEGMENT_PAYLOAD;
use crate::format::tiff::{
    ByteOrder, FieldType, Ifd, IfdBuilder, IfdEntry, TiffHeader, TiffTag, ValueReader,
};
use crate::io::RandomRead;

use super::{Resolution, ResolutionUnit, TextField};

/// Identifier that opens an EXIF APP1 payload.
pub const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

/// Nesting limit when reading sub-IFDs.
const MAX_DEPTH: usize = 4;

// =============================================================================
// ExifValue
// =============================================================================

/// A typed EXIF field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExifValue {
    Byte(Vec<u8>),
    Ascii(String),
    Short(Vec<u16>),
    Long(Vec<u32>),
    Rational(Vec<(u32, u32)>),
    SByte(Vec<i8>),
    Undefined(Vec<u8>),
    SShort(Vec<i16>),
    SLong(Vec<i32>),
    SRational(Vec<(i32, i32)>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl ExifValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            ExifValue::Byte(_) => FieldType::Byte,
            ExifValue::Ascii(_) => FieldType::Ascii,
            ExifValue::Short(_) => FieldType::Short,
            ExifValue::Long(_) => FieldType::Long,
            ExifValue::Rational(_) => FieldType::Rational,
            ExifValue::SByte(_) => FieldType::SByte,
            ExifValue::Undefined(_) => FieldType::Undefined,
            ExifValue::SShort(_) => FieldType::SShort,
            ExifValue::SLong(_) => FieldType::SLong,
            ExifValue::SRational(_) => FieldType::SRational,
            ExifValue::Float(_) => FieldType::Float,
            ExifValue::Double(_) => FieldType::Double,
        }
    }

    /// Value count as stored in the entry. ASCII counts the NUL.
    pub fn count(&self) -> u32 {
        let n = match self {
            ExifValue::Byte(v) | ExifValue::Undefined(v) => v.len(),
            ExifValue::Ascii(s) => s.len() + 1,
            ExifValue::Short(v) => v.len(),
            ExifValue::Long(v) => v.len(),
            ExifValue::Rational(v) => v.len(),
            ExifValue::SByte(v) => v.len(),
            ExifValue::SShort(v) => v.len(),
            ExifValue::SLong(v) => v.len(),
            ExifValue::SRational(v) => v.len(),
            ExifValue::Float(v) => v.len(),
            ExifValue::Double(v) => v.len(),
        };
        n as u32
    }

    /// Encode in `order`.
    pub fn to_bytes(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ExifValue::Byte(v) | ExifValue::Undefined(v) => out.extend_from_slice(v),
            ExifValue::Ascii(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            ExifValue::Short(v) => v.iter().for_each(|&x| order.put_u16(&mut out, x)),
            ExifValue::Long(v) => v.iter().for_each(|&x| order.put_u32(&mut out, x)),
            ExifValue::Rational(v) => v.iter().for_each(|&(n, d)| {
                order.put_u32(&mut out, n);
                order.put_u32(&mut out, d);
            }),
            ExifValue::SByte(v) => out.extend(v.iter().map(|&x| x as u8)),
            ExifValue::SShort(v) => v.iter().for_each(|&x| order.put_u16(&mut out, x as u16)),
            ExifValue::SLong(v) => v.iter().for_each(|&x| order.put_u32(&mut out, x as u32)),
            ExifValue::SRational(v) => v.iter().for_each(|&(n, d)| {
                order.put_u32(&mut out, n as u32);
                order.put_u32(&mut out, d as u32);
            }),
            ExifValue::Float(v) => v.iter().for_each(|&x| order.put_u32(&mut out, x.to_bits())),
            ExifValue::Double(v) => v.iter().for_each(|&x| {
                let bits = x.to_bits();
                let (hi, lo) = ((bits >> 32) as u32, bits as u32);
                match order {
                    ByteOrder::LittleEndian => {
                        order.put_u32(&mut out, lo);
                        order.put_u32(&mut out, hi);
                    }
                    ByteOrder::BigEndian => {
                        order.put_u32(&mut out, hi);
                        order.put_u32(&mut out, lo);
                    }
                }
            }),
        }
        out
    }

    /// Decode `count` values of `field_type` from `bytes`.
    ///
    /// Returns `None` for 64-bit integer types and short input.
    pub fn from_bytes(
        field_type: FieldType,
        count: usize,
        bytes: &[u8],
        order: ByteOrder,
    ) -> Option<Self> {
        let width = field_type.size_in_bytes();
        if bytes.len() < count.checked_mul(width)? {
            return None;
        }
        let items = || bytes.chunks_exact(width).take(count);
        Some(match field_type {
            FieldType::Byte => ExifValue::Byte(bytes[..count].to_vec()),
            FieldType::Undefined => ExifValue::Undefined(bytes[..count].to_vec()),
            FieldType::Ascii => {
                let raw = &bytes[..count];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                ExifValue::Ascii(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
            FieldType::Short => ExifValue::Short(items().map(|c| order.read_u16(c)).collect()),
            FieldType::Long => ExifValue::Long(items().map(|c| order.read_u32(c)).collect()),
            FieldType::Rational => ExifValue::Rational(
                items()
                    .map(|c| (order.read_u32(c), order.read_u32(&c[4..])))
                    .collect(),
            ),
            FieldType::SByte => ExifValue::SByte(bytes[..count].iter().map(|&b| b as i8).collect()),
            FieldType::SShort => {
                ExifValue::SShort(items().map(|c| order.read_u16(c) as i16).collect())
            }
            FieldType::SLong => ExifValue::SLong(items().map(|c| order.read_u32(c) as i32).collect()),
            FieldType::SRational => ExifValue::SRational(
                items()
                    .map(|c| (order.read_u32(c) as i32, order.read_u32(&c[4..]) as i32))
                    .collect(),
            ),
            FieldType::Float => {
                ExifValue::Float(items().map(|c| f32::from_bits(order.read_u32(c))).collect())
            }
            FieldType::Double => {
                ExifValue::Double(items().map(|c| f64::from_bits(order.read_u64(c))).collect())
            }
            FieldType::Ifd | FieldType::Long8 | FieldType::SLong8 | FieldType::Ifd8 => {
                return None
            }
        })
    }
}

// =============================================================================
// ExifDirectory
// =============================================================================

/// An encoded [`ExifDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExifBlock {
    pub data: Vec<u8>,

    /// Value for the IFD0 GPS pointer, when there is a GPS directory
    pub gps_offset: Option<u32>,
}

fn to_pointer(offset: u64) -> Result<u32, TiffError> {
    u32::try_from(offset).map_err(|_| TiffError::InvalidIfdOffset(offset))
}

/// Contents of the EXIF sub-IFD.
///
/// Sub-IFD pointer tags are never stored in `entries`; they are derived from
/// `gps` and `interop` when encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExifDirectory {
    pub entries: BTreeMap<u16, ExifValue>,
    pub gps: Option<Box<ExifDirectory>>,
    pub interop: Option<Box<ExifDirectory>>,
}

impl ExifDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. Sub-IFD pointer tags are ignored.
    pub fn insert(&mut self, tag: u16, value: ExifValue) -> &mut Self {
        if !TiffTag::is_sub_ifd_pointer(tag) {
            self.entries.insert(tag, value);
        }
        self
    }

    pub fn get(&self, tag: u16) -> Option<&ExifValue> {
        self.entries.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.gps.is_none() && self.interop.is_none()
    }

    /// Encode as a block whose first directory sits at `base`.
    ///
    /// # Errors
    /// Returns `InvalidIfdOffset` if an offset would exceed 32 bits.
    pub fn encode_block(&self, order: ByteOrder, base: u64) -> Result<ExifBlock, TiffError> {
        let mut data = self.encode_directory(order, base)?;
        let gps_offset = match self.gps.as_deref() {
            Some(gps) => {
                let at = base + data.len() as u64;
                data.extend_from_slice(&gps.encode_directory(order, at)?);
                Some(to_pointer(at)?)
            }
            None => None,
        };
        Ok(ExifBlock { data, gps_offset })
    }

    /// This directory's entries followed by its Interop directory, if any.
    fn encode_directory(&self, order: ByteOrder, base: u64) -> Result<Vec<u8>, TiffError> {
        let mut builder = IfdBuilder::new(order);
        for (&tag, value) in &self.entries {
            builder.set_raw(tag, value.field_type(), value.count(), value.to_bytes(order));
        }
        let Some(interop) = self.interop.as_deref() else {
            return builder.encode(base, 0);
        };

        // The pointer is an inline Long, so its value does not change the
        // directory size.
        builder.set_longs(TiffTag::InteropIfd.as_u16(), &[0]);
        let at = base + builder.encoded_len() as u64;
        builder.set_longs(TiffTag::InteropIfd.as_u16(), &[to_pointer(at)?]);
        let mut block = builder.encode(base, 0)?;
        block.extend_from_slice(&interop.encode_directory(order, at)?);
        Ok(block)
    }

    /// Read the GPS directory at `offset` and attach it.
    ///
    /// Offsets are absolute positions in `reader`.
    pub fn read_gps<R: RandomRead>(
        &mut self,
        reader: &mut R,
        header: &TiffHeader,
        offset: u64,
    ) -> Result<(), CodecError> {
        self.gps = Some(Box::new(Self::read_nested(reader, header, offset, 1)?));
        Ok(())
    }

    /// Read the directory at `offset` and its nested GPS/Interop directories.
    ///
    /// Offsets are absolute positions in `reader`. Entries with unknown or
    /// 64-bit types are skipped.
    pub fn read<R: RandomRead>(
        reader: &mut R,
        header: &TiffHeader,
        offset: u64,
    ) -> Result<Self, CodecError> {
        Self::read_nested(reader, header, offset, 0)
    }

    fn read_nested<R: RandomRead>(
        reader: &mut R,
        header: &TiffHeader,
        offset: u64,
        depth: usize,
    ) -> Result<Self, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CorruptDataError::Metadata("EXIF sub-IFDs nested too deep".into()).into());
        }
        let ifd = Ifd::read(reader, header, offset)?;
        let mut dir = ExifDirectory::new();

        for entry in &ifd.entries {
            match TiffTag::from_u16(entry.tag_id) {
                Some(TiffTag::GpsIfd) | Some(TiffTag::InteropIfd) => {
                    let at = ValueReader::new(reader, header).read_u32(entry)? as u64;
                    let child = Box::new(Self::read_nested(reader, header, at, depth + 1)?);
                    if entry.tag_id == TiffTag::GpsIfd.as_u16() {
                        dir.gps = Some(child);
                    } else {
                        dir.interop = Some(child);
                    }
                }
                Some(TiffTag::ExifIfd) => {}
                _ => {
                    if let Some(value) = read_value(reader, header, entry)? {
                        dir.entries.insert(entry.tag_id, value);
                    }
                }
            }
        }

        Ok(dir)
    }
}

fn read_value<R: RandomRead>(
    reader: &mut R,
    header: &TiffHeader,
    entry: &IfdEntry,
) -> Result<Option<ExifValue>, CodecError> {
    let Some(field_type) = entry.field_type else {
        debug!(tag = entry.tag_id, raw_type = entry.field_type_raw, "skipping EXIF entry of unknown type");
        return Ok(None);
    };
    let bytes = ValueReader::new(reader, header).read_bytes(entry)?;
    Ok(ExifValue::from_bytes(
        field_type,
        entry.count as usize,
        &bytes,
        header.byte_order,
    ))
}

// =============================================================================
// JPEG APP1 framing
// =============================================================================

/// What the EXIF APP1 segment of a JPEG carries: IFD0 text and resolution
/// fields plus the EXIF sub-IFD.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JpegExif {
    pub exif: Option<ExifDirectory>,
    pub text: BTreeMap<TextField, String>,
    pub resolution: Option<Resolution>,
}

impl JpegExif {
    pub fn is_empty(&self) -> bool {
        self.exif.as_ref().map_or(true, ExifDirectory::is_empty)
            && self.text.is_empty()
            && self.resolution.is_none()
    }
}

/// Build the APP1 payload: `Exif\0\0`, a TIFF header, IFD0, then the EXIF
/// block at its final position.
///
/// Returns `Ok(None)` when there is nothing to write.
///
/// # Errors
/// Returns `Metadata` if the payload does not fit in one segment.
pub fn encode_jpeg_exif(
    contents: &JpegExif,
    order: ByteOrder,
) -> Result<Option<Vec<u8>>, CorruptDataError> {
    if contents.is_empty() {
        return Ok(None);
    }

    let mut ifd0 = IfdBuilder::new(order);
    for (field, value) in &contents.text {
        ifd0.set_ascii(field.tag().as_u16(), value);
    }
    if let Some(res) = contents.resolution {
        ifd0.set_rationals(TiffTag::XResolution.as_u16(), &[Resolution::to_rational(res.x)]);
        ifd0.set_rationals(TiffTag::YResolution.as_u16(), &[Resolution::to_rational(res.y)]);
        ifd0.set_shorts(TiffTag::ResolutionUnit.as_u16(), &[res.unit.as_u16()]);
    }
    let exif = contents.exif.as_ref().filter(|e| !e.is_empty());
    if let Some(dir) = exif {
        ifd0.set_longs(TiffTag::ExifIfd.as_u16(), &[0]);
        if dir.gps.is_some() {
            ifd0.set_longs(TiffTag::GpsIfd.as_u16(), &[0]);
        }
    }

    const IFD0_OFFSET: u64 = 8;
    let block_at = IFD0_OFFSET + ifd0.encoded_len() as u64;
    let block = match exif {
        Some(dir) => {
            let block = dir.encode_block(order, block_at)?;
            ifd0.set_longs(TiffTag::ExifIfd.as_u16(), &[to_pointer(block_at)?]);
            if let Some(gps_at) = block.gps_offset {
                ifd0.set_longs(TiffTag::GpsIfd.as_u16(), &[gps_at]);
            }
            block.data
        }
        None => Vec::new(),
    };

    let mut payload = EXIF_HEADER.to_vec();
    payload.extend_from_slice(&TiffHeader::encode_classic(order, IFD0_OFFSET as u32));
    payload.extend_from_slice(&ifd0.encode(IFD0_OFFSET, 0)?);
    payload.extend_from_slice(&block);

    if payload.len() > MAX_SEGMENT_PAYLOAD {
        return Err(CorruptDataError::Metadata(format!(
            "EXIF block of {} bytes does not fit in one APP1 segment",
            payload.len()
        )));
    }
    Ok(Some(payload))
}

/// Parse an APP1 payload produced by [`encode_jpeg_exif`] or a camera.
pub fn decode_jpeg_exif(payload: &[u8]) -> Result<JpegExif, CodecError> {
    let tiff = payload
        .strip_prefix(EXIF_HEADER.as_slice())
        .ok_or_else(|| CorruptDataError::Metadata("APP1 payload is not EXIF".into()))?;
    let mut cursor = Cursor::new(tiff);
    let header = TiffHeader::read(&mut cursor)?;
    let ifd0 = Ifd::read(&mut cursor, &header, header.first_ifd_offset)?;

    let mut contents = JpegExif::default();
    let mut gps_at = None;
    let mut x_res = None;
    let mut y_res = None;
    let mut unit = ResolutionUnit::Inch;

    for entry in &ifd0.entries {
        if let Some(field) = TextField::from_tag(entry.tag_id) {
            if entry.field_type == Some(FieldType::Ascii) {
                let text = ValueReader::new(&mut cursor, &header).read_string(entry)?;
                contents.text.insert(field, text);
            }
            continue;
        }
        match TiffTag::from_u16(entry.tag_id) {
            Some(TiffTag::ExifIfd) => {
                let at = ValueReader::new(&mut cursor, &header).read_u32(entry)? as u64;
                contents.exif = Some(ExifDirectory::read(&mut cursor, &header, at)?);
            }
            Some(TiffTag::GpsIfd) => {
                gps_at = Some(ValueReader::new(&mut cursor, &header).read_u32(entry)? as u64);
            }
            Some(TiffTag::XResolution) => {
                x_res = Some(ValueReader::new(&mut cursor, &header).read_rational(entry)?)
            }
            Some(TiffTag::YResolution) => {
                y_res = Some(ValueReader::new(&mut cursor, &header).read_rational(entry)?)
            }
            Some(TiffTag::ResolutionUnit) => {
                unit = ResolutionUnit::from_u16(
                    ValueReader::new(&mut cursor, &header).read_u32(entry)? as u16,
                )
            }
            _ => {}
        }
    }

    if let Some(at) = gps_at {
        contents
            .exif
            .get_or_insert_with(ExifDirectory::new)
            .read_gps(&mut cursor, &header, at)?;
    }
    if let (Some(x), Some(y)) = (x_res, y_res) {
        contents.resolution = Some(Resolution { x, y, unit });
    }
    Ok(contents)
}

// =============================================================================
// Tests
// =============================================================================
