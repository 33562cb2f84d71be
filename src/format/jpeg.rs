//! JPEG marker stream handling.
//!
//! The pixel codec (`jpeg-encoder` / `jpeg-decoder`) only sees entropy-coded
//! data; everything between SOI and the first SOS is handled here:
//! - walking the header segments and the frame header
//! - rebuilding an encoded stream with our own APPn segments
//! - the fixed-layout JFIF and Adobe APP14 payloads
//!
//! # Segment Layout
//! ```text
//! FF xx LL LL payload...     LL LL = payload length + 2, big-endian
//! ```
//! RSTn and TEM are standalone markers with no length.

use crate::error::CorruptDataError;

// =============================================================================
// JPEG Markers
// =============================================================================

/// Start Of Image
pub const SOI: u8 = 0xD8;

/// End Of Image
pub const EOI: u8 = 0xD9;

/// Start Of Scan
pub const SOS: u8 = 0xDA;

/// JFIF
pub const APP0: u8 = 0xE0;

/// EXIF and XMP
pub const APP1: u8 = 0xE1;

/// ICC profile chunks
pub const APP2: u8 = 0xE2;

/// Adobe EPS/PDF embed information
pub const APP12: u8 = 0xEC;

/// Photoshop resources (IPTC)
pub const APP13: u8 = 0xED;

/// Adobe color transform
pub const APP14: u8 = 0xEE;

/// Largest payload one segment can carry (length field minus itself).
pub const MAX_SEGMENT_PAYLOAD: usize = 0xFFFF - 2;

/// Adobe APP14 color transform: none (RGB or CMYK stored as-is)
pub const ADOBE_TRANSFORM_UNKNOWN: u8 = 0;

/// Adobe APP14 color transform: YCbCr
pub const ADOBE_TRANSFORM_YCBCR: u8 = 1;

/// Adobe APP14 color transform: YCCK
pub const ADOBE_TRANSFORM_YCCK: u8 = 2;

const ADOBE_IDENT: &[u8; 5] = b"Adobe";

const ADOBE_PAYLOAD_LEN: usize = 12;

const JFIF_IDENT: &[u8; 5] = b"JFIF\0";

#[inline]
fn is_app(marker: u8) -> bool {
    (0xE0..=0xEF).contains(&marker)
}

#[inline]
fn is_standalone(marker: u8) -> bool {
    matches!(marker, 0x01 | 0xD0..=0xD7)
}

#[inline]
fn is_sof(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

// =============================================================================
// Segments
// =============================================================================

/// One marker segment with its payload (length field excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub marker: u8,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(marker: u8, payload: Vec<u8>) -> Self {
        Self { marker, payload }
    }

    /// Whether the payload starts with `ident`.
    pub fn has_ident(&self, ident: &[u8]) -> bool {
        self.payload.starts_with(ident)
    }

    /// Append `FF marker length payload` to `out`.
    ///
    /// # Errors
    /// Returns `Jpeg` if the payload exceeds [`MAX_SEGMENT_PAYLOAD`].
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), CorruptDataError> {
        if self.payload.len() > MAX_SEGMENT_PAYLOAD {
            return Err(CorruptDataError::Jpeg(format!(
                "APP{:X} payload of {} bytes exceeds the segment limit",
                self.marker.wrapping_sub(APP0),
                self.payload.len()
            )));
        }
        out.extend_from_slice(&[0xFF, self.marker]);
        out.extend_from_slice(&((self.payload.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Frame header fields from the SOFn segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub marker: u8,
    pub precision: u8,
    pub height: u16,
    pub width: u16,
    pub components: u8,
}

/// Everything before the first scan.
#[derive(Debug, Clone)]
pub struct JpegHeader {
    /// Header segments in stream order, SOF included
    pub segments: Vec<Segment>,

    pub frame: FrameHeader,

    /// Byte position of the first SOS marker
    pub scan_offset: usize,
}

impl JpegHeader {
    /// APPn segments with `marker` whose payload starts with `ident`.
    pub fn app_segments<'a>(
        &'a self,
        marker: u8,
        ident: &'a [u8],
    ) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments
            .iter()
            .filter(move |s| s.marker == marker && s.has_ident(ident))
    }

    /// The first Adobe APP14 segment, if present and well-formed.
    pub fn adobe(&self) -> Option<AdobeSegment> {
        self.app_segments(APP14, ADOBE_IDENT)
            .find_map(|s| AdobeSegment::parse(&s.payload))
    }

    /// Whether an Adobe APP12 embed segment is present.
    pub fn has_adobe_embed(&self) -> bool {
        self.app_segments(APP12, ADOBE_IDENT).next().is_some()
    }
}

/// Walk the header segments of a JPEG stream up to the first SOS.
///
/// # Errors
/// Returns `Jpeg` when the stream does not start with SOI, a segment runs
/// past the end of the data, or no frame header precedes the scan.
pub fn parse_header(data: &[u8]) -> Result<JpegHeader, CorruptDataError> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
        return Err(CorruptDataError::Jpeg("missing SOI marker".into()));
    }

    let mut segments = Vec::new();
    let mut frame = None;
    let mut pos = 2;

    loop {
        if pos >= data.len() {
            return Err(CorruptDataError::Jpeg("no scan before end of data".into()));
        }
        if data[pos] != 0xFF {
            return Err(CorruptDataError::Jpeg(format!(
                "expected marker at byte {}, found 0x{:02X}",
                pos, data[pos]
            )));
        }
        // Fill bytes.
        while pos + 1 < data.len() && data[pos + 1] == 0xFF {
            pos += 1;
        }
        let marker = *data
            .get(pos + 1)
            .ok_or_else(|| CorruptDataError::Jpeg("truncated marker".into()))?;

        if marker == SOS {
            let frame =
                frame.ok_or_else(|| CorruptDataError::Jpeg("scan before frame header".into()))?;
            return Ok(JpegHeader {
                segments,
                frame,
                scan_offset: pos,
            });
        }
        if marker == EOI {
            return Err(CorruptDataError::Jpeg("EOI before first scan".into()));
        }
        if is_standalone(marker) {
            pos += 2;
            continue;
        }

        let len_bytes = data
            .get(pos + 2..pos + 4)
            .ok_or_else(|| CorruptDataError::Jpeg("truncated segment length".into()))?;
        let length = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if length < 2 {
            return Err(CorruptDataError::Jpeg(format!(
                "segment 0x{:02X} declares length {}",
                marker, length
            )));
        }
        let payload = data
            .get(pos + 4..pos + 2 + length)
            .ok_or_else(|| CorruptDataError::Jpeg(format!("segment 0x{:02X} truncated", marker)))?;

        if is_sof(marker) {
            if payload.len() < 6 {
                return Err(CorruptDataError::Jpeg("short frame header".into()));
            }
            frame = Some(FrameHeader {
                marker,
                precision: payload[0],
                height: u16::from_be_bytes([payload[1], payload[2]]),
                width: u16::from_be_bytes([payload[3], payload[4]]),
                components: payload[5],
            });
        }

        segments.push(Segment::new(marker, payload.to_vec()));
        pos += 2 + length;
    }
}

/// Rebuild an encoded stream with a new set of APPn segments.
///
/// All APPn segments of `encoded` are dropped; `app_segments` are written
/// right after SOI in the order given, followed by the remaining header
/// segments and the untouched scan data.
pub fn replace_app_segments(
    encoded: &[u8],
    app_segments: &[Segment],
) -> Result<Vec<u8>, CorruptDataError> {
    let header = parse_header(encoded)?;
    let mut out = Vec::with_capacity(
        encoded.len() + app_segments.iter().map(|s| s.payload.len() + 4).sum::<usize>(),
    );

    out.extend_from_slice(&[0xFF, SOI]);
    for segment in app_segments {
        segment.write_to(&mut out)?;
    }
    for segment in header.segments.iter().filter(|s| !is_app(s.marker)) {
        segment.write_to(&mut out)?;
    }
    out.extend_from_slice(&encoded[header.scan_offset..]);
    Ok(out)
}

// =============================================================================
// Fixed Payloads
// =============================================================================

/// JFIF 1.02 APP0 payload.
///
/// `density` is `(units, x, y)` with units 0 = aspect ratio, 1 = dpi,
/// 2 = dots per cm; `None` writes a 1:1 aspect ratio.
pub fn jfif_payload(density: Option<(u8, u16, u16)>) -> Vec<u8> {
    let (units, x, y) = density.unwrap_or((0, 1, 1));
    let mut payload = Vec::with_capacity(14);
    payload.extend_from_slice(JFIF_IDENT);
    payload.extend_from_slice(&[1, 2, units]);
    payload.extend_from_slice(&x.to_be_bytes());
    payload.extend_from_slice(&y.to_be_bytes());
    payload.extend_from_slice(&[0, 0]);
    payload
}

/// Adobe APP14 payload: "Adobe", version, two flag words, transform code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdobeSegment {
    pub version: u16,
    pub flags0: u16,
    pub flags1: u16,
    pub transform: u8,
}

impl AdobeSegment {
    /// The marker written before CMYK pixel data: version 100, no flags,
    /// unknown transform.
    pub const fn cmyk() -> Self {
        Self {
            version: 100,
            flags0: 0,
            flags1: 0,
            transform: ADOBE_TRANSFORM_UNKNOWN,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(ADOBE_PAYLOAD_LEN);
        payload.extend_from_slice(ADOBE_IDENT);
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.extend_from_slice(&self.flags0.to_be_bytes());
        payload.extend_from_slice(&self.flags1.to_be_bytes());
        payload.push(self.transform);
        payload
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < ADOBE_PAYLOAD_LEN || !payload.starts_with(ADOBE_IDENT) {
            return None;
        }
        Some(Self {
            version: u16::from_be_bytes([payload[5], payload[6]]),
            flags0: u16::from_be_bytes([payload[7], payload[8]]),
            flags1: u16::from_be_bytes([payload[9], payload[10]]),
            transform: payload[11],
        })
    }
}
