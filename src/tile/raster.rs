//! Decoded tile pixels.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::error::CorruptDataError;

const TILE_MAGIC: &[u8; 4] = b"RTIL";
const TILE_HEADER_LEN: usize = 4 + 4 * 4 + 2 + 2;

/// Sample storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    U16,
}

impl SampleType {
    pub fn for_bits(bits: u16) -> Self {
        if bits > 8 {
            SampleType::U16
        } else {
            SampleType::U8
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 => 2,
        }
    }
}

/// Interleaved colour samples, row-major. 16-bit signed data keeps its bit
/// pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl Samples {
    pub fn sample_type(&self) -> SampleType {
        match self {
            Samples::U8(_) => SampleType::U8,
            Samples::U16(_) => SampleType::U16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Samples::U8(v) => v.len(),
            Samples::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.sample_type().bytes()
    }
}

/// One decoded tile of colour bands. Extra samples are never present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterTile {
    pub tile_x: u32,
    pub tile_y: u32,
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub samples: Samples,
}

impl RasterTile {
    /// # Errors
    /// Returns `ShortRead` if `samples` does not hold exactly
    /// `width * height * bands` values.
    pub fn new(
        tile_x: u32,
        tile_y: u32,
        width: u32,
        height: u32,
        bands: u16,
        samples: Samples,
    ) -> Result<Self, CorruptDataError> {
        let expected = width as usize * height as usize * bands as usize;
        if samples.len() != expected {
            return Err(CorruptDataError::ShortRead {
                unit: "tile",
                index: tile_y,
                expected: expected * samples.sample_type().bytes(),
                actual: samples.byte_len(),
            });
        }
        Ok(Self {
            tile_x,
            tile_y,
            width,
            height,
            bands,
            samples,
        })
    }

    pub fn sample_type(&self) -> SampleType {
        self.samples.sample_type()
    }

    /// Memory footprint of the samples.
    pub fn byte_len(&self) -> usize {
        self.samples.byte_len()
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.samples {
            Samples::U8(v) => Some(v),
            Samples::U16(_) => None,
        }
    }

    pub fn as_u16(&self) -> Option<&[u16]> {
        match &self.samples {
            Samples::U16(v) => Some(v),
            Samples::U8(_) => None,
        }
    }

    /// Serialize for the overflow area. Little-endian throughout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(TILE_HEADER_LEN + self.byte_len());
        out.put_slice(TILE_MAGIC);
        out.put_u32_le(self.tile_x);
        out.put_u32_le(self.tile_y);
        out.put_u32_le(self.width);
        out.put_u32_le(self.height);
        out.put_u16_le(self.bands);
        out.put_u16_le(self.sample_type().bytes() as u16);
        match &self.samples {
            Samples::U8(v) => out.put_slice(v),
            Samples::U16(v) => v.iter().for_each(|s| out.put_u16_le(*s)),
        }
        out.to_vec()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self, CorruptDataError> {
        if data.len() < TILE_HEADER_LEN || !data.starts_with(TILE_MAGIC) {
            return Err(CorruptDataError::Metadata("not a spilled tile".into()));
        }
        data.advance(TILE_MAGIC.len());
        let tile_x = data.get_u32_le();
        let tile_y = data.get_u32_le();
        let width = data.get_u32_le();
        let height = data.get_u32_le();
        let bands = data.get_u16_le();
        let samples = match data.get_u16_le() {
            1 => Samples::U8(data.to_vec()),
            2 if data.len() % 2 == 0 => Samples::U16(
                data.chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            ),
            other => {
                return Err(CorruptDataError::Metadata(format!(
                    "spilled tile with {} bytes per sample",
                    other
                )))
            }
        };
        Self::new(tile_x, tile_y, width, height, bands, samples)
    }
}
