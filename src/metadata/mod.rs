//! Embedded metadata: EXIF, IPTC, XMP, ICC and the descriptive TIFF fields.
//!
//! A [`MetadataBundle`] is built once, before any pixel data is written, and
//! is read-only afterwards. The container-specific framing of each block
//! (JPEG segments, TIFF tags) lives next to the block's codec; ordering and
//! the TIFF two-phase EXIF write live in [`crate::embed`].

mod exif;
mod icc;
mod iptc;
mod xmp;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::format::tiff::TiffTag;

pub use exif::{
    decode_jpeg_exif, encode_jpeg_exif, ExifBlock, ExifDirectory, ExifValue, JpegExif, EXIF_HEADER,
};
pub use icc::{
    icc_segment_count, reassemble_icc_segments, split_icc_profile, ColorProfile,
    ICC_CHUNK_DATA_LEN, ICC_HEADER_LEN, ICC_IDENT,
};
pub use iptc::{IptcDataSet, IptcDirectory, PHOTOSHOP_IDENT};
pub use xmp::{XmpPacket, XMP_NAMESPACE};

#[cfg(test)]
pub(crate) use icc::tests::fake_profile;

// =============================================================================
// Descriptive Text Fields
// =============================================================================

/// ASCII fields that travel as plain TIFF tags (or EXIF IFD0 in JPEG).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    ImageDescription,
    Make,
    Model,
    Software,
    DateTime,
    Artist,
    Copyright,
}

impl TextField {
    pub const ALL: [TextField; 7] = [
        TextField::ImageDescription,
        TextField::Make,
        TextField::Model,
        TextField::Software,
        TextField::DateTime,
        TextField::Artist,
        TextField::Copyright,
    ];

    pub const fn tag(self) -> TiffTag {
        match self {
            TextField::ImageDescription => TiffTag::ImageDescription,
            TextField::Make => TiffTag::Make,
            TextField::Model => TiffTag::Model,
            TextField::Software => TiffTag::Software,
            TextField::DateTime => TiffTag::DateTime,
            TextField::Artist => TiffTag::Artist,
            TextField::Copyright => TiffTag::Copyright,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.tag().as_u16() == tag)
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Unit for [`Resolution`], with TIFF ResolutionUnit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionUnit {
    None,
    Inch,
    Centimeter,
}

impl ResolutionUnit {
    pub fn from_u16(value: u16) -> Self {
        match value {
            2 => ResolutionUnit::Inch,
            3 => ResolutionUnit::Centimeter,
            _ => ResolutionUnit::None,
        }
    }

    pub const fn as_u16(self) -> u16 {
        match self {
            ResolutionUnit::None => 1,
            ResolutionUnit::Inch => 2,
            ResolutionUnit::Centimeter => 3,
        }
    }
}

/// Pixel density.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Resolution {
    pub x: f64,
    pub y: f64,
    pub unit: ResolutionUnit,
}

impl Resolution {
    pub fn dpi(value: f64) -> Self {
        Self {
            x: value,
            y: value,
            unit: ResolutionUnit::Inch,
        }
    }

    /// Encode a density as a TIFF rational.
    ///
    /// Whole numbers are stored over 1, others over 10000.
    pub fn to_rational(value: f64) -> (u32, u32) {
        if value.fract() == 0.0 && value >= 0.0 && value <= u32::MAX as f64 {
            (value as u32, 1)
        } else {
            let scaled = (value * 10_000.0).round().clamp(0.0, u32::MAX as f64);
            (scaled as u32, 10_000)
        }
    }
}

// =============================================================================
// MetadataBundle
// =============================================================================

/// All metadata attached to one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataBundle {
    /// EXIF sub-IFD contents, GPS and Interoperability nested inside
    pub exif: Option<ExifDirectory>,

    pub iptc: Option<IptcDirectory>,

    pub xmp: Option<XmpPacket>,

    /// Raw ICC profile bytes, written verbatim
    #[serde(skip)]
    pub icc: Option<Vec<u8>>,

    pub text: BTreeMap<TextField, String>,

    pub resolution: Option<Resolution>,
}

impl MetadataBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exif(mut self, exif: ExifDirectory) -> Self {
        self.exif = Some(exif);
        self
    }

    pub fn with_icc(mut self, icc: Vec<u8>) -> Self {
        self.icc = Some(icc);
        self
    }

    pub fn with_xmp(mut self, xmp: XmpPacket) -> Self {
        self.xmp = Some(xmp);
        self
    }

    pub fn with_iptc(mut self, iptc: IptcDirectory) -> Self {
        self.iptc = Some(iptc);
        self
    }

    pub fn with_text(mut self, field: TextField, value: impl Into<String>) -> Self {
        self.text.insert(field, value.into());
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Whether any block needs the TIFF EXIF patch.
    pub fn needs_exif_patch(&self) -> bool {
        self.exif.as_ref().map_or(false, |e| !e.is_empty())
    }
}
