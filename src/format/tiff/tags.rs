//! TIFF tag and field type definitions.
//!
//! This module defines the vocabulary shared by the TIFF reader, the TIFF
//! writer and the EXIF block codec:
//! - Field types that determine how values are encoded
//! - Tag IDs that identify metadata fields
//! - Enumerated values for compression, photometric interpretation, planar
//!   configuration, extra samples and sample format

// =============================================================================
// TIFF Field Types
// =============================================================================

/// TIFF field types that determine how values are encoded.
///
/// Each field type has a specific size in bytes, which decides whether a
/// value is stored inline in its IFD entry or at an offset. The EXIF patch
/// depends on this: an entry whose value does not fit inline holds an offset
/// that has to be relocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FieldType {
    /// Unsigned 8-bit integer (1 byte)
    Byte = 1,

    /// 8-bit ASCII character (1 byte)
    Ascii = 2,

    /// Unsigned 16-bit integer (2 bytes)
    Short = 3,

    /// Unsigned 32-bit integer (4 bytes)
    Long = 4,

    /// Two Longs: numerator, denominator (8 bytes)
    Rational = 5,

    /// Signed 8-bit integer (1 byte)
    SByte = 6,

    /// Undefined byte data (1 byte per element)
    Undefined = 7,

    /// Signed 16-bit integer (2 bytes)
    SShort = 8,

    /// Signed 32-bit integer (4 bytes)
    SLong = 9,

    /// Two SLongs (8 bytes)
    SRational = 10,

    /// IEEE single precision (4 bytes)
    Float = 11,

    /// IEEE double precision (8 bytes)
    Double = 12,

    /// 32-bit IFD offset (4 bytes)
    Ifd = 13,

    /// Unsigned 64-bit integer (8 bytes) - BigTIFF only
    Long8 = 16,

    /// Signed 64-bit integer (8 bytes) - BigTIFF only
    SLong8 = 17,

    /// 64-bit IFD offset (8 bytes) - BigTIFF only
    Ifd8 = 18,
}

impl FieldType {
    /// Size of a single value of this type in bytes.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            FieldType::Byte | FieldType::Ascii | FieldType::SByte | FieldType::Undefined => 1,
            FieldType::Short | FieldType::SShort => 2,
            FieldType::Long | FieldType::SLong | FieldType::Float | FieldType::Ifd => 4,
            FieldType::Rational
            | FieldType::SRational
            | FieldType::Double
            | FieldType::Long8
            | FieldType::SLong8
            | FieldType::Ifd8 => 8,
        }
    }

    /// Create a FieldType from its numeric value.
    ///
    /// Returns `None` for unknown type values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FieldType::Byte),
            2 => Some(FieldType::Ascii),
            3 => Some(FieldType::Short),
            4 => Some(FieldType::Long),
            5 => Some(FieldType::Rational),
            6 => Some(FieldType::SByte),
            7 => Some(FieldType::Undefined),
            8 => Some(FieldType::SShort),
            9 => Some(FieldType::SLong),
            10 => Some(FieldType::SRational),
            11 => Some(FieldType::Float),
            12 => Some(FieldType::Double),
            13 => Some(FieldType::Ifd),
            16 => Some(FieldType::Long8),
            17 => Some(FieldType::SLong8),
            18 => Some(FieldType::Ifd8),
            _ => None,
        }
    }

    /// Get the numeric type ID.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Maximum bytes that can be stored inline in a classic TIFF IFD entry.
    pub const INLINE_THRESHOLD_TIFF: usize = 4;

    /// Maximum bytes that can be stored inline in a BigTIFF IFD entry.
    pub const INLINE_THRESHOLD_BIGTIFF: usize = 8;

    /// Check if a value with this type and count fits inline in a TIFF entry.
    ///
    /// # Arguments
    /// * `count` - Number of values
    /// * `is_bigtiff` - Whether this is a BigTIFF file
    #[inline]
    pub fn fits_inline(self, count: u64, is_bigtiff: bool) -> bool {
        let threshold = if is_bigtiff {
            Self::INLINE_THRESHOLD_BIGTIFF as u64
        } else {
            Self::INLINE_THRESHOLD_TIFF as u64
        };
        (self.size_in_bytes() as u64)
            .checked_mul(count)
            .map_or(false, |total| total <= threshold)
    }
}

// =============================================================================
// TIFF Tags
// =============================================================================

/// TIFF tag IDs read or written by the codec layer.
///
/// Tags not listed here are carried through untouched by the reader and
/// never produced by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum TiffTag {
    // -------------------------------------------------------------------------
    // Basic Image Structure
    // -------------------------------------------------------------------------
    /// Subfile kind bit flags
    NewSubfileType = 254,

    /// Image width in pixels
    ImageWidth = 256,

    /// Image height (length) in pixels
    ImageLength = 257,

    /// Bits per sample, one value per sample
    BitsPerSample = 258,

    /// Compression scheme used
    Compression = 259,

    /// Photometric interpretation (RGB, separated, CIELab, ...)
    PhotometricInterpretation = 262,

    /// Number of components per pixel, alpha included
    SamplesPerPixel = 277,

    /// How components are organized (chunky vs planar)
    PlanarConfiguration = 284,

    /// Meaning of the samples beyond the colorspace bands
    ExtraSamples = 338,

    /// Unsigned vs signed integer samples
    SampleFormat = 339,

    // -------------------------------------------------------------------------
    // Strip Organization
    // -------------------------------------------------------------------------
    /// Byte offsets of strips
    StripOffsets = 273,

    /// Row count per strip
    RowsPerStrip = 278,

    /// Byte counts of strips
    StripByteCounts = 279,

    // -------------------------------------------------------------------------
    // Tile Organization
    // -------------------------------------------------------------------------
    /// Width of each tile in pixels
    TileWidth = 322,

    /// Height (length) of each tile in pixels
    TileLength = 323,

    /// Byte offsets of each tile in the file
    TileOffsets = 324,

    /// Byte counts of each tile
    TileByteCounts = 325,

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------
    /// Pixels per unit in X direction
    XResolution = 282,

    /// Pixels per unit in Y direction
    YResolution = 283,

    /// Unit of resolution (1=none, 2=inch, 3=centimeter)
    ResolutionUnit = 296,

    // -------------------------------------------------------------------------
    // Descriptive Text
    // -------------------------------------------------------------------------
    ImageDescription = 270,
    Make = 271,
    Model = 272,
    Software = 305,
    DateTime = 306,
    Artist = 315,
    Copyright = 33432,

    // -------------------------------------------------------------------------
    // Multi-page documents
    // -------------------------------------------------------------------------
    /// Page index and page count (two Shorts)
    PageNumber = 297,

    // -------------------------------------------------------------------------
    // Embedded Metadata
    // -------------------------------------------------------------------------
    /// XMP packet
    XmpPacket = 700,

    /// IPTC-IIM datasets
    RichTiffIptc = 33723,

    /// Photoshop image resources.
    ///
    /// Holds the EXIF block between the pixel writes and the EXIF patch.
    /// Numerically close enough to [`TiffTag::ExifIfd`] that renaming it in
    /// place keeps the directory sorted.
    PhotoshopImageResources = 34377,

    /// Offset of the EXIF sub-IFD
    ExifIfd = 34665,

    /// Embedded ICC profile
    IccProfile = 34675,

    /// Offset of the GPS sub-IFD
    GpsIfd = 34853,

    /// Offset of the Interoperability sub-IFD
    InteropIfd = 40965,
}

impl TiffTag {
    /// Create a TiffTag from its numeric value.
    ///
    /// Returns `None` for unrecognized tags. Unknown tags are not an error;
    /// they are carried through as raw entries.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            254 => Some(TiffTag::NewSubfileType),
            256 => Some(TiffTag::ImageWidth),
            257 => Some(TiffTag::ImageLength),
            258 => Some(TiffTag::BitsPerSample),
            259 => Some(TiffTag::Compression),
            262 => Some(TiffTag::PhotometricInterpretation),
            270 => Some(TiffTag::ImageDescription),
            271 => Some(TiffTag::Make),
            272 => Some(TiffTag::Model),
            273 => Some(TiffTag::StripOffsets),
            277 => Some(TiffTag::SamplesPerPixel),
            278 => Some(TiffTag::RowsPerStrip),
            279 => Some(TiffTag::StripByteCounts),
            282 => Some(TiffTag::XResolution),
            283 => Some(TiffTag::YResolution),
            284 => Some(TiffTag::PlanarConfiguration),
            296 => Some(TiffTag::ResolutionUnit),
            297 => Some(TiffTag::PageNumber),
            305 => Some(TiffTag::Software),
            306 => Some(TiffTag::DateTime),
            315 => Some(TiffTag::Artist),
            322 => Some(TiffTag::TileWidth),
            323 => Some(TiffTag::TileLength),
            324 => Some(TiffTag::TileOffsets),
            325 => Some(TiffTag::TileByteCounts),
            338 => Some(TiffTag::ExtraSamples),
            339 => Some(TiffTag::SampleFormat),
            700 => Some(TiffTag::XmpPacket),
            33432 => Some(TiffTag::Copyright),
            33723 => Some(TiffTag::RichTiffIptc),
            34377 => Some(TiffTag::PhotoshopImageResources),
            34665 => Some(TiffTag::ExifIfd),
            34675 => Some(TiffTag::IccProfile),
            34853 => Some(TiffTag::GpsIfd),
            40965 => Some(TiffTag::InteropIfd),
            _ => None,
        }
    }

    /// Get the numeric tag ID.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether entries with this tag hold the offset of a nested IFD.
    #[inline]
    pub const fn is_sub_ifd_pointer(tag: u16) -> bool {
        matches!(tag, 34665 | 34853 | 40965)
    }
}

// =============================================================================
// Compression Values
// =============================================================================

/// TIFF compression scheme identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Compression {
    /// No compression
    None = 1,

    /// LZW compression (not supported)
    Lzw = 5,

    /// "Old-style" JPEG (not supported)
    OldJpeg = 6,

    /// JPEG-in-TIFF (not supported)
    Jpeg = 7,

    /// Deflate/zlib compression
    Deflate = 8,

    /// Macintosh RLE
    PackBits = 32773,

    /// Adobe Deflate, same payload as Deflate
    AdobeDeflate = 32946,
}

impl Compression {
    /// Create a Compression from its numeric value.
    ///
    /// Returns `None` for unrecognized compression values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Compression::None),
            5 => Some(Compression::Lzw),
            6 => Some(Compression::OldJpeg),
            7 => Some(Compression::Jpeg),
            8 => Some(Compression::Deflate),
            32773 => Some(Compression::PackBits),
            32946 => Some(Compression::AdobeDeflate),
            _ => None,
        }
    }

    /// Get the numeric value written to the Compression field.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Check if strips and tiles with this scheme can be read.
    #[inline]
    pub const fn is_supported(self) -> bool {
        matches!(
            self,
            Compression::None
                | Compression::Deflate
                | Compression::AdobeDeflate
                | Compression::PackBits
        )
    }

    /// Get a human-readable name for the compression scheme.
    pub const fn name(self) -> &'static str {
        match self {
            Compression::None => "None",
            Compression::Lzw => "LZW",
            Compression::OldJpeg => "Old JPEG",
            Compression::Jpeg => "JPEG",
            Compression::Deflate => "Deflate",
            Compression::PackBits => "PackBits",
            Compression::AdobeDeflate => "Adobe Deflate",
        }
    }
}

// =============================================================================
// Enumerated Field Values
// =============================================================================

/// PhotometricInterpretation values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Photometric {
    WhiteIsZero = 0,
    BlackIsZero = 1,
    Rgb = 2,
    Palette = 3,
    Mask = 4,
    Separated = 5,
    YCbCr = 6,
    CieLab = 8,
}

impl Photometric {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Photometric::WhiteIsZero),
            1 => Some(Photometric::BlackIsZero),
            2 => Some(Photometric::Rgb),
            3 => Some(Photometric::Palette),
            4 => Some(Photometric::Mask),
            5 => Some(Photometric::Separated),
            6 => Some(Photometric::YCbCr),
            8 => Some(Photometric::CieLab),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// PlanarConfiguration values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanarConfig {
    /// Samples interleaved per pixel
    Chunky,
    /// One full plane per sample
    Separate,
}

impl PlanarConfig {
    /// Decode the tag value. Anything other than 2 is chunky.
    pub fn from_u16(value: u16) -> Self {
        if value == 2 {
            PlanarConfig::Separate
        } else {
            PlanarConfig::Chunky
        }
    }

    pub const fn as_u16(self) -> u16 {
        match self {
            PlanarConfig::Chunky => 1,
            PlanarConfig::Separate => 2,
        }
    }
}

/// ExtraSamples values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraSamples {
    /// No extra sample, or an extra sample with no alpha meaning
    None,
    /// Premultiplied alpha
    AssociatedAlpha,
    /// Straight alpha
    UnassociatedAlpha,
}

impl ExtraSamples {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ExtraSamples::AssociatedAlpha,
            2 => ExtraSamples::UnassociatedAlpha,
            _ => ExtraSamples::None,
        }
    }

    pub const fn is_alpha(self) -> bool {
        !matches!(self, ExtraSamples::None)
    }
}

/// SampleFormat values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    Uint,
    Int,
}

impl SampleFormat {
    /// Decode the tag value.
    ///
    /// Returns `None` for floating point and undefined formats.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(SampleFormat::Uint),
            2 => Some(SampleFormat::Int),
            _ => None,
        }
    }

    pub const fn as_u16(self) -> u16 {
        match self {
            SampleFormat::Uint => 1,
            SampleFormat::Int => 2,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
