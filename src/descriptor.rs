//! Pixel layout derivation.
//!
//! Readers collect the raw header values into [`HeaderFields`];
//! [`FormatDescriptor::derive`] turns them into the layout the rest of the
//! crate works with. Strip-organized files become a tile grid whose tiles
//! span the full width, so callers only ever address tiles.

use serde::Serialize;
use tracing::warn;

use crate::error::FormatError;
use crate::format::tiff::{ExtraSamples, Photometric, PlanarConfig, SampleFormat};
use crate::format::ContainerFormat;
use crate::metadata::ColorProfile;

// =============================================================================
// Header Fields
// =============================================================================

/// Raw layout fields as read from a container header.
#[derive(Debug, Clone, Default)]
pub struct HeaderFields {
    pub container: Option<ContainerFormat>,
    pub width: u32,
    pub height: u32,
    pub bits_per_sample: u16,

    /// Stored samples per pixel, extra samples included
    pub samples_per_pixel: u16,

    /// Raw SampleFormat value; `None` means unsigned
    pub sample_format: Option<u16>,

    /// Raw ExtraSamples values
    pub extra_samples: Vec<u16>,

    /// Raw PhotometricInterpretation; `None` picks one from the band count
    pub photometric: Option<u16>,

    /// Raw PlanarConfiguration; `None` means chunky
    pub planar_config: Option<u16>,

    /// Tile size for tiled files
    pub tile_size: Option<(u32, u32)>,

    /// Rows per strip for strip files; `None` means one strip
    pub rows_per_strip: Option<u32>,

    /// Embedded ICC profile bytes
    pub icc_profile: Option<Vec<u8>>,

    pub page: u32,
    pub page_count: u32,
    pub layered: bool,
}

// =============================================================================
// Colour Space
// =============================================================================

/// Colour space of the decoded colour bands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    Gray,
    Srgb,
    Cmyk,
    /// CIE L*a*b* without an embedded profile
    Lab,
    /// Defined by the embedded profile; holds its colour space signature
    Icc(String),
}

impl ColorSpace {
    /// Default colour space for an unprofiled image.
    fn for_bands(bands: u16, photometric: Photometric) -> Result<Self, FormatError> {
        match (bands, photometric) {
            (3, Photometric::CieLab) => Ok(ColorSpace::Lab),
            (1, _) => Ok(ColorSpace::Gray),
            (3, _) => Ok(ColorSpace::Srgb),
            (4, _) => Ok(ColorSpace::Cmyk),
            (n, _) => Err(FormatError::UnsupportedBandCount(n)),
        }
    }
}

// =============================================================================
// FormatDescriptor
// =============================================================================

/// In-memory pixel layout of one image.
///
/// Derived once per opened file and immutable afterwards. `bands` counts
/// colour bands only: alpha and other extra samples are removed on decode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatDescriptor {
    pub container: Option<ContainerFormat>,
    pub width: u32,
    pub height: u32,
    pub bits_per_sample: u16,
    pub samples_per_pixel: u16,
    pub bands: u16,
    pub sample_format: SampleFormat,
    pub extra_samples: ExtraSamples,

    /// Number of stored extra samples, alpha included
    pub extra_sample_count: u16,
    pub photometric: u16,
    pub planar_config: PlanarConfig,
    pub tiled: bool,
    pub tile_width: u32,
    pub tile_height: u32,
    pub colorspace: ColorSpace,

    #[serde(skip)]
    pub color_profile: Option<ColorProfile>,

    pub page: u32,
    pub page_count: u32,
    pub layered: bool,
}

impl FormatDescriptor {
    /// Derive the layout from header fields.
    ///
    /// A malformed ICC profile, or one whose channel count does not match
    /// the colour bands, is logged and ignored.
    ///
    /// # Errors
    /// - `UnsupportedBitDepth` unless samples are 8 or 16 bits
    /// - `UnsupportedBandCount` for an unprofiled image with other than 1, 3
    ///   or 4 colour bands
    /// - `UnsupportedLayout` for zero dimensions, floating-point samples and
    ///   palette, mask, YCbCr or WhiteIsZero photometrics
    pub fn derive(fields: HeaderFields) -> Result<Self, FormatError> {
        let bits = fields.bits_per_sample;
        if bits != 8 && bits != 16 {
            return Err(FormatError::UnsupportedBitDepth(bits));
        }
        if fields.width == 0 || fields.height == 0 {
            return Err(FormatError::UnsupportedLayout(format!(
                "empty image {}x{}",
                fields.width, fields.height
            )));
        }

        let sample_format = match fields.sample_format {
            None => SampleFormat::Uint,
            Some(raw) => SampleFormat::from_u16(raw).ok_or_else(|| {
                FormatError::UnsupportedLayout(format!("sample format {}", raw))
            })?,
        };

        let extra_count = fields.extra_samples.len() as u16;
        let extra_samples = fields
            .extra_samples
            .first()
            .map_or(ExtraSamples::None, |&v| ExtraSamples::from_u16(v));
        let bands = fields
            .samples_per_pixel
            .checked_sub(extra_count)
            .filter(|&b| b > 0)
            .ok_or(FormatError::UnsupportedBandCount(fields.samples_per_pixel))?;

        let photometric = match fields.photometric {
            Some(raw) => Photometric::from_u16(raw).ok_or_else(|| {
                FormatError::UnsupportedLayout(format!("photometric interpretation {}", raw))
            })?,
            None => match bands {
                1 => Photometric::BlackIsZero,
                4 => Photometric::Separated,
                _ => Photometric::Rgb,
            },
        };
        if matches!(
            photometric,
            Photometric::Palette | Photometric::Mask | Photometric::YCbCr | Photometric::WhiteIsZero
        ) {
            return Err(FormatError::UnsupportedLayout(format!(
                "photometric interpretation {:?}",
                photometric
            )));
        }

        let color_profile = fields.icc_profile.and_then(|bytes| match ColorProfile::parse(bytes) {
            Ok(profile) if profile.channels == bands => Some(profile),
            Ok(profile) => {
                warn!(
                    profile_channels = profile.channels,
                    bands, "ignoring ICC profile with mismatched channel count"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "ignoring malformed ICC profile");
                None
            }
        });

        let colorspace = match &color_profile {
            Some(profile) => ColorSpace::Icc(profile.color_space.clone()),
            None => ColorSpace::for_bands(bands, photometric)?,
        };

        let (tiled, tile_width, tile_height) = match fields.tile_size {
            Some((w, h)) if w > 0 && h > 0 => (true, w, h),
            Some((w, h)) => {
                return Err(FormatError::UnsupportedLayout(format!("tile size {}x{}", w, h)))
            }
            None => {
                let rows = fields
                    .rows_per_strip
                    .filter(|&r| r > 0)
                    .unwrap_or(fields.height)
                    .min(fields.height);
                (false, fields.width, rows)
            }
        };

        Ok(Self {
            container: fields.container,
            width: fields.width,
            height: fields.height,
            bits_per_sample: bits,
            samples_per_pixel: fields.samples_per_pixel,
            bands,
            sample_format,
            extra_samples,
            extra_sample_count: extra_count,
            photometric: photometric.as_u16(),
            planar_config: fields
                .planar_config
                .map_or(PlanarConfig::Chunky, PlanarConfig::from_u16),
            tiled,
            tile_width,
            tile_height,
            colorspace,
            color_profile,
            page: fields.page,
            page_count: fields.page_count.max(1),
            layered: fields.layered,
        })
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    pub fn has_alpha(&self) -> bool {
        self.extra_samples != ExtraSamples::None
    }

    pub fn tiles_across(&self) -> u32 {
        self.width.div_ceil(self.tile_width)
    }

    pub fn tiles_down(&self) -> u32 {
        self.height.div_ceil(self.tile_height)
    }

    pub fn tile_count(&self) -> u32 {
        self.tiles_across() * self.tiles_down()
    }

    /// Pixel rectangle `(x, y, width, height)` covered by a tile, clipped
    /// to the image. `None` outside the grid.
    pub fn tile_rect(&self, tile_x: u32, tile_y: u32) -> Option<(u32, u32, u32, u32)> {
        if tile_x >= self.tiles_across() || tile_y >= self.tiles_down() {
            return None;
        }
        let x = tile_x * self.tile_width;
        let y = tile_y * self.tile_height;
        Some((
            x,
            y,
            self.tile_width.min(self.width - x),
            self.tile_height.min(self.height - y),
        ))
    }

    /// Decoded size of the whole image in bytes.
    pub fn decoded_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bands as usize * self.bytes_per_sample()
    }

    /// Layout of a raster built in memory, cut into `tile_size` tiles.
    ///
    /// `photometric` follows the TIFF codes; `None` picks one from the
    /// band count.
    ///
    /// # Errors
    /// Same as [`derive`](Self::derive).
    pub fn for_raster(
        width: u32,
        height: u32,
        bands: u16,
        bits_per_sample: u16,
        photometric: Option<u16>,
        tile_size: (u32, u32),
    ) -> Result<Self, FormatError> {
        Self::derive(HeaderFields {
            width,
            height,
            bits_per_sample,
            samples_per_pixel: bands,
            photometric,
            tile_size: Some(tile_size),
            page_count: 1,
            ..HeaderFields::default()
        })
    }
}
