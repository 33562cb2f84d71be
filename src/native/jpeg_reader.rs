//! JPEG decode session.
//!
//! The file is held in memory. Header segments are parsed on open; pixel
//! data is decoded once, on the first band request, and served as
//! full-width bands of [`JPEG_BAND_HEIGHT`] rows.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use jpeg_decoder::{ColorTransform, Decoder, PixelFormat};
use tracing::{debug, warn};

use crate::descriptor::HeaderFields;
use crate::error::{CodecError, CorruptDataError, FormatError, NativeError};
use crate::format::jpeg::{
    parse_header, JpegHeader, ADOBE_TRANSFORM_YCCK, APP0, APP1, APP13, APP2,
};
use crate::format::tiff::Photometric;
use crate::format::ContainerFormat;
use crate::metadata::{
    decode_jpeg_exif, reassemble_icc_segments, IptcDirectory, MetadataBundle, Resolution,
    ResolutionUnit, XmpPacket, EXIF_HEADER, ICC_IDENT, PHOTOSHOP_IDENT, XMP_NAMESPACE,
};

use super::NativeSession;

/// Rows per decoded band; the tile height of every JPEG image.
pub const JPEG_BAND_HEIGHT: u32 = 512;

const JFIF_IDENT: &[u8] = b"JFIF\0";

pub struct JpegReader {
    data: Vec<u8>,
    header: JpegHeader,
    decoded: Option<Vec<u8>>,
}

impl JpegReader {
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        Self::from_bytes(fs::read(path)?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, CodecError> {
        let header = parse_header(&data)?;
        debug!(
            width = header.frame.width,
            height = header.frame.height,
            components = header.frame.components,
            "opened JPEG"
        );
        Ok(Self {
            data,
            header,
            decoded: None,
        })
    }

    pub fn header(&self) -> &JpegHeader {
        &self.header
    }

    pub fn width(&self) -> u32 {
        self.header.frame.width as u32
    }

    pub fn height(&self) -> u32 {
        self.header.frame.height as u32
    }

    pub fn components(&self) -> u16 {
        self.header.frame.components as u16
    }

    pub fn band_count(&self) -> u32 {
        self.height().div_ceil(JPEG_BAND_HEIGHT)
    }

    /// Whether decoded CMYK samples are stored inverted: four components,
    /// an Adobe APP14 marker, and no Adobe APP12 embed marker.
    pub fn needs_cmyk_inversion(&self) -> bool {
        self.components() == 4 && self.header.adobe().is_some() && !self.header.has_adobe_embed()
    }

    /// The embedded ICC profile, reassembled from its APP2 chunks.
    ///
    /// Broken chunk sequences are logged and reported as no profile.
    pub fn icc_profile(&self) -> Option<Vec<u8>> {
        let payloads = self
            .header
            .app_segments(APP2, ICC_IDENT)
            .map(|s| s.payload.as_slice());
        match reassemble_icc_segments(payloads) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "ignoring broken ICC chunk sequence");
                None
            }
        }
    }

    pub fn header_fields(&self) -> Result<HeaderFields, CodecError> {
        let frame = self.header.frame;
        if frame.precision != 8 {
            return Err(FormatError::UnsupportedBitDepth(frame.precision as u16).into());
        }
        let photometric = match frame.components {
            1 => Photometric::BlackIsZero,
            3 => Photometric::Rgb,
            4 => {
                if self
                    .header
                    .adobe()
                    .map_or(false, |a| a.transform == ADOBE_TRANSFORM_YCCK)
                {
                    return Err(FormatError::UnsupportedLayout("YCCK JPEG".into()).into());
                }
                Photometric::Separated
            }
            n => return Err(FormatError::UnsupportedBandCount(n as u16).into()),
        };

        Ok(HeaderFields {
            container: Some(ContainerFormat::Jpeg),
            width: self.width(),
            height: self.height(),
            bits_per_sample: 8,
            samples_per_pixel: self.components(),
            photometric: Some(photometric.as_u16()),
            rows_per_strip: Some(JPEG_BAND_HEIGHT),
            icc_profile: self.icc_profile(),
            page: 0,
            page_count: 1,
            ..HeaderFields::default()
        })
    }

    /// Collect the APPn metadata blocks. Malformed blocks are dropped with a
    /// warning; they never fail the decode.
    pub fn metadata(&self) -> MetadataBundle {
        let mut bundle = MetadataBundle::new();

        if let Some(segment) = self.header.app_segments(APP1, EXIF_HEADER).next() {
            match decode_jpeg_exif(&segment.payload) {
                Ok(contents) => {
                    bundle.exif = contents.exif;
                    bundle.text = contents.text;
                    bundle.resolution = contents.resolution;
                }
                Err(e) => warn!(error = %e, "ignoring malformed EXIF segment"),
            }
        }

        if let Some(segment) = self.header.app_segments(APP1, XMP_NAMESPACE).next() {
            match XmpPacket::from_jpeg_payload(&segment.payload) {
                Some(Ok(xmp)) => bundle.xmp = Some(xmp),
                Some(Err(e)) => warn!(error = %e, "ignoring malformed XMP segment"),
                None => {}
            }
        }

        for segment in self.header.app_segments(APP13, PHOTOSHOP_IDENT) {
            match IptcDirectory::parse_photoshop(&segment.payload) {
                Ok(Some(iptc)) => {
                    bundle.iptc = Some(iptc);
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "ignoring malformed Photoshop segment"),
            }
        }

        bundle.icc = self.icc_profile();

        if bundle.resolution.is_none() {
            bundle.resolution = self.jfif_resolution();
        }
        bundle
    }

    /// Pixel density from the JFIF header, when it gives real units.
    fn jfif_resolution(&self) -> Option<Resolution> {
        let payload = &self.header.app_segments(APP0, JFIF_IDENT).next()?.payload;
        let field = |at: usize| Some(u16::from_be_bytes([*payload.get(at)?, *payload.get(at + 1)?]));
        let unit = match payload.get(7)? {
            1 => ResolutionUnit::Inch,
            2 => ResolutionUnit::Centimeter,
            _ => return None,
        };
        Some(Resolution {
            x: field(8)? as f64,
            y: field(10)? as f64,
            unit,
        })
    }

    fn decode(&mut self) -> Result<&[u8], CodecError> {
        if self.decoded.is_none() {
            let components = self.components();
            let mut decoder = Decoder::new(Cursor::new(self.data.as_slice()));
            if components == 4 {
                decoder.set_color_transform(ColorTransform::CMYK);
            }
            let mut pixels = decoder
                .decode()
                .map_err(|e| NativeError::codec("jpeg", e.to_string()))?;
            let info = decoder
                .info()
                .ok_or_else(|| NativeError::codec("jpeg", "decoder returned no image info"))?;

            let format_ok = matches!(
                (info.pixel_format, components),
                (PixelFormat::L8, 1) | (PixelFormat::RGB24, 3) | (PixelFormat::CMYK32, 4)
            );
            if !format_ok {
                return Err(FormatError::UnsupportedLayout(format!(
                    "{:?} output for {} components",
                    info.pixel_format, components
                ))
                .into());
            }
            let expected = self.width() as usize * self.height() as usize * components as usize;
            if pixels.len() != expected {
                return Err(CorruptDataError::ShortRead {
                    unit: "image",
                    index: 0,
                    expected,
                    actual: pixels.len(),
                }
                .into());
            }
            if components == 4 {
                // The CMYK transform yields `255 - stored`, pixel-interleaved.
                // Bands carry the stored samples; the caller decides about
                // inversion from the markers.
                pixels.iter_mut().for_each(|s| *s = !*s);
            }
            debug!(bytes = pixels.len(), "decoded JPEG scan data");
            self.decoded = Some(pixels);
        }
        Ok(self.decoded.as_deref().unwrap_or_default())
    }

    /// Interleaved 8-bit samples of band `index`: rows
    /// `index * JPEG_BAND_HEIGHT` onwards, full width.
    pub fn read_band(&mut self, index: u32) -> Result<Vec<u8>, CodecError> {
        let (width, height, bands) = (self.width(), self.height(), self.components());
        if index >= self.band_count() {
            return Err(NativeError::codec(
                "jpeg",
                format!("band {} out of range ({} total)", index, self.band_count()),
            )
            .into());
        }
        let row_len = width as usize * bands as usize;
        let first = (index * JPEG_BAND_HEIGHT) as usize;
        let last = ((index + 1) * JPEG_BAND_HEIGHT).min(height) as usize;
        let pixels = self.decode()?;
        Ok(pixels[first * row_len..last * row_len].to_vec())
    }
}

impl NativeSession for JpegReader {
    fn close(&mut self) -> Result<(), CodecError> {
        self.decoded = None;
        Ok(())
    }
}
