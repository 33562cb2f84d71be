//! Writing a [`MetadataBundle`] into an open encode session.
//!
//! Metadata must reach the session before the first pixel row: both writers
//! freeze their header once pixel data arrives and reject later fields with
//! `MetadataAfterPixels`.
//!
//! # JPEG
//!
//! APPn segments are emitted in a fixed order:
//!
//! ```text
//! APP0 JFIF | APP1 EXIF | APP1 XMP | APP13 IPTC | APP2 ICC 1..n | APP14 Adobe
//! ```
//!
//! EXIF precedes XMP because some readers only look at the first APP1.
//! JFIF is skipped for CMYK, which instead carries the Adobe marker.
//!
//! # TIFF
//!
//! Plain fields become tags. The EXIF directory cannot be written as a
//! sub-IFD up front, so it is staged as an opaque block under
//! [`TiffTag::PhotoshopImageResources`] with offsets relative to the block,
//! and [`MetadataEmbedder::patch_tiff`] relocates it once the file is closed.
//! A GPS directory travels inside the same block; its IFD0 pointer is
//! staged with a block-relative value and relocated by the same pass.

use std::fs::OpenOptions;
use std::path::Path;

use tracing::debug;

use crate::descriptor::{ColorSpace, FormatDescriptor};
use crate::error::CodecError;
use crate::format::jpeg::{jfif_payload, AdobeSegment, Segment, APP0, APP1, APP13, APP14};
use crate::format::tiff::{patch_exif_pointer, ByteOrder, FieldType, PatchReport, TiffTag};
use crate::metadata::{
    encode_jpeg_exif, split_icc_profile, JpegExif, MetadataBundle, Resolution, ResolutionUnit,
};
use crate::native::{JpegWriter, NativeCodecHandle, TiffWriter};

/// Byte order of the TIFF structure inside the JPEG EXIF segment.
const JPEG_EXIF_ORDER: ByteOrder = ByteOrder::BigEndian;

/// Whether a TIFF still needs its EXIF block relocated after close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExifPatch {
    Pending,
    NotNeeded,
}

/// Encodes metadata into container segments and tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataEmbedder;

impl MetadataEmbedder {
    // =========================================================================
    // JPEG
    // =========================================================================

    /// APPn segments for `metadata`, in write order.
    ///
    /// # Errors
    /// `Metadata` if a block does not fit its segment, or an ICC profile
    /// needs more than 255 chunks.
    pub fn jpeg_segments(
        metadata: &MetadataBundle,
        descriptor: &FormatDescriptor,
    ) -> Result<Vec<Segment>, CodecError> {
        let cmyk = descriptor.bands == 4;
        let mut segments = Vec::new();

        if !cmyk {
            let density = metadata.resolution.and_then(jfif_density);
            segments.push(Segment::new(APP0, jfif_payload(density)));
        }

        let exif = JpegExif {
            exif: metadata.exif.clone(),
            text: metadata.text.clone(),
            resolution: metadata.resolution,
        };
        if let Some(payload) = encode_jpeg_exif(&exif, JPEG_EXIF_ORDER)? {
            segments.push(Segment::new(APP1, payload));
        }

        if let Some(xmp) = &metadata.xmp {
            segments.push(Segment::new(APP1, xmp.jpeg_payload()?));
        }

        if let Some(iptc) = metadata.iptc.as_ref().filter(|i| !i.is_empty()) {
            segments.push(Segment::new(APP13, iptc.encode_photoshop()));
        }

        if let Some(icc) = metadata.icc.as_deref().filter(|p| !p.is_empty()) {
            segments.extend(split_icc_profile(icc)?);
        }

        if cmyk {
            segments.push(Segment::new(APP14, AdobeSegment::cmyk().encode()));
        }
        Ok(segments)
    }

    /// Queue the metadata segments on a JPEG encode session.
    ///
    /// # Errors
    /// As [`jpeg_segments`](Self::jpeg_segments), or `MetadataAfterPixels`
    /// if rows were already written.
    pub fn embed_jpeg(
        handle: &NativeCodecHandle<JpegWriter>,
        metadata: &MetadataBundle,
        descriptor: &FormatDescriptor,
    ) -> Result<(), CodecError> {
        let segments = Self::jpeg_segments(metadata, descriptor)?;
        let count = segments.len();
        handle.with_session(|writer| {
            segments
                .into_iter()
                .try_for_each(|segment| writer.add_segment(segment))
        })?;
        debug!(segments = count, "JPEG metadata embedded");
        Ok(())
    }

    // =========================================================================
    // TIFF
    // =========================================================================

    /// Set the metadata tags on a TIFF encode session.
    ///
    /// Returns [`ExifPatch::Pending`] when an EXIF block was staged; the
    /// caller must run [`patch_tiff`](Self::patch_tiff) on the closed file
    /// before publishing it.
    ///
    /// # Errors
    /// `MetadataAfterPixels` if pixel data was already written, or
    /// `InvalidIfdOffset` if the EXIF block cannot be encoded.
    pub fn embed_tiff(
        handle: &NativeCodecHandle<TiffWriter>,
        metadata: &MetadataBundle,
        descriptor: &FormatDescriptor,
    ) -> Result<ExifPatch, CodecError> {
        handle.with_session(|writer| {
            for (field, value) in &metadata.text {
                writer.set_string(field.tag(), value)?;
            }

            if let Some(res) = metadata.resolution {
                writer.set_rational(TiffTag::XResolution, Resolution::to_rational(res.x))?;
                writer.set_rational(TiffTag::YResolution, Resolution::to_rational(res.y))?;
                writer.set_shorts(TiffTag::ResolutionUnit, &[res.unit.as_u16()])?;
            }

            if let Some(icc) = metadata.icc.as_deref().filter(|p| !p.is_empty()) {
                writer.set_bytes(TiffTag::IccProfile, FieldType::Undefined, icc)?;
            } else if descriptor.colorspace == ColorSpace::Lab {
                debug!("Lab image without profile; relying on photometric interpretation");
            }

            if let Some(xmp) = &metadata.xmp {
                writer.set_bytes(TiffTag::XmpPacket, FieldType::Byte, xmp.as_bytes())?;
            }

            if let Some(iptc) = metadata.iptc.as_ref().filter(|i| !i.is_empty()) {
                writer.set_bytes(TiffTag::RichTiffIptc, FieldType::Undefined, &iptc.encode_iim())?;
            }

            let Some(exif) = metadata.exif.as_ref().filter(|e| !e.is_empty()) else {
                return Ok(ExifPatch::NotNeeded);
            };
            let block = exif.encode_block(writer.byte_order(), 0)?;
            debug!(bytes = block.data.len(), "staging EXIF block for relocation");
            writer.set_bytes(TiffTag::PhotoshopImageResources, FieldType::Undefined, &block.data)?;
            if let Some(gps_at) = block.gps_offset {
                writer.set_int_field(TiffTag::GpsIfd, gps_at)?;
            }
            Ok(ExifPatch::Pending)
        })
    }

    /// Relocate the staged EXIF block of the closed TIFF at `path`.
    ///
    /// Returns `Ok(None)` when the file carries no staged block.
    ///
    /// # Errors
    /// Any failure leaves the file in an unknown state; it must not be
    /// published.
    pub fn patch_tiff(path: &Path) -> Result<Option<PatchReport>, CodecError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let report = patch_exif_pointer(&mut file)?;
        file.sync_all()?;
        if let Some(report) = &report {
            debug!(
                path = %path.display(),
                exif_ifd = report.exif_ifd_offset,
                patched = report.patched_values,
                "EXIF block relocated"
            );
        }
        Ok(report)
    }
}

/// JFIF density for a resolution, if it has physical units and fits.
fn jfif_density(res: Resolution) -> Option<(u8, u16, u16)> {
    let units = match res.unit {
        ResolutionUnit::Inch => 1,
        ResolutionUnit::Centimeter => 2,
        ResolutionUnit::None => return None,
    };
    let to_u16 = |v: f64| {
        let v = v.round();
        (v >= 1.0 && v <= u16::MAX as f64).then_some(v as u16)
    };
    Some((units, to_u16(res.x)?, to_u16(res.y)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::jpeg::APP2;
    use crate::metadata::{
        fake_profile, ExifDirectory, ExifValue, IptcDataSet, IptcDirectory, TextField, XmpPacket,
        EXIF_HEADER, ICC_IDENT, XMP_NAMESPACE,
    };

    fn descriptor(bands: u16) -> FormatDescriptor {
        FormatDescriptor::for_raster(16, 16, bands, 8, None, (16, 16)).unwrap()
    }

    fn full_bundle() -> MetadataBundle {
        let mut exif = ExifDirectory::new();
        exif.insert(0x9003, ExifValue::Ascii("2024:01:02 03:04:05".into()));
        let mut iptc = IptcDirectory::new();
        iptc.push(IptcDataSet::new(2, 120, b"caption".to_vec()));
        MetadataBundle::new()
            .with_exif(exif)
            .with_xmp(XmpPacket::new("<x:xmpmeta/>"))
            .with_iptc(iptc)
            .with_icc(fake_profile(b"RGB ", 70_000))
            .with_text(TextField::Artist, "someone")
            .with_resolution(Resolution::dpi(300.0))
    }

    // ---- JPEG ordering ----

    #[test]
    fn test_jpeg_segment_order() {
        let segments = MetadataEmbedder::jpeg_segments(&full_bundle(), &descriptor(3)).unwrap();
        let kinds: Vec<&str> = segments
            .iter()
            .map(|s| match s.marker {
                APP0 => "jfif",
                APP1 if s.has_ident(EXIF_HEADER) => "exif",
                APP1 if s.has_ident(XMP_NAMESPACE) => "xmp",
                APP13 => "iptc",
                APP2 if s.has_ident(ICC_IDENT) => "icc",
                APP14 => "adobe",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["jfif", "exif", "xmp", "iptc", "icc", "icc"]);
    }

    #[test]
    fn test_jfif_carries_density() {
        let segments = MetadataEmbedder::jpeg_segments(&full_bundle(), &descriptor(3)).unwrap();
        let jfif = &segments[0].payload;
        assert_eq!(jfif[7], 1);
        assert_eq!(u16::from_be_bytes([jfif[8], jfif[9]]), 300);
    }

    #[test]
    fn test_cmyk_gets_adobe_and_no_jfif() {
        let bundle = MetadataBundle::new().with_text(TextField::Make, "scanner");
        let segments = MetadataEmbedder::jpeg_segments(&bundle, &descriptor(4)).unwrap();
        assert!(segments.iter().all(|s| s.marker != APP0));
        let adobe = segments.last().unwrap();
        assert_eq!(adobe.marker, APP14);
        assert_eq!(AdobeSegment::parse(&adobe.payload), Some(AdobeSegment::cmyk()));
    }

    #[test]
    fn test_empty_bundle_writes_only_jfif() {
        let segments =
            MetadataEmbedder::jpeg_segments(&MetadataBundle::new(), &descriptor(1)).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].marker, APP0);
    }

    // ---- Helpers ----

    #[test]
    fn test_jfif_density_limits() {
        assert_eq!(jfif_density(Resolution::dpi(72.4)), Some((1, 72, 72)));
        assert_eq!(jfif_density(Resolution::dpi(1e6)), None);
        assert_eq!(
            jfif_density(Resolution {
                x: 10.0,
                y: 10.0,
                unit: ResolutionUnit::None
            }),
            None
        );
    }
}
