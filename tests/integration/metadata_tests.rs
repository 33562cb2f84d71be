//! Metadata embedding integration tests.
//!
//! Tests verify:
//! - ICC profiles survive JPEG chunking and the TIFF tag unchanged
//! - The relocated TIFF EXIF IFD is readable by an independent parser
//! - EXIF, GPS, IPTC, XMP, text fields and resolution round-trip
//! - A malformed profile is carried but ignored for the colour space

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use raster_codec::format::jpeg::{parse_header, APP1, APP13, APP2};
use raster_codec::metadata::{icc_segment_count, EXIF_HEADER, ICC_IDENT, XMP_NAMESPACE};
use raster_codec::native::TiffReader;
use raster_codec::{
    decode, ByteOrder, CancelFlag, ColorSpace, ContainerFormat, ExifDirectory, ExifValue,
    ExportOptions, IptcDataSet, IptcDirectory, MetadataBundle, Resolution, ResolutionUnit,
    TextField, TiffExportOptions, TiffTag, XmpPacket,
};

use super::test_utils::{export_to, gradient, icc_profile, memory_image, scratch_path};

fn camera_exif() -> ExifDirectory {
    let mut gps = ExifDirectory::new();
    gps.insert(0x0001, ExifValue::Ascii("N".into()));
    gps.insert(0x0002, ExifValue::Rational(vec![(48, 1), (51, 1), (2_400, 100)]));

    let mut exif = ExifDirectory::new();
    exif.insert(0x9003, ExifValue::Ascii("2024:05:06 07:08:09".into()));
    exif.insert(0x829A, ExifValue::Rational(vec![(1, 250)]));
    exif.insert(0x8827, ExifValue::Short(vec![400]));
    exif.gps = Some(Box::new(gps));
    exif
}

fn full_bundle(icc: Vec<u8>) -> MetadataBundle {
    let mut iptc = IptcDirectory::new();
    iptc.push(IptcDataSet::new(2, 120, b"A caption".to_vec()));
    iptc.push(IptcDataSet::new(2, 25, b"harbour".to_vec()));
    iptc.push(IptcDataSet::new(2, 25, b"boats".to_vec()));

    MetadataBundle::new()
        .with_exif(camera_exif())
        .with_iptc(iptc)
        .with_xmp(XmpPacket::new(
            "<x:xmpmeta xmlns:x=\"adobe:ns:meta/\"><rdf:RDF/></x:xmpmeta>",
        ))
        .with_icc(icc)
        .with_text(TextField::Make, "Acme")
        .with_text(TextField::Model, "Scanner 9000")
        .with_text(TextField::Copyright, "(c) nobody")
        .with_resolution(Resolution::dpi(300.0))
}

fn read_exif(path: &Path) -> exif::Exif {
    let file = File::open(path).unwrap();
    exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .unwrap()
}

fn ascii_field(exif: &exif::Exif, tag: exif::Tag) -> Vec<u8> {
    let field = exif
        .get_field(tag, exif::In::PRIMARY)
        .unwrap_or_else(|| panic!("missing {}", tag));
    match &field.value {
        exif::Value::Ascii(values) => values[0].clone(),
        other => panic!("{} is not ASCII: {:?}", tag, other),
    }
}

fn assert_bundle_matches(decoded: &MetadataBundle, expected: &MetadataBundle) {
    let exif = decoded.exif.as_ref().expect("EXIF block");
    assert_eq!(
        exif.get(0x9003),
        Some(&ExifValue::Ascii("2024:05:06 07:08:09".into()))
    );
    assert_eq!(exif.get(0x829A), Some(&ExifValue::Rational(vec![(1, 250)])));
    assert_eq!(exif.get(0x8827), Some(&ExifValue::Short(vec![400])));
    let gps = exif.gps.as_ref().expect("GPS directory");
    assert_eq!(gps.get(0x0001), Some(&ExifValue::Ascii("N".into())));

    assert_eq!(decoded.iptc, expected.iptc);
    assert_eq!(decoded.xmp, expected.xmp);
    assert_eq!(decoded.icc, expected.icc);
    for field in [TextField::Make, TextField::Model, TextField::Copyright] {
        assert_eq!(decoded.text.get(&field), expected.text.get(&field));
    }
    let res = decoded.resolution.expect("resolution");
    assert_eq!((res.x, res.y, res.unit), (300.0, 300.0, ResolutionUnit::Inch));
}

// =============================================================================
// ICC Profiles
// =============================================================================

#[test]
fn test_icc_chunks_round_trip_through_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let image = memory_image(16, 16, 3, 8, 16);

    for len in [3_000usize, 65_519, 65_520, 200_000] {
        let profile = icc_profile(b"RGB ", len);
        let path = scratch_path(&dir, &format!("icc-{}.jpg", len));
        export_to(
            &image,
            &MetadataBundle::new().with_icc(profile.clone()),
            &path,
            &ExportOptions::for_format(ContainerFormat::Jpeg),
        )
        .unwrap();

        let data = std::fs::read(&path).unwrap();
        let header = parse_header(&data).unwrap();
        let chunks: Vec<_> = header.app_segments(APP2, ICC_IDENT).collect();
        assert_eq!(chunks.len(), icc_segment_count(len), "profile of {} bytes", len);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.payload[12] as usize, i + 1);
            assert_eq!(chunk.payload[13] as usize, chunks.len());
        }

        let decoded = decode(&path).unwrap();
        assert_eq!(decoded.metadata.icc.as_deref(), Some(profile.as_slice()));
        assert_eq!(
            decoded.image.descriptor().colorspace,
            ColorSpace::Icc("RGB ".into())
        );
    }
}

#[test]
fn test_icc_round_trips_through_tiff() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "icc.tif");
    let profile = icc_profile(b"GRAY", 1_000);
    export_to(
        &memory_image(10, 10, 1, 16, 16),
        &MetadataBundle::new().with_icc(profile.clone()),
        &path,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let decoded = decode(&path).unwrap();
    assert_eq!(decoded.metadata.icc, Some(profile));
    let d = decoded.image.descriptor();
    assert_eq!(d.colorspace, ColorSpace::Icc("GRAY".into()));
    assert_eq!(d.color_profile.as_ref().map(|p| p.channels), Some(1));
}

#[test]
fn test_malformed_profile_is_carried_but_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "bad-icc.tif");
    let garbage = vec![0xAB; 300];
    export_to(
        &memory_image(8, 8, 3, 8, 16),
        &MetadataBundle::new().with_icc(garbage.clone()),
        &path,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let decoded = decode(&path).unwrap();
    assert_eq!(decoded.image.descriptor().colorspace, ColorSpace::Srgb);
    assert!(decoded.image.descriptor().color_profile.is_none());
    assert_eq!(decoded.metadata.icc, Some(garbage));
}

// =============================================================================
// TIFF EXIF Relocation
// =============================================================================

#[test]
fn test_tiff_exif_readable_by_independent_parser() {
    let dir = tempfile::tempdir().unwrap();

    for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
        let path = scratch_path(&dir, &format!("exif-{:?}.tif", order));
        let report = export_to(
            &memory_image(33, 17, 3, 8, 16),
            &full_bundle(icc_profile(b"RGB ", 600)),
            &path,
            &ExportOptions::Tiff(TiffExportOptions {
                byte_order: order,
                ..TiffExportOptions::default()
            }),
        )
        .unwrap();
        assert!(report.exif_patched);

        let exif = read_exif(&path);
        assert_eq!(
            ascii_field(&exif, exif::Tag::DateTimeOriginal),
            b"2024:05:06 07:08:09"
        );
        assert_eq!(ascii_field(&exif, exif::Tag::GPSLatitudeRef), b"N");
        assert_eq!(ascii_field(&exif, exif::Tag::Make), b"Acme");
        let exposure = exif
            .get_field(exif::Tag::ExposureTime, exif::In::PRIMARY)
            .unwrap();
        match &exposure.value {
            exif::Value::Rational(v) => assert_eq!((v[0].num, v[0].denom), (1, 250)),
            other => panic!("unexpected exposure value {:?}", other),
        }

        // The staging tag is gone and the pointer is absolute.
        let mut reader = TiffReader::open(&path).unwrap();
        assert!(reader.entry(TiffTag::PhotoshopImageResources).is_none());
        let offset = reader.exif_offset().unwrap().unwrap();
        assert!(offset < std::fs::metadata(&path).unwrap().len());
    }
}

#[test]
fn test_tiff_without_exif_needs_no_patch() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "plain.tif");
    let report = export_to(
        &memory_image(8, 8, 1, 8, 16),
        &MetadataBundle::new().with_text(TextField::Artist, "someone"),
        &path,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();
    assert!(!report.exif_patched);

    let mut reader = TiffReader::open(&path).unwrap();
    assert!(reader.exif_offset().unwrap().is_none());
    assert_eq!(
        reader.string_field(TiffTag::Artist).unwrap().as_deref(),
        Some("someone")
    );
}

#[test]
fn test_sixteen_pixel_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "scenario.tif");
    let profile: Vec<u8> = (0..64u8).collect();
    let mut exif = ExifDirectory::new();
    exif.insert(0xA002, ExifValue::Long(vec![16]));

    let image = memory_image(16, 16, 3, 8, 16);
    export_to(
        &image,
        &MetadataBundle::new()
            .with_icc(profile.clone())
            .with_exif(exif.clone()),
        &path,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let decoded = decode(&path).unwrap();
    let d = decoded.image.descriptor();
    assert_eq!((d.width, d.height, d.bands, d.bits_per_sample), (16, 16, 3, 8));
    assert!(d.tiled);
    assert_eq!(
        decoded.image.to_samples(&CancelFlag::new()).unwrap(),
        gradient(16, 16, 3, 8)
    );
    assert_eq!(decoded.metadata.exif, Some(exif));

    let mut reader = TiffReader::open(&path).unwrap();
    assert_eq!(reader.byte_field(TiffTag::IccProfile).unwrap(), Some(profile));
    let offset = reader.exif_offset().unwrap().unwrap();
    let (file, header) = reader.raw_parts();
    let ifd = raster_codec::format::tiff::Ifd::read(file, header, offset).unwrap();
    assert_eq!(ifd.entries.len(), 1);
    assert_eq!(ifd.entries[0].tag_id, 0xA002);
}

// =============================================================================
// Full Bundles
// =============================================================================

#[test]
fn test_full_bundle_round_trips_through_tiff() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "full.tif");
    let bundle = full_bundle(icc_profile(b"RGB ", 2_000));
    export_to(
        &memory_image(20, 20, 3, 8, 16),
        &bundle,
        &path,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let decoded = decode(&path).unwrap();
    assert_bundle_matches(&decoded.metadata, &bundle);
}

#[test]
fn test_full_bundle_round_trips_through_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "full.jpg");
    let bundle = full_bundle(icc_profile(b"RGB ", 2_000));
    export_to(
        &memory_image(20, 20, 3, 8, 16),
        &bundle,
        &path,
        &ExportOptions::for_format(ContainerFormat::Jpeg),
    )
    .unwrap();

    let decoded = decode(&path).unwrap();
    assert_bundle_matches(&decoded.metadata, &bundle);

    // EXIF comes first among the APP1 segments, IPTC after both.
    let data = std::fs::read(&path).unwrap();
    let header = parse_header(&data).unwrap();
    let app1: Vec<_> = header.segments.iter().filter(|s| s.marker == APP1).collect();
    assert!(app1[0].has_ident(EXIF_HEADER));
    assert!(app1[1].has_ident(XMP_NAMESPACE));
    let position = |marker: u8| header.segments.iter().position(|s| s.marker == marker);
    assert!(position(APP13) > position(APP1));

    let exif = read_exif(&path);
    assert_eq!(ascii_field(&exif, exif::Tag::Model), b"Scanner 9000");
    assert_eq!(ascii_field(&exif, exif::Tag::GPSLatitudeRef), b"N");
}

#[test]
fn test_tiff_metadata_survives_conversion_to_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let tiff = scratch_path(&dir, "source.tif");
    let jpeg = scratch_path(&dir, "converted.jpg");
    let bundle = full_bundle(icc_profile(b"RGB ", 128));
    export_to(
        &memory_image(24, 24, 3, 8, 16),
        &bundle,
        &tiff,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let decoded = decode(&tiff).unwrap();
    export_to(
        &decoded.image,
        &decoded.metadata,
        &jpeg,
        &ExportOptions::for_format(ContainerFormat::Jpeg),
    )
    .unwrap();

    assert_bundle_matches(&decode(&jpeg).unwrap().metadata, &bundle);
}
