//! Pixel round trips through both containers.
//!
//! Tests verify:
//! - TIFF output decodes bit-exact for every depth, band count and layout
//! - Both byte orders, all three compressions and BigTIFF input are read
//! - Planar-separate input is interleaved on decode
//! - JPEG output stays within lossy tolerance; CMYK is stored inverted
//! - Layered two-page TIFF output

use raster_codec::format::jpeg::{parse_header, AdobeSegment};
use raster_codec::native::JpegReader;
use raster_codec::{
    decode, decode_with, ByteOrder, CancelFlag, ColorSpace, Compression, ContainerFormat,
    DecodeOptions, ExportOptions, JpegExportOptions, MetadataBundle, Samples,
    TiffExportOptions, TiffLayout,
};

use super::test_utils::{
    close_enough, export_to, gradient, memory_image, scratch_path, smooth, RawTiff,
};

fn tiff_options(layout: TiffLayout, order: ByteOrder, compression: Compression) -> ExportOptions {
    ExportOptions::Tiff(TiffExportOptions {
        layout: Some(layout),
        compression,
        byte_order: order,
        ..TiffExportOptions::default()
    })
}

// =============================================================================
// TIFF Round Trips
// =============================================================================

#[test]
fn test_tiff_round_trip_is_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let layouts = [
        TiffLayout::Strips { rows_per_strip: 5 },
        TiffLayout::Tiles {
            width: 16,
            height: 16,
        },
    ];

    for bits in [8u16, 16] {
        for bands in [1u16, 3, 4] {
            for (i, layout) in layouts.iter().enumerate() {
                // Odd sizes leave partial edge strips and tiles.
                let image = memory_image(37, 23, bands, bits, 16);
                let order = if i == 0 {
                    ByteOrder::LittleEndian
                } else {
                    ByteOrder::BigEndian
                };
                let path = scratch_path(&dir, &format!("rt-{}-{}-{}.tif", bits, bands, i));
                export_to(
                    &image,
                    &MetadataBundle::new(),
                    &path,
                    &tiff_options(*layout, order, Compression::Deflate),
                )
                .unwrap();

                let decoded = decode(&path).unwrap();
                let d = decoded.image.descriptor();
                assert_eq!((d.width, d.height), (37, 23));
                assert_eq!(d.bands, bands);
                assert_eq!(d.bits_per_sample, bits);
                assert_eq!(d.tiled, matches!(layout, TiffLayout::Tiles { .. }));
                assert_eq!(
                    decoded.image.to_samples(&CancelFlag::new()).unwrap(),
                    gradient(37, 23, bands, bits),
                    "bits={} bands={} layout={:?}",
                    bits,
                    bands,
                    layout
                );
            }
        }
    }
}

#[test]
fn test_tiff_colorspace_by_band_count() {
    let dir = tempfile::tempdir().unwrap();
    let expected = [
        (1u16, ColorSpace::Gray),
        (3, ColorSpace::Srgb),
        (4, ColorSpace::Cmyk),
    ];
    for (bands, colorspace) in expected {
        let path = scratch_path(&dir, &format!("cs-{}.tif", bands));
        export_to(
            &memory_image(8, 8, bands, 8, 16),
            &MetadataBundle::new(),
            &path,
            &ExportOptions::for_format(ContainerFormat::Tiff),
        )
        .unwrap();
        assert_eq!(decode(&path).unwrap().image.descriptor().colorspace, colorspace);
    }
}

#[test]
fn test_tiff_compressions_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let image = memory_image(40, 12, 3, 8, 16);
    let expected = gradient(40, 12, 3, 8);
    let mut sizes = Vec::new();

    for compression in [Compression::None, Compression::Deflate, Compression::PackBits] {
        let path = scratch_path(&dir, &format!("{}.tif", compression.name()));
        let report = export_to(
            &image,
            &MetadataBundle::new(),
            &path,
            &tiff_options(
                TiffLayout::Strips { rows_per_strip: 4 },
                ByteOrder::LittleEndian,
                compression,
            ),
        )
        .unwrap();
        sizes.push(report.bytes);
        let decoded = decode(&path).unwrap();
        assert_eq!(
            decoded.image.to_samples(&CancelFlag::new()).unwrap(),
            expected
        );
    }
    // Uncompressed output holds at least the raw samples.
    assert!(sizes[0] >= 40 * 12 * 3);
}

#[test]
fn test_tiff_default_layout_follows_source_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "default.tif");
    export_to(
        &memory_image(50, 20, 1, 8, 20),
        &MetadataBundle::new(),
        &path,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let decoded = decode(&path).unwrap();
    let d = decoded.image.descriptor();
    assert!(d.tiled);
    assert_eq!((d.tile_width, d.tile_height), (32, 32));
    assert_eq!((decoded.image.tiles_across(), decoded.image.tiles_down()), (2, 1));
}

// =============================================================================
// Hand-built Input
// =============================================================================

#[test]
fn test_reads_bigtiff_both_orders() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = (0..6 * 4 * 3).map(|i| (i * 5) as u8).collect();

    for big_endian in [false, true] {
        let raw = RawTiff {
            big_endian,
            bigtiff: true,
            width: 6,
            height: 4,
            bands: 3,
            planar_separate: false,
        };
        let path = scratch_path(&dir, &format!("big-{}.tif", big_endian));
        std::fs::write(&path, raw.build(&pixels)).unwrap();

        let decoded = decode(&path).unwrap();
        assert_eq!(decoded.image.descriptor().bands, 3);
        assert_eq!(
            decoded.image.to_samples(&CancelFlag::new()).unwrap(),
            Samples::U8(pixels.clone())
        );
    }
}

#[test]
fn test_planar_separate_is_interleaved() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = (0..5 * 3 * 3).map(|i| (i * 3 + 1) as u8).collect();
    let raw = RawTiff {
        big_endian: true,
        bigtiff: false,
        width: 5,
        height: 3,
        bands: 3,
        planar_separate: true,
    };
    let path = scratch_path(&dir, "planar.tif");
    std::fs::write(&path, raw.build(&pixels)).unwrap();

    let decoded = decode(&path).unwrap();
    assert_eq!(
        decoded.image.to_samples(&CancelFlag::new()).unwrap(),
        Samples::U8(pixels)
    );
}

#[test]
fn test_planar_input_exports_chunky() {
    let dir = tempfile::tempdir().unwrap();
    let pixels: Vec<u8> = (0..8 * 8 * 3).map(|i| (i % 256) as u8).collect();
    let raw = RawTiff {
        big_endian: false,
        bigtiff: false,
        width: 8,
        height: 8,
        bands: 3,
        planar_separate: true,
    };
    let input = scratch_path(&dir, "planar.tif");
    let output = scratch_path(&dir, "chunky.tif");
    std::fs::write(&input, raw.build(&pixels)).unwrap();

    let decoded = decode(&input).unwrap();
    export_to(
        &decoded.image,
        &decoded.metadata,
        &output,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let again = decode(&output).unwrap();
    assert_eq!(
        again.image.to_samples(&CancelFlag::new()).unwrap(),
        Samples::U8(pixels)
    );
}

// =============================================================================
// JPEG
// =============================================================================

fn jpeg_image(width: u32, height: u32, bands: u16) -> raster_codec::RasterImage {
    raster_codec::RasterImage::from_samples(
        super::test_utils::descriptor(width, height, bands, 8, 16),
        Samples::U8(smooth(width, height, bands)),
        std::sync::Arc::new(raster_codec::TileStore::in_memory()),
    )
    .unwrap()
}

#[test]
fn test_jpeg_round_trip_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    for bands in [1u16, 3] {
        let path = scratch_path(&dir, &format!("smooth-{}.jpg", bands));
        export_to(
            &jpeg_image(48, 40, bands),
            &MetadataBundle::new(),
            &path,
            &ExportOptions::Jpeg(JpegExportOptions { quality: 100 }),
        )
        .unwrap();

        let decoded = decode(&path).unwrap();
        let d = decoded.image.descriptor();
        assert_eq!(d.container, Some(ContainerFormat::Jpeg));
        assert_eq!((d.width, d.height, d.bands), (48, 40, bands));
        let Samples::U8(pixels) = decoded.image.to_samples(&CancelFlag::new()).unwrap() else {
            panic!("JPEG decodes to 8-bit samples");
        };
        assert!(close_enough(&pixels, &smooth(48, 40, bands), 6));
    }
}

#[test]
fn test_cmyk_jpeg_inverts_on_both_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "cmyk.jpg");
    let pixel = [20u8, 90, 160, 230];
    let image = raster_codec::RasterImage::from_samples(
        super::test_utils::descriptor(16, 16, 4, 8, 16),
        Samples::U8(pixel.repeat(256)),
        std::sync::Arc::new(raster_codec::TileStore::in_memory()),
    )
    .unwrap();
    export_to(
        &image,
        &MetadataBundle::new(),
        &path,
        &ExportOptions::Jpeg(JpegExportOptions { quality: 100 }),
    )
    .unwrap();

    // Stored samples are inverted, flagged by an Adobe marker with transform 0.
    let data = std::fs::read(&path).unwrap();
    let header = parse_header(&data).unwrap();
    assert_eq!(header.adobe(), Some(AdobeSegment::cmyk()));
    assert!(!header.has_adobe_embed());

    let mut reader = JpegReader::open(&path).unwrap();
    assert!(reader.needs_cmyk_inversion());
    let inverted: Vec<u8> = pixel.iter().map(|v| !v).collect();
    assert!(close_enough(&reader.read_band(0).unwrap(), &inverted.repeat(256), 3));

    // The decode path undoes it.
    let decoded = decode(&path).unwrap();
    assert_eq!(decoded.image.descriptor().colorspace, ColorSpace::Cmyk);
    let Samples::U8(pixels) = decoded.image.to_samples(&CancelFlag::new()).unwrap() else {
        panic!("JPEG decodes to 8-bit samples");
    };
    assert!(close_enough(&pixels, &pixel.repeat(256), 3));
}

#[test]
fn test_jpeg_to_tiff_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let jpeg = scratch_path(&dir, "in.jpg");
    let tiff = scratch_path(&dir, "out.tif");
    export_to(
        &jpeg_image(30, 700, 3),
        &MetadataBundle::new(),
        &jpeg,
        &ExportOptions::for_format(ContainerFormat::Jpeg),
    )
    .unwrap();

    // 700 rows span two 512-row JPEG bands.
    let decoded = decode(&jpeg).unwrap();
    assert_eq!(decoded.image.tiles_down(), 2);
    let from_jpeg = decoded.image.to_samples(&CancelFlag::new()).unwrap();
    export_to(
        &decoded.image,
        &decoded.metadata,
        &tiff,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let again = decode(&tiff).unwrap();
    assert_eq!(again.image.to_samples(&CancelFlag::new()).unwrap(), from_jpeg);
}

// =============================================================================
// Layered TIFF
// =============================================================================

#[test]
fn test_layered_tiff_pages() {
    let dir = tempfile::tempdir().unwrap();
    let under = scratch_path(&dir, "under.tif");
    let layered = scratch_path(&dir, "layered.tif");

    export_to(
        &memory_image(20, 10, 1, 8, 16),
        &MetadataBundle::new(),
        &under,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();

    let top = memory_image(24, 12, 3, 16, 16);
    export_to(
        &top,
        &MetadataBundle::new(),
        &layered,
        &ExportOptions::Tiff(TiffExportOptions {
            append_page: Some(under.clone()),
            ..TiffExportOptions::default()
        }),
    )
    .unwrap();

    let page1 = decode(&layered).unwrap();
    let d = page1.image.descriptor();
    assert!(d.layered);
    assert_eq!((d.page, d.page_count), (0, 2));
    assert_eq!(
        page1.image.to_samples(&CancelFlag::new()).unwrap(),
        gradient(24, 12, 3, 16)
    );

    let page2 = decode_with(
        &layered,
        &DecodeOptions {
            page: 1,
            store: None,
        },
    )
    .unwrap();
    assert_eq!(page2.image.descriptor().page, 1);
    assert_eq!(
        page2.image.to_samples(&CancelFlag::new()).unwrap(),
        gradient(20, 10, 1, 8)
    );
}

#[test]
fn test_single_page_tiff_is_not_layered() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch_path(&dir, "single.tif");
    export_to(
        &memory_image(8, 8, 1, 8, 16),
        &MetadataBundle::new(),
        &path,
        &ExportOptions::for_format(ContainerFormat::Tiff),
    )
    .unwrap();
    let d = decode(&path).unwrap();
    assert!(!d.image.descriptor().layered);
    assert_eq!(d.image.descriptor().page_count, 1);
}
