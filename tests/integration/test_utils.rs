//! Test utilities for integration tests.
//!
//! This module provides synthetic rasters, instrumented tile sources and a
//! hand-rolled TIFF byte builder for layouts the crate's writer never
//! produces (BigTIFF, planar-separate, big-endian hand-made files).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use raster_codec::error::{CodecError, CorruptDataError};
use raster_codec::tile::MemoryTileSource;
use raster_codec::{
    encode, CancelFlag, ExportOptions, ExportReport, FormatDescriptor, MetadataBundle,
    NoProgress, RasterImage, RasterTile, Samples, TileSource, TileStore,
};

// =============================================================================
// Synthetic Rasters
// =============================================================================

/// Deterministic samples that differ per pixel and per band.
pub fn gradient(width: u32, height: u32, bands: u16, bits: u16) -> Samples {
    let mut values = Vec::with_capacity((width * height) as usize * bands as usize);
    for y in 0..height {
        for x in 0..width {
            for b in 0..bands as u32 {
                values.push(x * 7 + y * 13 + b * 61);
            }
        }
    }
    if bits == 16 {
        Samples::U16(values.iter().map(|v| (v * 257) as u16).collect())
    } else {
        Samples::U8(values.iter().map(|v| (v % 256) as u8).collect())
    }
}

/// A smooth image that survives lossy JPEG coding within a small tolerance.
pub fn smooth(width: u32, height: u32, bands: u16) -> Vec<u8> {
    let mut values = Vec::with_capacity((width * height) as usize * bands as usize);
    for y in 0..height {
        for x in 0..width {
            for b in 0..bands as u32 {
                values.push((64 + x / 4 + y / 4 + b * 30).min(255) as u8);
            }
        }
    }
    values
}

pub fn descriptor(width: u32, height: u32, bands: u16, bits: u16, tile: u32) -> FormatDescriptor {
    FormatDescriptor::for_raster(width, height, bands, bits, None, (tile, tile)).unwrap()
}

/// An in-memory image with its own store.
pub fn memory_image(width: u32, height: u32, bands: u16, bits: u16, tile: u32) -> RasterImage {
    RasterImage::from_samples(
        descriptor(width, height, bands, bits, tile),
        gradient(width, height, bands, bits),
        Arc::new(TileStore::in_memory()),
    )
    .unwrap()
}

/// Export with no progress reporting and no cancellation.
pub fn export_to(
    image: &RasterImage,
    metadata: &MetadataBundle,
    path: &Path,
    options: &ExportOptions,
) -> Result<ExportReport, CodecError> {
    encode(
        image,
        metadata,
        path,
        options,
        &mut NoProgress,
        &CancelFlag::new(),
    )
}

pub fn close_enough(a: &[u8], b: &[u8], tolerance: u8) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.abs_diff(*y) <= tolerance)
}

/// Names of every entry in `dir`, sorted.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// A valid ICC profile of `len` bytes (at least the 128-byte header).
pub fn icc_profile(space: &[u8; 4], len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len.max(128)];
    let n = bytes.len() as u32;
    bytes[0..4].copy_from_slice(&n.to_be_bytes());
    bytes[16..20].copy_from_slice(space);
    bytes[36..40].copy_from_slice(b"acsp");
    for (i, b) in bytes.iter_mut().enumerate().skip(128) {
        *b = (i * 31 % 253) as u8;
    }
    bytes
}

pub fn scratch_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

// =============================================================================
// Instrumented Tile Sources
// =============================================================================

/// Counts decodes and can slow each one down.
pub struct CountingSource {
    inner: MemoryTileSource,
    decodes: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingSource {
    pub fn new(descriptor: FormatDescriptor, samples: Samples, delay: Duration) -> Self {
        Self {
            inner: MemoryTileSource::new(descriptor, samples).unwrap(),
            decodes: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.decodes)
    }
}

impl TileSource for CountingSource {
    fn descriptor(&self) -> &FormatDescriptor {
        self.inner.descriptor()
    }

    fn decode_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<RasterTile, CodecError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.decode_tile(tile_x, tile_y, cancel)
    }

    fn close(&self, cancelled: bool) -> Result<(), CodecError> {
        self.inner.close(cancelled)
    }
}

/// Fails every decode from the `fail_at`-th on (zero-based) with a short read.
pub struct FailingSource {
    inner: MemoryTileSource,
    calls: AtomicUsize,
    fail_at: usize,
}

impl FailingSource {
    pub fn new(descriptor: FormatDescriptor, samples: Samples, fail_at: usize) -> Self {
        Self {
            inner: MemoryTileSource::new(descriptor, samples).unwrap(),
            calls: AtomicUsize::new(0),
            fail_at,
        }
    }
}

impl TileSource for FailingSource {
    fn descriptor(&self) -> &FormatDescriptor {
        self.inner.descriptor()
    }

    fn decode_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<RasterTile, CodecError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_at {
            return Err(CorruptDataError::ShortRead {
                unit: "tile",
                index: tile_y,
                expected: 1024,
                actual: 17,
            }
            .into());
        }
        self.inner.decode_tile(tile_x, tile_y, cancel)
    }

    fn close(&self, cancelled: bool) -> Result<(), CodecError> {
        self.inner.close(cancelled)
    }
}

/// Raises `cancel` once `limit` tiles have been decoded.
pub struct CancelAfter {
    inner: MemoryTileSource,
    calls: AtomicUsize,
    limit: usize,
    cancel: CancelFlag,
}

impl CancelAfter {
    pub fn new(
        descriptor: FormatDescriptor,
        samples: Samples,
        limit: usize,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            inner: MemoryTileSource::new(descriptor, samples).unwrap(),
            calls: AtomicUsize::new(0),
            limit,
            cancel,
        }
    }
}

impl TileSource for CancelAfter {
    fn descriptor(&self) -> &FormatDescriptor {
        self.inner.descriptor()
    }

    fn decode_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<RasterTile, CodecError> {
        let tile = self.inner.decode_tile(tile_x, tile_y, cancel)?;
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            self.cancel.cancel();
        }
        Ok(tile)
    }

    fn close(&self, cancelled: bool) -> Result<(), CodecError> {
        self.inner.close(cancelled)
    }
}

// =============================================================================
// Synthetic TIFF Files
// =============================================================================

/// Layout of a hand-built, uncompressed 8-bit TIFF.
#[derive(Debug, Clone, Copy)]
pub struct RawTiff {
    pub big_endian: bool,
    pub bigtiff: bool,
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub planar_separate: bool,
}

struct Out {
    big_endian: bool,
    buf: Vec<u8>,
}

impl Out {
    fn u16(&mut self, v: u16) {
        let b = if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
        self.buf.extend_from_slice(&b);
    }

    fn u32(&mut self, v: u32) {
        let b = if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
        self.buf.extend_from_slice(&b);
    }

    fn u64(&mut self, v: u64) {
        let b = if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
        self.buf.extend_from_slice(&b);
    }

    fn shorts(&self, values: &[u16]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() })
            .collect()
    }

    fn longs(&self, values: &[u32]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| if self.big_endian { v.to_be_bytes() } else { v.to_le_bytes() })
            .collect()
    }
}

impl RawTiff {
    /// Encode `pixels` (chunky, `width * height * bands` bytes) as a
    /// single-directory TIFF with one strip per plane.
    pub fn build(&self, pixels: &[u8]) -> Vec<u8> {
        let plane_len = (self.width * self.height) as usize;
        assert_eq!(pixels.len(), plane_len * self.bands as usize);

        let planes: Vec<Vec<u8>> = if self.planar_separate {
            (0..self.bands as usize)
                .map(|b| {
                    pixels
                        .iter()
                        .skip(b)
                        .step_by(self.bands as usize)
                        .copied()
                        .collect()
                })
                .collect()
        } else {
            vec![pixels.to_vec()]
        };

        let mut out = Out {
            big_endian: self.big_endian,
            buf: Vec::new(),
        };
        let header_len: u64 = if self.bigtiff { 16 } else { 8 };
        let inline_len = if self.bigtiff { 8 } else { 4 };

        // Pixel data right after the header.
        let mut strip_offsets = Vec::new();
        let mut strip_counts = Vec::new();
        let mut cursor = header_len;
        for plane in &planes {
            strip_offsets.push(cursor as u32);
            strip_counts.push(plane.len() as u32);
            cursor += plane.len() as u64;
        }

        let photometric = if self.bands == 1 { 1 } else { 2 };
        let mut entries: Vec<(u16, u16, u64, Vec<u8>)> = vec![
            (256, 4, 1, out.longs(&[self.width])),
            (257, 4, 1, out.longs(&[self.height])),
            (258, 3, self.bands as u64, out.shorts(&vec![8; self.bands as usize])),
            (259, 3, 1, out.shorts(&[1])),
            (262, 3, 1, out.shorts(&[photometric])),
            (273, 4, strip_offsets.len() as u64, out.longs(&strip_offsets)),
            (277, 3, 1, out.shorts(&[self.bands])),
            (278, 4, 1, out.longs(&[self.height])),
            (279, 4, strip_counts.len() as u64, out.longs(&strip_counts)),
            (284, 3, 1, out.shorts(&[if self.planar_separate { 2 } else { 1 }])),
        ];
        entries.sort_by_key(|e| e.0);

        // Out-of-line values after the pixel data, then the directory.
        let mut value_offsets = Vec::new();
        let mut extra = Vec::new();
        for (_, _, _, data) in &entries {
            if data.len() > inline_len {
                value_offsets.push(Some(cursor + extra.len() as u64));
                extra.extend_from_slice(data);
                if extra.len() % 2 == 1 {
                    extra.push(0);
                }
            } else {
                value_offsets.push(None);
            }
        }
        let mut ifd_offset = cursor + extra.len() as u64;
        if ifd_offset % 2 == 1 {
            extra.push(0);
            ifd_offset += 1;
        }

        out.buf
            .extend_from_slice(if self.big_endian { b"MM" } else { b"II" });
        if self.bigtiff {
            out.u16(43);
            out.u16(8);
            out.u16(0);
            out.u64(ifd_offset);
        } else {
            out.u16(42);
            out.u32(ifd_offset as u32);
        }
        for plane in &planes {
            out.buf.extend_from_slice(plane);
        }
        out.buf.extend_from_slice(&extra);

        if self.bigtiff {
            out.u64(entries.len() as u64);
        } else {
            out.u16(entries.len() as u16);
        }
        for ((tag, field_type, count, data), offset) in entries.iter().zip(&value_offsets) {
            out.u16(*tag);
            out.u16(*field_type);
            if self.bigtiff {
                out.u64(*count);
            } else {
                out.u32(*count as u32);
            }
            match offset {
                Some(offset) if self.bigtiff => out.u64(*offset),
                Some(offset) => out.u32(*offset as u32),
                None => {
                    let mut value = data.clone();
                    value.resize(inline_len, 0);
                    out.buf.extend_from_slice(&value);
                }
            }
        }
        if self.bigtiff {
            out.u64(0);
        } else {
            out.u32(0);
        }
        out.buf
    }
}
