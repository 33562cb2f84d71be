//! Tile decoders behind the store.
//!
//! A [`TileSource`] turns one cell of the descriptor's tile grid into a
//! [`RasterTile`] of colour bands. TIFF sources read the covering strip or
//! tile through the codec handle; JPEG sources serve bands of the decoded
//! scan; the memory source slices a raster supplied by the caller.

use std::path::Path;
use std::sync::Arc;

use crate::descriptor::FormatDescriptor;
use crate::error::{CodecError, CorruptDataError, FormatError};
use crate::export::CancelFlag;
use crate::format::tiff::{ByteOrder, ExtraSamples, PlanarConfig, SampleFormat};
use crate::native::{ChunkLayout, JpegReader, NativeCodecHandle, TiffReader};

use super::raster::{RasterTile, SampleType, Samples};

pub trait TileSource: Send + Sync {
    fn descriptor(&self) -> &FormatDescriptor;

    /// Decode tile `(tile_x, tile_y)`. Implementations check `cancel`
    /// before every native read.
    fn decode_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<RasterTile, CodecError>;

    /// Release the underlying session. Idempotent.
    fn close(&self, cancelled: bool) -> Result<(), CodecError>;

    /// File the tiles come from, if any.
    fn path(&self) -> Option<&Path> {
        None
    }
}

fn tile_rect(
    descriptor: &FormatDescriptor,
    tile_x: u32,
    tile_y: u32,
) -> Result<(u32, u32, u32, u32), CodecError> {
    descriptor.tile_rect(tile_x, tile_y).ok_or_else(|| {
        FormatError::UnsupportedLayout(format!(
            "tile ({}, {}) outside the {}x{} grid",
            tile_x,
            tile_y,
            descriptor.tiles_across(),
            descriptor.tiles_down()
        ))
        .into()
    })
}

// =============================================================================
// TIFF
// =============================================================================

pub struct TiffTileSource {
    handle: Arc<NativeCodecHandle<TiffReader>>,
    descriptor: FormatDescriptor,
    layout: ChunkLayout,
    order: ByteOrder,
}

impl TiffTileSource {
    /// # Errors
    /// `UnsupportedLayout` if the file's chunk grid does not match the
    /// descriptor's tile grid.
    pub fn new(
        handle: Arc<NativeCodecHandle<TiffReader>>,
        descriptor: FormatDescriptor,
    ) -> Result<Self, CodecError> {
        let (layout, order) =
            handle.with_session(|r| Ok((r.layout()?.clone(), r.byte_order())))?;
        if layout.chunk_width != descriptor.tile_width
            || layout.chunk_height != descriptor.tile_height
        {
            return Err(FormatError::UnsupportedLayout(format!(
                "chunk grid {}x{} does not match tile grid {}x{}",
                layout.chunk_width,
                layout.chunk_height,
                descriptor.tile_width,
                descriptor.tile_height
            ))
            .into());
        }
        Ok(Self {
            handle,
            descriptor,
            layout,
            order,
        })
    }

    fn read_planes(&self, index: u32, cancel: &CancelFlag) -> Result<Vec<Vec<u8>>, CodecError> {
        let planes = match self.layout.planar {
            PlanarConfig::Chunky => 1,
            PlanarConfig::Separate => self.layout.samples_per_pixel as u32,
        };
        (0..planes)
            .map(|plane| {
                cancel.check()?;
                let chunk = index + plane * self.layout.chunks_per_plane();
                self.handle.with_session(|r| r.read_chunk(chunk))
            })
            .collect()
    }

    fn to_u16(&self, bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|b| self.order.read_u16(b))
            .collect()
    }

    /// Pick colour bands out of the stored samples: de-interleave planes,
    /// undo associated alpha, drop extra samples, clip to the image.
    fn assemble(&self, planes: &[Vec<u8>], width: u32, height: u32) -> Samples {
        let d = &self.descriptor;
        let spp = self.layout.samples_per_pixel as usize;
        let bands = d.bands as usize;
        let bps = d.bytes_per_sample();
        let chunk_width = self.layout.chunk_width as usize;
        let planar = self.layout.planar == PlanarConfig::Separate;
        let unpremultiply =
            d.extra_samples == ExtraSamples::AssociatedAlpha && d.sample_format == SampleFormat::Uint;
        let max: u64 = if bps == 1 { 0xFF } else { 0xFFFF };

        let sample_at = |sample: usize, pixel: usize| -> u64 {
            let (buf, idx) = if planar {
                (&planes[sample], pixel)
            } else {
                (&planes[0], pixel * spp + sample)
            };
            if bps == 1 {
                buf[idx] as u64
            } else {
                self.order.read_u16(&buf[idx * 2..]) as u64
            }
        };

        let mut out = Vec::with_capacity(width as usize * height as usize * bands);
        for row in 0..height as usize {
            for col in 0..width as usize {
                let pixel = row * chunk_width + col;
                let alpha = if unpremultiply { sample_at(bands, pixel) } else { 0 };
                for band in 0..bands {
                    let value = sample_at(band, pixel);
                    let value = match (unpremultiply, alpha) {
                        (false, _) => value,
                        (true, 0) => 0,
                        (true, a) => ((value * max + a / 2) / a).min(max),
                    };
                    out.push(value as u16);
                }
            }
        }

        match SampleType::for_bits(d.bits_per_sample) {
            SampleType::U8 => Samples::U8(out.into_iter().map(|v| v as u8).collect()),
            SampleType::U16 => Samples::U16(out),
        }
    }
}

impl TileSource for TiffTileSource {
    fn descriptor(&self) -> &FormatDescriptor {
        &self.descriptor
    }

    fn decode_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<RasterTile, CodecError> {
        let (_, _, width, height) = tile_rect(&self.descriptor, tile_x, tile_y)?;
        let index = tile_y * self.layout.chunks_across() + tile_x;
        let mut planes = self.read_planes(index, cancel)?;

        let d = &self.descriptor;
        let direct = d.tiled
            && d.extra_sample_count == 0
            && self.layout.planar == PlanarConfig::Chunky
            && width == self.layout.chunk_width
            && height == self.layout.chunk_height;
        let samples = match (direct, planes.pop()) {
            (true, Some(chunk)) if d.bytes_per_sample() == 1 => Samples::U8(chunk),
            (true, Some(chunk)) => Samples::U16(self.to_u16(&chunk)),
            (_, Some(last)) => {
                planes.push(last);
                self.assemble(&planes, width, height)
            }
            (_, None) => Samples::U8(Vec::new()),
        };
        Ok(RasterTile::new(tile_x, tile_y, width, height, d.bands, samples)?)
    }

    fn close(&self, cancelled: bool) -> Result<(), CodecError> {
        self.handle.dispose(cancelled)
    }

    fn path(&self) -> Option<&Path> {
        Some(self.handle.path())
    }
}

// =============================================================================
// JPEG
// =============================================================================

pub struct JpegTileSource {
    handle: Arc<NativeCodecHandle<JpegReader>>,
    descriptor: FormatDescriptor,
    invert: bool,
}

impl JpegTileSource {
    pub fn new(
        handle: Arc<NativeCodecHandle<JpegReader>>,
        descriptor: FormatDescriptor,
    ) -> Result<Self, CodecError> {
        let invert = handle.with_session(|r| Ok(r.needs_cmyk_inversion()))?;
        Ok(Self {
            handle,
            descriptor,
            invert,
        })
    }
}

impl TileSource for JpegTileSource {
    fn descriptor(&self) -> &FormatDescriptor {
        &self.descriptor
    }

    fn decode_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<RasterTile, CodecError> {
        let (_, _, width, height) = tile_rect(&self.descriptor, tile_x, tile_y)?;
        cancel.check()?;
        let mut band = self.handle.with_session(|r| r.read_band(tile_y))?;
        if self.invert {
            band.iter_mut().for_each(|s| *s = !*s);
        }
        Ok(RasterTile::new(
            tile_x,
            tile_y,
            width,
            height,
            self.descriptor.bands,
            Samples::U8(band),
        )?)
    }

    fn close(&self, cancelled: bool) -> Result<(), CodecError> {
        self.handle.dispose(cancelled)
    }

    fn path(&self) -> Option<&Path> {
        Some(self.handle.path())
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Tiles cut from a raster held in memory.
pub struct MemoryTileSource {
    descriptor: FormatDescriptor,
    samples: Samples,
}

impl MemoryTileSource {
    /// # Errors
    /// `ShortRead` if `samples` does not cover the whole image.
    pub fn new(descriptor: FormatDescriptor, samples: Samples) -> Result<Self, CodecError> {
        let expected =
            descriptor.width as usize * descriptor.height as usize * descriptor.bands as usize;
        if samples.len() != expected
            || samples.sample_type() != SampleType::for_bits(descriptor.bits_per_sample)
        {
            return Err(CorruptDataError::ShortRead {
                unit: "image",
                index: 0,
                expected: expected * descriptor.bytes_per_sample(),
                actual: samples.byte_len(),
            }
            .into());
        }
        Ok(Self {
            descriptor,
            samples,
        })
    }
}

fn copy_rect<T: Copy>(
    src: &[T],
    image_width: usize,
    rect: (u32, u32, u32, u32),
    bands: usize,
) -> Vec<T> {
    let (x, y, w, h) = rect;
    let mut out = Vec::with_capacity(w as usize * h as usize * bands);
    for row in y as usize..(y + h) as usize {
        let start = (row * image_width + x as usize) * bands;
        out.extend_from_slice(&src[start..start + w as usize * bands]);
    }
    out
}

impl TileSource for MemoryTileSource {
    fn descriptor(&self) -> &FormatDescriptor {
        &self.descriptor
    }

    fn decode_tile(
        &self,
        tile_x: u32,
        tile_y: u32,
        cancel: &CancelFlag,
    ) -> Result<RasterTile, CodecError> {
        let rect = tile_rect(&self.descriptor, tile_x, tile_y)?;
        cancel.check()?;
        let width = self.descriptor.width as usize;
        let bands = self.descriptor.bands as usize;
        let samples = match &self.samples {
            Samples::U8(v) => Samples::U8(copy_rect(v, width, rect, bands)),
            Samples::U16(v) => Samples::U16(copy_rect(v, width, rect, bands)),
        };
        Ok(RasterTile::new(
            tile_x,
            tile_y,
            rect.2,
            rect.3,
            self.descriptor.bands,
            samples,
        )?)
    }

    fn close(&self, _cancelled: bool) -> Result<(), CodecError> {
        Ok(())
    }
}
