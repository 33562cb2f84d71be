//! JPEG encode session.
//!
//! Scanlines are buffered until the session is closed, then encoded in one
//! pass. The encoder's own APPn segments are replaced by the ones added
//! through [`JpegWriter::add_segment`], in the order they were added.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use jpeg_encoder::{ColorType, Encoder, ImageBuffer, JpegColorType, SamplingFactor};
use tracing::debug;

use crate::error::{CodecError, CorruptDataError, FormatError, NativeError};
use crate::format::jpeg::{
    jfif_payload, replace_app_segments, AdobeSegment, Segment, APP0, APP12, APP14,
};

use super::NativeSession;

const ADOBE_IDENT: &[u8] = b"Adobe";

/// CMYK samples handed to the encoder exactly as given.
struct RawCmyk<'a> {
    data: &'a [u8],
    width: u16,
    height: u16,
}

impl ImageBuffer for RawCmyk<'_> {
    fn get_jpeg_color_type(&self) -> JpegColorType {
        JpegColorType::Cmyk
    }

    fn width(&self) -> u16 {
        self.width
    }

    fn height(&self) -> u16 {
        self.height
    }

    fn fill_buffers(&self, y: u16, buffers: &mut [Vec<u8>; 4]) {
        let row_len = self.width as usize * 4;
        let start = y as usize * row_len;
        for pixel in self.data[start..start + row_len].chunks_exact(4) {
            for (buffer, &sample) in buffers.iter_mut().zip(pixel) {
                buffer.push(sample);
            }
        }
    }
}

pub struct JpegWriter {
    file: File,
    width: u16,
    height: u16,
    bands: u16,
    quality: u8,
    segments: Vec<Segment>,
    pixels: Vec<u8>,
    rows: u32,
    finished: bool,
}

impl JpegWriter {
    /// # Errors
    /// `UnsupportedLayout` for dimensions beyond 65535, and
    /// `UnsupportedBandCount` for anything but 1, 3 or 4 bands.
    pub fn new(
        file: File,
        width: u32,
        height: u32,
        bands: u16,
        quality: u8,
    ) -> Result<Self, CodecError> {
        let (Ok(w), Ok(h)) = (u16::try_from(width), u16::try_from(height)) else {
            return Err(FormatError::UnsupportedLayout(format!(
                "{}x{} exceeds the JPEG size limit",
                width, height
            ))
            .into());
        };
        if w == 0 || h == 0 {
            return Err(FormatError::UnsupportedLayout(format!("empty image {}x{}", w, h)).into());
        }
        if !matches!(bands, 1 | 3 | 4) {
            return Err(FormatError::UnsupportedBandCount(bands).into());
        }
        Ok(Self {
            file,
            width: w,
            height: h,
            bands,
            quality: quality.clamp(1, 100),
            segments: Vec::new(),
            pixels: Vec::with_capacity(w as usize * h as usize * bands as usize),
            rows: 0,
            finished: false,
        })
    }

    pub fn create(
        path: &Path,
        width: u32,
        height: u32,
        bands: u16,
        quality: u8,
    ) -> Result<Self, CodecError> {
        Self::new(File::create(path)?, width, height, bands, quality)
    }

    pub fn rows_written(&self) -> u32 {
        self.rows
    }

    /// Queue an APPn segment for the output header.
    pub fn add_segment(&mut self, segment: Segment) -> Result<(), CodecError> {
        if self.rows > 0 {
            return Err(NativeError::MetadataAfterPixels.into());
        }
        self.segments.push(segment);
        Ok(())
    }

    fn row_len(&self) -> usize {
        self.width as usize * self.bands as usize
    }

    /// Append whole rows of interleaved 8-bit samples. Returns the number of
    /// rows accepted.
    pub fn write_scanlines(&mut self, data: &[u8]) -> Result<u32, CodecError> {
        let row_len = self.row_len();
        let rows = (data.len() / row_len) as u32;
        if data.len() % row_len != 0 || self.rows + rows > self.height as u32 {
            let room = (self.height as u32 - self.rows) as usize * row_len;
            return Err(CorruptDataError::ShortWrite {
                unit: "scanline",
                index: self.rows,
                expected: (rows as usize * row_len).min(room),
                actual: data.len(),
            }
            .into());
        }
        self.pixels.extend_from_slice(data);
        self.rows += rows;
        Ok(rows)
    }

    fn finish(&mut self) -> Result<(), CodecError> {
        if self.finished {
            return Ok(());
        }
        if self.rows < self.height as u32 {
            return Err(NativeError::TooFewScanlines {
                processed: self.rows,
                expected: self.height as u32,
            }
            .into());
        }
        self.finished = true;

        let has = |segments: &[Segment], marker: u8| {
            segments
                .iter()
                .any(|s| s.marker == marker && s.has_ident(ADOBE_IDENT))
        };
        if self.bands == 4 && !has(&self.segments, APP12) {
            // Stored inverted and flagged with an Adobe marker, as readers expect.
            for sample in &mut self.pixels {
                *sample = !*sample;
            }
            if !has(&self.segments, APP14) {
                self.segments
                    .push(Segment::new(APP14, AdobeSegment::cmyk().encode()));
            }
        }
        if self.bands != 4 && !self.segments.iter().any(|s| s.marker == APP0) {
            self.segments.insert(0, Segment::new(APP0, jfif_payload(None)));
        }

        let mut encoded = Vec::new();
        let mut encoder = Encoder::new(&mut encoded, self.quality);
        encoder.set_sampling_factor(SamplingFactor::F_1_1);
        let result = match self.bands {
            1 => encoder.encode(&self.pixels, self.width, self.height, ColorType::Luma),
            3 => encoder.encode(&self.pixels, self.width, self.height, ColorType::Rgb),
            _ => encoder.encode_image(RawCmyk {
                data: &self.pixels,
                width: self.width,
                height: self.height,
            }),
        };
        result.map_err(|e| NativeError::codec("jpeg", e.to_string()))?;

        let out = replace_app_segments(&encoded, &self.segments)?;
        self.file.write_all(&out)?;
        self.file.sync_all()?;
        self.pixels = Vec::new();
        debug!(
            bytes = out.len(),
            segments = self.segments.len(),
            "JPEG finalized"
        );
        Ok(())
    }
}

impl NativeSession for JpegWriter {
    fn close(&mut self) -> Result<(), CodecError> {
        self.finish()
    }
}
