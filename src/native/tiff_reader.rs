//! TIFF decode session.
//!
//! Opens the file, walks the directory chain once, and serves decompressed
//! strips and tiles of the selected directory by index. Planar-separate
//! files number their chunks plane by plane, as in the file.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::warn;

use crate::descriptor::HeaderFields;
use crate::error::{CodecError, CorruptDataError, FormatError, TiffError};
use crate::format::tiff::{
    decompress, ByteOrder, Compression, Ifd, IfdEntry, PlanarConfig, TiffHeader, TiffTag,
    ValueReader,
};
use crate::format::ContainerFormat;
use crate::io::RandomRead;
use crate::metadata::{
    ExifDirectory, IptcDirectory, MetadataBundle, Resolution, ResolutionUnit, TextField,
    XmpPacket,
};
use crate::SOFTWARE_NAME;

use super::NativeSession;

/// Where the compressed chunks of one directory live and how big each one
/// decodes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    pub width: u32,
    pub height: u32,
    pub tiled: bool,
    pub chunk_width: u32,
    pub chunk_height: u32,
    pub samples_per_pixel: u16,
    pub bytes_per_sample: usize,
    pub planar: PlanarConfig,
    pub compression: Compression,
    pub offsets: Vec<u64>,
    pub byte_counts: Vec<u64>,
}

impl ChunkLayout {
    pub fn chunks_across(&self) -> u32 {
        self.width.div_ceil(self.chunk_width)
    }

    pub fn chunks_down(&self) -> u32 {
        self.height.div_ceil(self.chunk_height)
    }

    /// Chunks per plane.
    pub fn chunks_per_plane(&self) -> u32 {
        self.chunks_across() * self.chunks_down()
    }

    /// Samples stored per pixel within one chunk.
    pub fn samples_per_chunk(&self) -> usize {
        match self.planar {
            PlanarConfig::Chunky => self.samples_per_pixel as usize,
            PlanarConfig::Separate => 1,
        }
    }

    /// Decoded size of chunk `index`. The last strip of a plane may be
    /// short; tiles are always full size.
    pub fn expected_len(&self, index: u32) -> usize {
        let rows = if self.tiled {
            self.chunk_height
        } else {
            let strip = index % self.chunks_per_plane();
            self.chunk_height
                .min(self.height.saturating_sub(strip * self.chunk_height))
        };
        self.chunk_width as usize * rows as usize * self.samples_per_chunk() * self.bytes_per_sample
    }
}

/// Reader session over one TIFF file.
pub struct TiffReader {
    reader: BufReader<File>,
    header: TiffHeader,
    directories: Vec<Ifd>,
    current: usize,
    layout: Option<ChunkLayout>,
}

impl TiffReader {
    /// Open `path` and read its directory chain.
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = TiffHeader::read(&mut reader)?;
        let directories = Ifd::read_chain(&mut reader, &header)?;
        if directories.is_empty() {
            return Err(TiffError::MissingTag("image directory").into());
        }
        Ok(Self {
            reader,
            header,
            directories,
            current: 0,
            layout: None,
        })
    }

    pub fn header(&self) -> &TiffHeader {
        &self.header
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    pub fn directory_count(&self) -> usize {
        self.directories.len()
    }

    pub fn current_directory(&self) -> usize {
        self.current
    }

    /// Make directory `index` (zero-based) the current one.
    pub fn select_directory(&mut self, index: usize) -> Result<(), CodecError> {
        if index >= self.directories.len() {
            return Err(FormatError::UnsupportedLayout(format!(
                "page {} requested, file has {}",
                index + 1,
                self.directories.len()
            ))
            .into());
        }
        if index != self.current {
            self.current = index;
            self.layout = None;
        }
        Ok(())
    }

    pub fn directory(&self) -> &Ifd {
        &self.directories[self.current]
    }

    pub fn entry(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.directory().get_entry(tag)
    }

    fn with_entry<T>(
        &mut self,
        tag: TiffTag,
        read: impl FnOnce(&mut ValueReader<'_, BufReader<File>>, &IfdEntry) -> Result<T, CodecError>,
    ) -> Result<Option<T>, CodecError> {
        let Some(entry) = self.directories[self.current].get_entry(tag).cloned() else {
            return Ok(None);
        };
        let mut values = ValueReader::new(&mut self.reader, &self.header);
        read(&mut values, &entry).map(Some)
    }

    // ---- Field accessors ----

    pub fn int_field(&mut self, tag: TiffTag) -> Result<Option<u32>, CodecError> {
        self.with_entry(tag, |v, e| v.read_u32(e))
    }

    pub fn int_array(&mut self, tag: TiffTag) -> Result<Option<Vec<u64>>, CodecError> {
        self.with_entry(tag, |v, e| v.read_u64_array(e))
    }

    pub fn shorts(&mut self, tag: TiffTag) -> Result<Option<Vec<u16>>, CodecError> {
        self.with_entry(tag, |v, e| v.read_u16_array(e))
    }

    /// Two-value Short field such as PageNumber.
    pub fn int_pair(&mut self, tag: TiffTag) -> Result<Option<(u16, u16)>, CodecError> {
        Ok(self.shorts(tag)?.and_then(|v| match v.as_slice() {
            [a, b, ..] => Some((*a, *b)),
            _ => None,
        }))
    }

    pub fn string_field(&mut self, tag: TiffTag) -> Result<Option<String>, CodecError> {
        self.with_entry(tag, |v, e| v.read_string(e))
    }

    /// Raw value bytes, any field type.
    pub fn byte_field(&mut self, tag: TiffTag) -> Result<Option<Vec<u8>>, CodecError> {
        self.with_entry(tag, |v, e| v.read_bytes(e).map(|b| b.to_vec()))
    }

    /// Raw value bytes of any entry of the current directory, tag known or not.
    pub fn entry_bytes(&mut self, entry: &IfdEntry) -> Result<Vec<u8>, CodecError> {
        let mut values = ValueReader::new(&mut self.reader, &self.header);
        Ok(values.read_bytes(entry)?.to_vec())
    }

    pub fn rational(&mut self, tag: TiffTag) -> Result<Option<f64>, CodecError> {
        self.with_entry(tag, |v, e| v.read_rational(e))
    }

    /// Offset of the EXIF sub-IFD of the current directory, if any.
    pub fn exif_offset(&mut self) -> Result<Option<u64>, CodecError> {
        Ok(self.int_field(TiffTag::ExifIfd)?.map(u64::from))
    }

    pub fn gps_offset(&mut self) -> Result<Option<u64>, CodecError> {
        Ok(self.int_field(TiffTag::GpsIfd)?.map(u64::from))
    }

    /// Collect the metadata tags of the current directory. Malformed blocks
    /// are dropped with a warning; they never fail the decode.
    pub fn metadata(&mut self) -> Result<MetadataBundle, CodecError> {
        let mut bundle = MetadataBundle::new();

        for field in TextField::ALL {
            if let Some(value) = self.string_field(field.tag())? {
                bundle.text.insert(field, value);
            }
        }

        if let (Some(x), Some(y)) = (
            self.rational(TiffTag::XResolution)?,
            self.rational(TiffTag::YResolution)?,
        ) {
            let unit = self
                .shorts(TiffTag::ResolutionUnit)?
                .and_then(|v| v.first().copied())
                .map_or(ResolutionUnit::Inch, ResolutionUnit::from_u16);
            bundle.resolution = Some(Resolution { x, y, unit });
        }

        bundle.icc = self.byte_field(TiffTag::IccProfile)?;

        if let Some(bytes) = self.byte_field(TiffTag::XmpPacket)? {
            match XmpPacket::from_bytes(&bytes) {
                Ok(xmp) => bundle.xmp = Some(xmp),
                Err(e) => warn!(error = %e, "ignoring malformed XMP packet"),
            }
        }

        if let Some(bytes) = self.byte_field(TiffTag::RichTiffIptc)? {
            match IptcDirectory::parse_iim(&bytes) {
                Ok(iptc) if !iptc.is_empty() => bundle.iptc = Some(iptc),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ignoring malformed IPTC block"),
            }
        }

        if let Some(offset) = self.exif_offset()? {
            match ExifDirectory::read(&mut self.reader, &self.header, offset) {
                Ok(exif) => bundle.exif = Some(exif),
                Err(e) => warn!(offset, error = %e, "ignoring unreadable EXIF directory"),
            }
        }
        if let Some(offset) = self.gps_offset()? {
            let exif = bundle.exif.get_or_insert_with(ExifDirectory::new);
            if let Err(e) = exif.read_gps(&mut self.reader, &self.header, offset) {
                warn!(offset, error = %e, "ignoring unreadable GPS directory");
            }
        }
        Ok(bundle)
    }

    /// Borrow the underlying reader for sub-IFD walks.
    pub fn raw_parts(&mut self) -> (&mut BufReader<File>, &TiffHeader) {
        (&mut self.reader, &self.header)
    }

    // ---- Layout ----

    /// Whether this file was written by this crate as a two-page layered
    /// image: Software carries the crate name and PageNumber counts 2.
    pub fn is_layered(&mut self) -> Result<bool, CodecError> {
        let software = self.string_field(TiffTag::Software)?;
        let pages = self.int_pair(TiffTag::PageNumber)?;
        Ok(software.map_or(false, |s| s.starts_with(SOFTWARE_NAME))
            && pages.map_or(false, |(_, total)| total == 2))
    }

    /// Collect the header fields of the current directory.
    pub fn header_fields(&mut self) -> Result<HeaderFields, CodecError> {
        let width = self
            .int_field(TiffTag::ImageWidth)?
            .ok_or(TiffError::MissingTag("ImageWidth"))?;
        let height = self
            .int_field(TiffTag::ImageLength)?
            .ok_or(TiffError::MissingTag("ImageLength"))?;
        let samples_per_pixel = self.int_field(TiffTag::SamplesPerPixel)?.unwrap_or(1) as u16;

        let bits = self.shorts(TiffTag::BitsPerSample)?.unwrap_or_else(|| vec![1]);
        let bits_per_sample = bits.first().copied().unwrap_or(1);
        if bits.iter().any(|&b| b != bits_per_sample) {
            return Err(FormatError::UnsupportedLayout(format!(
                "mixed bits per sample {:?}",
                bits
            ))
            .into());
        }
        let sample_format = self
            .shorts(TiffTag::SampleFormat)?
            .and_then(|v| v.first().copied());

        let tile_size = match (
            self.int_field(TiffTag::TileWidth)?,
            self.int_field(TiffTag::TileLength)?,
        ) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        };

        let layered = self.current == 0 && self.is_layered()?;

        Ok(HeaderFields {
            container: Some(ContainerFormat::Tiff),
            width,
            height,
            bits_per_sample,
            samples_per_pixel,
            sample_format,
            extra_samples: self.shorts(TiffTag::ExtraSamples)?.unwrap_or_default(),
            photometric: self
                .int_field(TiffTag::PhotometricInterpretation)?
                .map(|v| v as u16),
            planar_config: self
                .int_field(TiffTag::PlanarConfiguration)?
                .map(|v| v as u16),
            tile_size,
            rows_per_strip: self.int_field(TiffTag::RowsPerStrip)?,
            icc_profile: self.byte_field(TiffTag::IccProfile)?,
            page: self.current as u32,
            page_count: self.directories.len() as u32,
            layered,
        })
    }

    /// Chunk layout of the current directory, computed once.
    pub fn layout(&mut self) -> Result<&ChunkLayout, CodecError> {
        if self.layout.is_none() {
            let layout = self.read_layout()?;
            self.layout = Some(layout);
        }
        match &self.layout {
            Some(layout) => Ok(layout),
            None => Err(TiffError::MissingTag("chunk layout").into()),
        }
    }

    fn read_layout(&mut self) -> Result<ChunkLayout, CodecError> {
        let fields = self.header_fields()?;
        let raw_compression = self.int_field(TiffTag::Compression)?.unwrap_or(1) as u16;
        let compression = Compression::from_u16(raw_compression)
            .filter(|c| c.is_supported())
            .ok_or_else(|| {
                TiffError::UnsupportedCompression(
                    Compression::from_u16(raw_compression)
                        .map_or_else(|| format!("code {}", raw_compression), |c| c.name().to_string()),
                )
            })?;

        let (tiled, chunk_width, chunk_height, offsets_tag, counts_tag) = match fields.tile_size {
            Some((w, h)) => (true, w, h, TiffTag::TileOffsets, TiffTag::TileByteCounts),
            None => {
                let rows = fields
                    .rows_per_strip
                    .filter(|&r| r > 0)
                    .unwrap_or(fields.height)
                    .min(fields.height);
                (
                    false,
                    fields.width,
                    rows,
                    TiffTag::StripOffsets,
                    TiffTag::StripByteCounts,
                )
            }
        };
        if chunk_width == 0 || chunk_height == 0 {
            return Err(FormatError::UnsupportedLayout(format!(
                "chunk size {}x{}",
                chunk_width, chunk_height
            ))
            .into());
        }

        let offsets = self
            .int_array(offsets_tag)?
            .ok_or(TiffError::MissingTag(if tiled { "TileOffsets" } else { "StripOffsets" }))?;
        let byte_counts = self.int_array(counts_tag)?.ok_or(TiffError::MissingTag(if tiled {
            "TileByteCounts"
        } else {
            "StripByteCounts"
        }))?;

        let layout = ChunkLayout {
            width: fields.width,
            height: fields.height,
            tiled,
            chunk_width,
            chunk_height,
            samples_per_pixel: fields.samples_per_pixel,
            bytes_per_sample: (fields.bits_per_sample as usize).div_ceil(8),
            planar: fields
                .planar_config
                .map_or(PlanarConfig::Chunky, PlanarConfig::from_u16),
            compression,
            offsets,
            byte_counts,
        };

        let planes = match layout.planar {
            PlanarConfig::Chunky => 1,
            PlanarConfig::Separate => layout.samples_per_pixel as usize,
        };
        let expected = layout.chunks_per_plane() as usize * planes;
        if layout.offsets.len() < expected || layout.byte_counts.len() < expected {
            return Err(TiffError::InvalidTagValue {
                tag: if tiled { "TileOffsets" } else { "StripOffsets" },
                message: format!(
                    "{} offsets and {} byte counts for {} chunks",
                    layout.offsets.len(),
                    layout.byte_counts.len(),
                    expected
                ),
            }
            .into());
        }
        Ok(layout)
    }

    // ---- Pixel data ----

    /// Read and decompress chunk `index` of the current directory.
    ///
    /// # Errors
    /// `ShortRead` when the chunk decodes to fewer bytes than its geometry
    /// requires. Longer output is truncated.
    pub fn read_chunk(&mut self, index: u32) -> Result<Vec<u8>, CodecError> {
        let layout = self.layout()?;
        let i = index as usize;
        let (Some(&offset), Some(&count)) = (layout.offsets.get(i), layout.byte_counts.get(i)) else {
            return Err(TiffError::InvalidTagValue {
                tag: "chunk index",
                message: format!("chunk {} out of range", index),
            }
            .into());
        };
        let expected = layout.expected_len(index);
        let compression = layout.compression;
        let unit = if layout.tiled { "tile" } else { "strip" };

        let raw = self.reader.read_exact_at(offset, count as usize)?;
        let mut data = decompress(compression, &raw, expected)?;
        if data.len() < expected {
            return Err(CorruptDataError::ShortRead {
                unit,
                index,
                expected,
                actual: data.len(),
            }
            .into());
        }
        data.truncate(expected);
        Ok(data)
    }

    /// Raw compressed bytes of chunk `index`, used when copying a page.
    pub fn read_raw_chunk(&mut self, index: u32) -> Result<Vec<u8>, CodecError> {
        let layout = self.layout()?;
        let i = index as usize;
        let (offset, count) = match (layout.offsets.get(i), layout.byte_counts.get(i)) {
            (Some(&o), Some(&c)) => (o, c),
            _ => {
                return Err(TiffError::InvalidTagValue {
                    tag: "chunk index",
                    message: format!("chunk {} out of range", index),
                }
                .into())
            }
        };
        Ok(self.reader.read_exact_at(offset, count as usize)?)
    }
}

impl NativeSession for TiffReader {
    fn close(&mut self) -> Result<(), CodecError> {
        self.layout = None;
        Ok(())
    }
}
