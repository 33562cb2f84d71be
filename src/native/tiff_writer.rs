//! TIFF encode session.
//!
//! Fields are collected first; the first pixel write fixes the layout, and
//! from then on fields are frozen. Chunk data is appended to the file as it
//! arrives, and the directory goes after the pixel data when the session is
//! closed, followed by the header patch that points at it.
//!
//! ```text
//! [header][chunk 0][chunk 1]...[page 2 chunks][IFD 0 + values][IFD 1 + values]
//! ```

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{CodecError, CorruptDataError, FormatError, NativeError, TiffError};
use crate::format::tiff::{
    compress, ByteOrder, Compression, FieldType, IfdBuilder, PlanarConfig, TiffHeader, TiffTag,
    TIFF_HEADER_SIZE,
};
use crate::software_string;

use super::{NativeSession, TiffReader};

/// Tags never copied from an appended page: its own sub-IFD pointers, the
/// temporary EXIF tag, chunk addressing and paging, which are rewritten.
const NOT_COPIED: [TiffTag; 11] = [
    TiffTag::ExifIfd,
    TiffTag::GpsIfd,
    TiffTag::InteropIfd,
    TiffTag::PhotoshopImageResources,
    TiffTag::StripOffsets,
    TiffTag::StripByteCounts,
    TiffTag::TileOffsets,
    TiffTag::TileByteCounts,
    TiffTag::PageNumber,
    TiffTag::NewSubfileType,
    TiffTag::Software,
];

/// SubIFDs pointer; not in the tag table because nothing else uses it.
const SUB_IFDS_TAG: u16 = 330;

#[derive(Debug, Clone, Copy)]
struct WritePlan {
    height: u32,
    tiled: bool,
    chunk_width: u32,
    chunk_height: u32,
    bytes_per_pixel: usize,
    chunks_across: u32,
    chunk_count: u32,
    compression: Compression,
}

impl WritePlan {
    fn expected_len(&self, index: u32) -> usize {
        let rows = if self.tiled {
            self.chunk_height
        } else {
            self.chunk_height
                .min(self.height.saturating_sub(index * self.chunk_height))
        };
        self.chunk_width as usize * rows as usize * self.bytes_per_pixel
    }

    /// Rows that are complete when chunks before `index` are written.
    fn rows_before(&self, index: u32) -> u32 {
        let band = if self.tiled {
            index / self.chunks_across
        } else {
            index
        };
        (band * self.chunk_height).min(self.height)
    }
}

/// First directory of another TIFF, staged for writing as page 2.
struct AppendedPage {
    ifd: IfdBuilder,
    tiled: bool,
    chunks: Vec<Vec<u8>>,
}

/// Writer session producing one classic TIFF file.
pub struct TiffWriter {
    file: BufWriter<File>,
    order: ByteOrder,
    ifd: IfdBuilder,
    position: u64,
    plan: Option<WritePlan>,
    chunks: Vec<Option<(u32, u32)>>,
    appended: Option<AppendedPage>,
}

impl TiffWriter {
    /// Start a TIFF in `file`, which must be empty and writable.
    pub fn new(file: File, order: ByteOrder) -> Result<Self, CodecError> {
        let mut file = BufWriter::new(file);
        // Placeholder; patched on close.
        file.write_all(&TiffHeader::encode_classic(order, 0))?;
        Ok(Self {
            file,
            order,
            ifd: IfdBuilder::new(order),
            position: TIFF_HEADER_SIZE as u64,
            plan: None,
            chunks: Vec::new(),
            appended: None,
        })
    }

    pub fn create(path: &Path, order: ByteOrder) -> Result<Self, CodecError> {
        Self::new(File::create(path)?, order)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    fn check_fields_open(&self) -> Result<(), CodecError> {
        if self.plan.is_some() {
            return Err(NativeError::MetadataAfterPixels.into());
        }
        Ok(())
    }

    // ---- Fields ----

    pub fn set_shorts(&mut self, tag: TiffTag, values: &[u16]) -> Result<(), CodecError> {
        self.check_fields_open()?;
        self.ifd.set_shorts(tag.as_u16(), values);
        Ok(())
    }

    pub fn set_int_field(&mut self, tag: TiffTag, value: u32) -> Result<(), CodecError> {
        self.check_fields_open()?;
        self.ifd.set_longs(tag.as_u16(), &[value]);
        Ok(())
    }

    pub fn set_string(&mut self, tag: TiffTag, value: &str) -> Result<(), CodecError> {
        self.check_fields_open()?;
        self.ifd.set_ascii(tag.as_u16(), value);
        Ok(())
    }

    pub fn set_bytes(
        &mut self,
        tag: TiffTag,
        field_type: FieldType,
        value: &[u8],
    ) -> Result<(), CodecError> {
        self.check_fields_open()?;
        self.ifd.set_bytes(tag.as_u16(), field_type, value);
        Ok(())
    }

    pub fn set_rational(&mut self, tag: TiffTag, value: (u32, u32)) -> Result<(), CodecError> {
        self.check_fields_open()?;
        self.ifd.set_rationals(tag.as_u16(), &[value]);
        Ok(())
    }

    pub fn has_field(&self, tag: TiffTag) -> bool {
        self.ifd.contains(tag)
    }

    /// First value of an integer field already set.
    fn field_u32(&self, tag: TiffTag) -> Option<u32> {
        let field = self.ifd.get(tag.as_u16())?;
        match field.field_type {
            FieldType::Short if field.data.len() >= 2 => Some(self.order.read_u16(&field.data) as u32),
            FieldType::Long if field.data.len() >= 4 => Some(self.order.read_u32(&field.data)),
            _ => None,
        }
    }

    /// Stage the first directory of `source` as page 2 and mark both pages
    /// as a layered pair.
    ///
    /// # Errors
    /// `UnsupportedLayout` when `source` uses the other byte order, since
    /// its sample data is copied without re-encoding.
    pub fn append_page(&mut self, source: &Path) -> Result<(), CodecError> {
        self.check_fields_open()?;
        let mut reader = TiffReader::open(source)?;
        if reader.byte_order() != self.order {
            return Err(FormatError::UnsupportedLayout(format!(
                "cannot append {:?} page to a {:?} file",
                reader.byte_order(),
                self.order
            ))
            .into());
        }

        let layout = reader.layout()?.clone();
        let planes = match layout.planar {
            PlanarConfig::Chunky => 1,
            PlanarConfig::Separate => layout.samples_per_pixel as u32,
        };
        let chunks = (0..layout.chunks_per_plane() * planes)
            .map(|i| reader.read_raw_chunk(i))
            .collect::<Result<Vec<_>, _>>()?;

        let mut ifd = IfdBuilder::new(self.order);
        let entries = reader.directory().entries.clone();
        for entry in entries {
            if NOT_COPIED.iter().any(|t| t.as_u16() == entry.tag_id) || entry.tag_id == SUB_IFDS_TAG {
                continue;
            }
            let Some(field_type) = entry.field_type.filter(|t| {
                !matches!(
                    t,
                    FieldType::Ifd | FieldType::Long8 | FieldType::SLong8 | FieldType::Ifd8
                )
            }) else {
                continue;
            };
            let Ok(count) = u32::try_from(entry.count) else {
                continue;
            };
            let data = reader.entry_bytes(&entry)?;
            ifd.set_raw(entry.tag_id, field_type, count, data);
        }
        let software = software_string();
        ifd.set_ascii(TiffTag::Software.as_u16(), &software);
        ifd.set_shorts(TiffTag::PageNumber.as_u16(), &[1, 2]);

        self.ifd.set_ascii(TiffTag::Software.as_u16(), &software);
        self.ifd.set_shorts(TiffTag::PageNumber.as_u16(), &[0, 2]);
        debug!(source = %source.display(), chunks = chunks.len(), "staged page 2");

        self.appended = Some(AppendedPage {
            ifd,
            tiled: layout.tiled,
            chunks,
        });
        Ok(())
    }

    // ---- Pixel data ----

    fn plan(&mut self) -> Result<WritePlan, CodecError> {
        if let Some(plan) = self.plan {
            return Ok(plan);
        }
        let width = self
            .field_u32(TiffTag::ImageWidth)
            .ok_or(TiffError::MissingTag("ImageWidth"))?;
        let height = self
            .field_u32(TiffTag::ImageLength)
            .ok_or(TiffError::MissingTag("ImageLength"))?;
        let bits = self
            .field_u32(TiffTag::BitsPerSample)
            .ok_or(TiffError::MissingTag("BitsPerSample"))?;
        let samples = self.field_u32(TiffTag::SamplesPerPixel).unwrap_or(1);
        if self.field_u32(TiffTag::PlanarConfiguration).unwrap_or(1) != 1 {
            return Err(FormatError::UnsupportedLayout("writer produces chunky data only".into()).into());
        }
        let raw_compression = self.field_u32(TiffTag::Compression).unwrap_or(1) as u16;
        let compression = Compression::from_u16(raw_compression)
            .filter(|c| c.is_supported())
            .ok_or_else(|| TiffError::UnsupportedCompression(format!("code {}", raw_compression)))?;

        let (tiled, chunk_width, chunk_height) = match (
            self.field_u32(TiffTag::TileWidth),
            self.field_u32(TiffTag::TileLength),
        ) {
            (Some(w), Some(h)) => (true, w, h),
            _ => {
                let rows = self
                    .field_u32(TiffTag::RowsPerStrip)
                    .unwrap_or(height)
                    .min(height);
                (false, width, rows)
            }
        };
        if width == 0 || height == 0 || chunk_width == 0 || chunk_height == 0 {
            return Err(FormatError::UnsupportedLayout(format!(
                "image {}x{} in chunks of {}x{}",
                width, height, chunk_width, chunk_height
            ))
            .into());
        }
        if tiled && (chunk_width % 16 != 0 || chunk_height % 16 != 0) {
            return Err(FormatError::UnsupportedLayout(format!(
                "tile size {}x{} is not a multiple of 16",
                chunk_width, chunk_height
            ))
            .into());
        }

        let chunks_across = width.div_ceil(chunk_width);
        let plan = WritePlan {
            height,
            tiled,
            chunk_width,
            chunk_height,
            bytes_per_pixel: samples as usize * (bits as usize).div_ceil(8),
            chunks_across,
            chunk_count: chunks_across * height.div_ceil(chunk_height),
            compression,
        };
        self.chunks = vec![None; plan.chunk_count as usize];
        self.plan = Some(plan);
        debug!(
            width,
            height,
            tiled,
            chunk_width,
            chunk_height,
            chunks = plan.chunk_count,
            "TIFF layout fixed"
        );
        Ok(plan)
    }

    /// Number of strips or tiles the image is split into.
    pub fn chunk_count(&mut self) -> Result<u32, CodecError> {
        Ok(self.plan()?.chunk_count)
    }

    /// Compress and append strip or tile `index`.
    ///
    /// `data` must be exactly one chunk of interleaved samples in the file's
    /// byte order; edge tiles are padded to full size. Returns the number of
    /// uncompressed bytes accepted.
    pub fn write_chunk(&mut self, index: u32, data: &[u8]) -> Result<usize, CodecError> {
        let plan = self.plan()?;
        let unit = if plan.tiled { "tile" } else { "strip" };
        if index >= plan.chunk_count {
            return Err(NativeError::codec(
                "tiff",
                format!("{} {} out of range ({} total)", unit, index, plan.chunk_count),
            )
            .into());
        }
        if self.chunks[index as usize].is_some() {
            return Err(NativeError::codec("tiff", format!("{} {} written twice", unit, index)).into());
        }
        let expected = plan.expected_len(index);
        if data.len() != expected {
            return Err(CorruptDataError::ShortWrite {
                unit,
                index,
                expected,
                actual: data.len(),
            }
            .into());
        }

        let packed = compress(plan.compression, data)?;
        let offset = self.append(&packed)?;
        self.chunks[index as usize] = Some((offset, packed.len() as u32));
        Ok(data.len())
    }

    /// Append bytes at the end of the file, returning their offset.
    fn append(&mut self, bytes: &[u8]) -> Result<u32, CodecError> {
        let end = self.position + bytes.len() as u64;
        let offset = u32::try_from(self.position)
            .ok()
            .filter(|_| end <= u32::MAX as u64)
            .ok_or(TiffError::InvalidIfdOffset(end))?;
        self.file.write_all(bytes)?;
        self.position = end;
        Ok(offset)
    }

    fn align(&mut self) -> Result<(), CodecError> {
        if self.position % 2 == 1 {
            self.append(&[0])?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CodecError> {
        let plan = self.plan()?;
        if let Some(missing) = self.chunks.iter().position(Option::is_none) {
            return Err(NativeError::TooFewScanlines {
                processed: plan.rows_before(missing as u32),
                expected: plan.height,
            }
            .into());
        }

        let (offsets, counts): (Vec<u32>, Vec<u32>) = self.chunks.iter().flatten().copied().unzip();
        let (offsets_tag, counts_tag) = chunk_tags(plan.tiled);
        self.ifd.set_longs(offsets_tag.as_u16(), &offsets);
        self.ifd.set_longs(counts_tag.as_u16(), &counts);

        let mut page = self.appended.take();
        if let Some(page) = page.as_mut() {
            let mut page_offsets = Vec::with_capacity(page.chunks.len());
            let mut page_counts = Vec::with_capacity(page.chunks.len());
            for chunk in std::mem::take(&mut page.chunks) {
                page_offsets.push(self.append(&chunk)?);
                page_counts.push(chunk.len() as u32);
            }
            let (offsets_tag, counts_tag) = chunk_tags(page.tiled);
            page.ifd.set_longs(offsets_tag.as_u16(), &page_offsets);
            page.ifd.set_longs(counts_tag.as_u16(), &page_counts);
        }

        self.align()?;
        let ifd0_offset = self.position;
        let ifd1_offset = ifd0_offset + self.ifd.encoded_len() as u64;
        let next = match page {
            Some(_) => u32::try_from(ifd1_offset).map_err(|_| TiffError::InvalidIfdOffset(ifd1_offset))?,
            None => 0,
        };
        let ifd0 = self.ifd.encode(ifd0_offset, next)?;
        self.append(&ifd0)?;
        if let Some(page) = page {
            let ifd1 = page.ifd.encode(ifd1_offset, 0)?;
            self.append(&ifd1)?;
        }

        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&TiffHeader::encode_classic(self.order, ifd0_offset as u32))?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        debug!(bytes = self.position, ifd_offset = ifd0_offset, "TIFF finalized");
        Ok(())
    }
}

fn chunk_tags(tiled: bool) -> (TiffTag, TiffTag) {
    if tiled {
        (TiffTag::TileOffsets, TiffTag::TileByteCounts)
    } else {
        (TiffTag::StripOffsets, TiffTag::StripByteCounts)
    }
}

impl NativeSession for TiffWriter {
    fn close(&mut self) -> Result<(), CodecError> {
        self.finish()
    }
}
