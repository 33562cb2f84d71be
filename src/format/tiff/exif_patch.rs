//! In-place relocation of an EXIF block inside a finished TIFF file.
//!
//! The TIFF writer has no notion of sub-IFDs, so the EXIF directory is
//! written as an opaque byte array under
//! [`TiffTag::PhotoshopImageResources`]. Every offset inside that block is
//! relative to the block start. Once the file is closed this module:
//!
//! 1. renames the temporary entry to [`TiffTag::ExifIfd`] with type LONG and
//!    count 1, so its value field (the block start) becomes the sub-IFD
//!    pointer;
//! 2. walks the EXIF directory and adds the block start to every value that
//!    is an offset: entries whose value does not fit in the 4-byte field,
//!    and sub-IFD pointers (EXIF, GPS, Interoperability), which are then
//!    walked recursively.
//!
//! A [`TiffTag::GpsIfd`] entry in the same IFD holds a block-relative
//! offset as well; it gets the block start added and its directory is
//! relocated the same way.
//!
//! Entries whose values are inline are left untouched. The rename keeps the
//! directory sorted because the writer emits no tag between the two IDs.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{CodecError, CorruptDataError, TiffError};
use crate::io::RandomAccess;

use super::parser::{Ifd, TiffHeader};
use super::tags::{FieldType, TiffTag};

/// Nesting limit for sub-IFDs inside the EXIF block.
const MAX_SUB_IFD_DEPTH: usize = 8;

/// Outcome of a successful patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    /// Absolute offset of the EXIF directory
    pub exif_ifd_offset: u64,

    /// Absolute offset of the GPS directory pointed to from the main IFD
    pub gps_ifd_offset: Option<u64>,

    /// Absolute offsets of every directory that was relocated, EXIF first
    pub relocated_ifds: Vec<u64>,

    /// Number of entry values that were rewritten
    pub patched_values: usize,
}

/// Patch the first temporary EXIF entry found in the main IFD chain.
///
/// Returns `Ok(None)` when no directory carries the temporary tag.
///
/// # Errors
/// Any I/O failure is returned as-is; structural problems (BigTIFF, an
/// inline block, pointers outside the file, cycles) are `CorruptData`. A
/// failed patch leaves the file in an unknown state and it must not be
/// published.
pub fn patch_exif_pointer<F: RandomAccess>(file: &mut F) -> Result<Option<PatchReport>, CodecError> {
    let header = TiffHeader::read(file)?;
    if header.is_bigtiff {
        return Err(TiffError::InvalidTagValue {
            tag: "ExifIFD",
            message: "EXIF relocation supports classic TIFF only".to_string(),
        }
        .into());
    }

    for ifd in Ifd::read_chain(file, &header)? {
        let Some(index) = ifd
            .entries
            .iter()
            .position(|e| e.tag_id == TiffTag::PhotoshopImageResources.as_u16())
        else {
            continue;
        };
        let entry = &ifd.entries[index];
        if !matches!(
            entry.field_type,
            Some(FieldType::Undefined) | Some(FieldType::Byte)
        ) || entry.is_inline
        {
            return Err(TiffError::InvalidTagValue {
                tag: "PhotoshopImageResources",
                message: format!(
                    "expected an out-of-line byte block, got type {} count {}",
                    entry.field_type_raw, entry.count
                ),
            }
            .into());
        }

        let block_start = entry.value_offset(header.byte_order, false);
        let entry_pos = ifd.offset + 2 + 12 * index as u64;

        let order = header.byte_order;
        let mut rewritten = Vec::with_capacity(8);
        rewritten.extend_from_slice(&order.u16_bytes(TiffTag::ExifIfd.as_u16()));
        rewritten.extend_from_slice(&order.u16_bytes(FieldType::Long.as_u16()));
        rewritten.extend_from_slice(&order.u32_bytes(1));
        file.write_all_at(entry_pos, &rewritten)?;

        let mut patcher = Relocator {
            header,
            base: block_start,
            file_size: file.size()?,
            visited: HashSet::new(),
            report: PatchReport {
                exif_ifd_offset: block_start,
                gps_ifd_offset: None,
                relocated_ifds: Vec::new(),
                patched_values: 0,
            },
        };
        patcher.relocate(file, block_start, 0)?;

        if let Some(gps_index) = ifd
            .entries
            .iter()
            .position(|e| e.tag_id == TiffTag::GpsIfd.as_u16())
        {
            let gps = &ifd.entries[gps_index];
            if gps.field_type != Some(FieldType::Long) || gps.count != 1 {
                return Err(TiffError::InvalidTagValue {
                    tag: "GPSInfoIFD",
                    message: format!(
                        "expected a single LONG, got type {} count {}",
                        gps.field_type_raw, gps.count
                    ),
                }
                .into());
            }
            let gps_pos = ifd.offset + 2 + 12 * gps_index as u64 + 8;
            let absolute = patcher.rebase_pointer(file, gps_pos, gps.value_offset(order, false))?;
            patcher.report.gps_ifd_offset = Some(absolute);
            patcher.relocate(file, absolute, 1)?;
        }
        file.flush_all()?;

        debug!(
            exif_ifd = block_start,
            sub_ifds = patcher.report.relocated_ifds.len(),
            values = patcher.report.patched_values,
            "EXIF block relocated"
        );
        return Ok(Some(patcher.report));
    }

    Ok(None)
}

struct Relocator {
    header: TiffHeader,
    base: u64,
    file_size: u64,
    visited: HashSet<u64>,
    report: PatchReport,
}

impl Relocator {
    fn relocate<F: RandomAccess>(
        &mut self,
        file: &mut F,
        ifd_offset: u64,
        depth: usize,
    ) -> Result<(), CodecError> {
        if depth > MAX_SUB_IFD_DEPTH || !self.visited.insert(ifd_offset) {
            return Err(bad_pointer(ifd_offset, "sub-IFD cycle or nesting too deep"));
        }

        let ifd = Ifd::read(file, &self.header, ifd_offset)?;
        self.report.relocated_ifds.push(ifd_offset);
        let order = self.header.byte_order;

        for (i, entry) in ifd.entries.iter().enumerate() {
            let size = entry
                .value_byte_size()
                .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;
            let is_pointer = TiffTag::is_sub_ifd_pointer(entry.tag_id);
            if size <= FieldType::INLINE_THRESHOLD_TIFF as u64 && !is_pointer {
                continue;
            }

            let value_pos = ifd_offset + 2 + 12 * i as u64 + 8;
            let relative = entry.value_offset(order, false);
            let absolute = if is_pointer {
                self.rebase_pointer(file, value_pos, relative)?
            } else {
                self.rebase(file, value_pos, relative, size)?
            };

            if is_pointer {
                self.relocate(file, absolute, depth + 1)?;
            }
        }

        Ok(())
    }
}

impl Relocator {
    /// Rewrite the offset stored at `value_pos` from block-relative to
    /// absolute, checking that `size` bytes fit there.
    fn rebase<F: RandomAccess>(
        &mut self,
        file: &mut F,
        value_pos: u64,
        relative: u64,
        size: u64,
    ) -> Result<u64, CodecError> {
        let absolute = relative + self.base;
        if absolute + size > self.file_size || absolute > u32::MAX as u64 {
            return Err(bad_pointer(absolute, "value outside the file"));
        }
        file.write_all_at(value_pos, &self.header.byte_order.u32_bytes(absolute as u32))?;
        self.report.patched_values += 1;
        Ok(absolute)
    }

    /// A sub-IFD pointer only needs room for the entry count.
    fn rebase_pointer<F: RandomAccess>(
        &mut self,
        file: &mut F,
        value_pos: u64,
        relative: u64,
    ) -> Result<u64, CodecError> {
        self.rebase(file, value_pos, relative, 2)
    }
}

fn bad_pointer(offset: u64, why: &str) -> CodecError {
    CorruptDataError::Metadata(format!("EXIF block offset {}: {}", offset, why)).into()
}

// =============================================================================
// Tests
// =============================================================================
