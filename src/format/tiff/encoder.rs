//! Classic TIFF directory encoding.
//!
//! [`IfdBuilder`] collects fields in tag order and lays out one directory
//! followed by its out-of-line values. The TIFF writer uses it for image
//! directories and the EXIF codec uses it for sub-IFDs, which is why the
//! layout position is a parameter rather than a file position.

use std::collections::BTreeMap;

use crate::error::TiffError;

use super::parser::ByteOrder;
use super::tags::{FieldType, TiffTag};

/// One encoded field: raw value bytes already in the target byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdField {
    pub field_type: FieldType,
    pub count: u32,
    pub data: Vec<u8>,
}

impl IfdField {
    fn is_inline(&self) -> bool {
        self.data.len() <= FieldType::INLINE_THRESHOLD_TIFF
    }
}

/// Builder for a single classic-TIFF directory.
#[derive(Debug, Clone)]
pub struct IfdBuilder {
    order: ByteOrder,
    fields: BTreeMap<u16, IfdField>,
}

impl IfdBuilder {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            order,
            fields: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Store a field from raw bytes. Replaces any previous value for `tag`.
    pub fn set_raw(&mut self, tag: u16, field_type: FieldType, count: u32, data: Vec<u8>) {
        self.fields.insert(
            tag,
            IfdField {
                field_type,
                count,
                data,
            },
        );
    }

    pub fn set_shorts(&mut self, tag: u16, values: &[u16]) {
        let mut data = Vec::with_capacity(values.len() * 2);
        for &v in values {
            self.order.put_u16(&mut data, v);
        }
        self.set_raw(tag, FieldType::Short, values.len() as u32, data);
    }

    pub fn set_longs(&mut self, tag: u16, values: &[u32]) {
        let mut data = Vec::with_capacity(values.len() * 4);
        for &v in values {
            self.order.put_u32(&mut data, v);
        }
        self.set_raw(tag, FieldType::Long, values.len() as u32, data);
    }

    pub fn set_rationals(&mut self, tag: u16, values: &[(u32, u32)]) {
        let mut data = Vec::with_capacity(values.len() * 8);
        for &(num, den) in values {
            self.order.put_u32(&mut data, num);
            self.order.put_u32(&mut data, den);
        }
        self.set_raw(tag, FieldType::Rational, values.len() as u32, data);
    }

    /// Store a NUL-terminated ASCII string.
    pub fn set_ascii(&mut self, tag: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        let count = data.len() as u32;
        self.set_raw(tag, FieldType::Ascii, count, data);
    }

    /// Store an opaque byte array as Byte or Undefined.
    pub fn set_bytes(&mut self, tag: u16, field_type: FieldType, value: &[u8]) {
        self.set_raw(tag, field_type, value.len() as u32, value.to_vec());
    }

    pub fn get(&self, tag: u16) -> Option<&IfdField> {
        self.fields.get(&tag)
    }

    pub fn contains(&self, tag: TiffTag) -> bool {
        self.fields.contains_key(&tag.as_u16())
    }

    pub fn remove(&mut self, tag: u16) -> Option<IfdField> {
        self.fields.remove(&tag)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = u16> + '_ {
        self.fields.keys().copied()
    }

    /// Size of the directory itself: count, entries and next pointer.
    pub fn directory_len(&self) -> usize {
        2 + 12 * self.fields.len() + 4
    }

    /// Size of directory plus padded out-of-line values.
    pub fn encoded_len(&self) -> usize {
        self.directory_len()
            + self
                .fields
                .values()
                .filter(|f| !f.is_inline())
                .map(|f| f.data.len() + (f.data.len() & 1))
                .sum::<usize>()
    }

    /// Lay out the directory as if it started at `offset`.
    ///
    /// Out-of-line values follow the directory, each starting on a word
    /// boundary relative to `offset`.
    ///
    /// # Errors
    /// Returns `InvalidIfdOffset` if any value would land past 4 GiB.
    pub fn encode(&self, offset: u64, next_ifd_offset: u32) -> Result<Vec<u8>, TiffError> {
        let total = self.encoded_len();
        if offset + total as u64 > u32::MAX as u64 {
            return Err(TiffError::InvalidIfdOffset(offset));
        }

        let order = self.order;
        let mut dir = Vec::with_capacity(self.directory_len());
        let mut values = Vec::with_capacity(total - self.directory_len());
        let values_start = offset + self.directory_len() as u64;

        order.put_u16(&mut dir, self.fields.len() as u16);
        for (&tag, field) in &self.fields {
            order.put_u16(&mut dir, tag);
            order.put_u16(&mut dir, field.field_type.as_u16());
            order.put_u32(&mut dir, field.count);
            if field.is_inline() {
                let mut inline = [0u8; 4];
                inline[..field.data.len()].copy_from_slice(&field.data);
                dir.extend_from_slice(&inline);
            } else {
                order.put_u32(&mut dir, (values_start + values.len() as u64) as u32);
                values.extend_from_slice(&field.data);
                if field.data.len() & 1 == 1 {
                    values.push(0);
                }
            }
        }
        order.put_u32(&mut dir, next_ifd_offset);

        dir.extend_from_slice(&values);
        Ok(dir)
    }
}
