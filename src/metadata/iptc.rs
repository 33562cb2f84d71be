//! IPTC-IIM records.
//!
//! Datasets are stored as IIM: `1C record dataset length data`, in the
//! order they were added. In TIFF the IIM stream is the raw value of
//! tag 33723; in JPEG it is wrapped in a Photoshop 8BIM resource 0x0404
//! inside APP13.

use serde::Serialize;

use crate::error::CorruptDataError;

/// Identifier that opens a Photoshop APP13 payload.
pub const PHOTOSHOP_IDENT: &[u8; 14] = b"Photoshop 3.0\0";

const IIM_TAG_MARKER: u8 = 0x1C;
const RESOURCE_SIGNATURE: &[u8; 4] = b"8BIM";
const IPTC_RESOURCE_ID: u16 = 0x0404;

/// Lengths above this use the extended-length form.
const MAX_STANDARD_LEN: usize = 0x7FFF;

/// One IIM dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IptcDataSet {
    pub record: u8,
    pub dataset: u8,
    pub data: Vec<u8>,
}

impl IptcDataSet {
    pub fn new(record: u8, dataset: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            record,
            dataset,
            data: data.into(),
        }
    }
}

/// An ordered set of IIM datasets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IptcDirectory {
    pub datasets: Vec<IptcDataSet>,
}

impl IptcDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dataset: IptcDataSet) -> &mut Self {
        self.datasets.push(dataset);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Values of every dataset with the given numbers, in stored order.
    pub fn values(&self, record: u8, dataset: u8) -> impl Iterator<Item = &[u8]> + '_ {
        self.datasets
            .iter()
            .filter(move |d| d.record == record && d.dataset == dataset)
            .map(|d| d.data.as_slice())
    }

    /// Encode as an IIM stream in stored order, so a parsed directory
    /// encodes back to the same datasets.
    pub fn encode_iim(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for ds in &self.datasets {
            out.extend_from_slice(&[IIM_TAG_MARKER, ds.record, ds.dataset]);
            if ds.data.len() <= MAX_STANDARD_LEN {
                out.extend_from_slice(&(ds.data.len() as u16).to_be_bytes());
            } else {
                // Extended form: high bit set, low bits give the width of the
                // length that follows.
                out.extend_from_slice(&0x8004u16.to_be_bytes());
                out.extend_from_slice(&(ds.data.len() as u32).to_be_bytes());
            }
            out.extend_from_slice(&ds.data);
        }
        out
    }

    /// Parse an IIM stream. Trailing padding (zero bytes) is ignored.
    ///
    /// # Errors
    /// Returns `Metadata` when a dataset is truncated or a tag marker is
    /// missing.
    pub fn parse_iim(data: &[u8]) -> Result<Self, CorruptDataError> {
        let truncated = || CorruptDataError::Metadata("truncated IPTC dataset".into());
        let mut dir = IptcDirectory::new();
        let mut pos = 0;

        while pos < data.len() {
            if data[pos] != IIM_TAG_MARKER {
                if data[pos..].iter().all(|&b| b == 0) {
                    break;
                }
                return Err(CorruptDataError::Metadata(format!(
                    "expected IPTC tag marker at byte {}, found 0x{:02X}",
                    pos, data[pos]
                )));
            }
            let head = data.get(pos..pos + 5).ok_or_else(truncated)?;
            let (record, dataset) = (head[1], head[2]);
            let raw_len = u16::from_be_bytes([head[3], head[4]]);
            pos += 5;

            let len = if raw_len & 0x8000 != 0 {
                let width = (raw_len & 0x7FFF) as usize;
                let bytes = data.get(pos..pos + width).ok_or_else(truncated)?;
                if width > 8 {
                    return Err(CorruptDataError::Metadata(format!(
                        "IPTC extended length of {} bytes",
                        width
                    )));
                }
                pos += width;
                bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize)
            } else {
                raw_len as usize
            };

            let value = data.get(pos..pos + len).ok_or_else(truncated)?;
            dir.datasets.push(IptcDataSet::new(record, dataset, value));
            pos += len;
        }

        Ok(dir)
    }

    /// Wrap the IIM stream in an APP13 Photoshop resource block.
    pub fn encode_photoshop(&self) -> Vec<u8> {
        let iim = self.encode_iim();
        let mut out = Vec::with_capacity(PHOTOSHOP_IDENT.len() + 12 + iim.len() + 1);
        out.extend_from_slice(PHOTOSHOP_IDENT);
        out.extend_from_slice(RESOURCE_SIGNATURE);
        out.extend_from_slice(&IPTC_RESOURCE_ID.to_be_bytes());
        // Empty Pascal name, padded to even length.
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(iim.len() as u32).to_be_bytes());
        out.extend_from_slice(&iim);
        if iim.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    /// Find the IPTC resource in an APP13 payload.
    ///
    /// Returns `Ok(None)` when the payload is Photoshop data without an IPTC
    /// resource.
    pub fn parse_photoshop(payload: &[u8]) -> Result<Option<Self>, CorruptDataError> {
        let mut rest = payload
            .strip_prefix(PHOTOSHOP_IDENT.as_slice())
            .ok_or_else(|| CorruptDataError::Metadata("APP13 is not a Photoshop block".into()))?;
        let truncated = || CorruptDataError::Metadata("truncated Photoshop resource".into());

        while rest.len() >= 4 && rest.starts_with(RESOURCE_SIGNATURE) {
            let id = u16::from_be_bytes([
                *rest.get(4).ok_or_else(truncated)?,
                *rest.get(5).ok_or_else(truncated)?,
            ]);
            let name_len = *rest.get(6).ok_or_else(truncated)? as usize;
            // Length byte plus name, padded to even.
            let name_total = (1 + name_len + 1) & !1;
            let size_at = 6 + name_total;
            let size_bytes = rest.get(size_at..size_at + 4).ok_or_else(truncated)?;
            let size = u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]])
                as usize;
            let data_at = size_at + 4;
            let data = rest.get(data_at..data_at + size).ok_or_else(truncated)?;

            if id == IPTC_RESOURCE_ID {
                return Self::parse_iim(data).map(Some);
            }
            let next = data_at + size + (size & 1);
            rest = rest.get(next..).unwrap_or(&[]);
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IptcDirectory {
        let mut dir = IptcDirectory::new();
        dir.push(IptcDataSet::new(2, 25, "keyword-b"))
            .push(IptcDataSet::new(2, 5, "Title"))
            .push(IptcDataSet::new(1, 90, vec![0x1B, 0x25, 0x47]))
            .push(IptcDataSet::new(2, 25, "keyword-a"));
        dir
    }

    #[test]
    fn test_iim_keeps_insertion_order() {
        let dir = sample();
        let parsed = IptcDirectory::parse_iim(&dir.encode_iim()).unwrap();
        let order: Vec<(u8, u8)> = parsed.datasets.iter().map(|d| (d.record, d.dataset)).collect();
        assert_eq!(order, vec![(2, 25), (2, 5), (1, 90), (2, 25)]);
        assert_eq!(parsed, dir);
        let keywords: Vec<&[u8]> = parsed.values(2, 25).collect();
        assert_eq!(keywords, vec![b"keyword-b".as_slice(), b"keyword-a".as_slice()]);
    }

    #[test]
    fn test_iim_extended_length() {
        let mut dir = IptcDirectory::new();
        dir.push(IptcDataSet::new(2, 120, vec![b'x'; 40_000]));
        let encoded = dir.encode_iim();
        assert_eq!(&encoded[3..5], &[0x80, 0x04]);
        assert_eq!(IptcDirectory::parse_iim(&encoded).unwrap(), dir);
    }

    #[test]
    fn test_iim_truncated() {
        let encoded = sample().encode_iim();
        assert!(IptcDirectory::parse_iim(&encoded[..encoded.len() - 2]).is_err());
        assert!(IptcDirectory::parse_iim(&[0x1C, 2]).is_err());
    }

    #[test]
    fn test_iim_ignores_trailing_padding() {
        let mut encoded = sample().encode_iim();
        encoded.extend_from_slice(&[0, 0, 0]);
        assert_eq!(IptcDirectory::parse_iim(&encoded).unwrap().datasets.len(), 4);
    }

    #[test]
    fn test_photoshop_wrapping() {
        let dir = sample();
        let payload = dir.encode_photoshop();
        assert!(payload.starts_with(PHOTOSHOP_IDENT));
        assert_eq!(&payload[14..18], b"8BIM");
        assert_eq!(payload.len() % 2, 0);

        let parsed = IptcDirectory::parse_photoshop(&payload).unwrap().unwrap();
        assert_eq!(parsed.datasets.len(), 4);
        assert_eq!(parsed.values(2, 5).next(), Some(b"Title".as_slice()));
    }

    #[test]
    fn test_photoshop_skips_other_resources() {
        let mut payload = PHOTOSHOP_IDENT.to_vec();
        // Resource 0x03ED with a 3-byte name and 5 bytes of data.
        payload.extend_from_slice(b"8BIM");
        payload.extend_from_slice(&0x03EDu16.to_be_bytes());
        payload.extend_from_slice(&[3, b'a', b'b', b'c']);
        payload.extend_from_slice(&5u32.to_be_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 0]);
        payload.extend_from_slice(&sample().encode_photoshop()[14..]);

        let parsed = IptcDirectory::parse_photoshop(&payload).unwrap().unwrap();
        assert_eq!(parsed.datasets.len(), 4);

        let mut only_other = PHOTOSHOP_IDENT.to_vec();
        only_other.extend_from_slice(&payload[14..14 + 20]);
        assert_eq!(IptcDirectory::parse_photoshop(&only_other).unwrap(), None);
    }
}
