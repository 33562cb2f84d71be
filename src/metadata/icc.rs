//! ICC profiles and their APP2 chunking in JPEG.
//!
//! A JPEG segment carries at most [`MAX_SEGMENT_PAYLOAD`] bytes, so profiles
//! are split into numbered chunks:
//!
//! ```text
//! "ICC_PROFILE\0" seq(1-based) total   profile bytes...
//! |------------ 14-byte header -----|  |-- up to 65519 bytes --|
//! ```

use serde::Serialize;

use crate::error::CorruptDataError;
use crate::format::jpeg::{Segment, APP2, MAX_SEGMENT_PAYLOAD};

/// Identifier at the start of every ICC chunk.
pub const ICC_IDENT: &[u8; 12] = b"ICC_PROFILE\0";

/// Identifier plus sequence number and chunk count.
pub const ICC_HEADER_LEN: usize = 12 + 2;

/// Profile bytes carried by one full chunk.
pub const ICC_CHUNK_DATA_LEN: usize = MAX_SEGMENT_PAYLOAD - ICC_HEADER_LEN;

/// Minimum profile length: the fixed profile header.
const PROFILE_HEADER_LEN: usize = 128;

/// Number of APP2 segments needed for a profile of `profile_len` bytes.
///
/// The total written is the profile plus one header per chunk; that total
/// divided into full segments gives the chunk count.
pub fn icc_segment_count(profile_len: usize) -> usize {
    if profile_len == 0 {
        return 0;
    }
    let chunks = (profile_len - 1) / ICC_CHUNK_DATA_LEN + 1;
    let total = profile_len + chunks * ICC_HEADER_LEN;
    (total - 1) / MAX_SEGMENT_PAYLOAD + 1
}

/// Split a profile into APP2 segments in sequence order.
///
/// # Errors
/// Returns `Metadata` for an empty profile or one needing more than 255
/// chunks.
pub fn split_icc_profile(profile: &[u8]) -> Result<Vec<Segment>, CorruptDataError> {
    let count = icc_segment_count(profile.len());
    if count == 0 {
        return Err(CorruptDataError::Metadata("empty ICC profile".into()));
    }
    let total = u8::try_from(count).map_err(|_| {
        CorruptDataError::Metadata(format!(
            "ICC profile of {} bytes needs {} segments (limit 255)",
            profile.len(),
            count
        ))
    })?;

    Ok(profile
        .chunks(ICC_CHUNK_DATA_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let mut payload = Vec::with_capacity(ICC_HEADER_LEN + chunk.len());
            payload.extend_from_slice(ICC_IDENT);
            payload.push(i as u8 + 1);
            payload.push(total);
            payload.extend_from_slice(chunk);
            Segment::new(APP2, payload)
        })
        .collect())
}

/// Reassemble a profile from APP2 payloads in any order.
///
/// Returns `Ok(None)` when no payload carries the ICC identifier.
///
/// # Errors
/// Returns `Metadata` when chunks are missing, duplicated or disagree on the
/// chunk count.
pub fn reassemble_icc_segments<'a, I>(payloads: I) -> Result<Option<Vec<u8>>, CorruptDataError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut chunks: Vec<(u8, &[u8])> = Vec::new();
    let mut declared = None;

    for payload in payloads {
        let Some(rest) = payload.strip_prefix(ICC_IDENT.as_slice()) else {
            continue;
        };
        let [seq, total, data @ ..] = rest else {
            return Err(CorruptDataError::Metadata("truncated ICC chunk header".into()));
        };
        match declared {
            None => declared = Some(*total),
            Some(t) if t != *total => {
                return Err(CorruptDataError::Metadata(format!(
                    "ICC chunks disagree on count: {} vs {}",
                    t, total
                )))
            }
            _ => {}
        }
        chunks.push((*seq, data));
    }

    let Some(total) = declared else {
        return Ok(None);
    };
    chunks.sort_by_key(|(seq, _)| *seq);
    let sequence_ok = chunks.len() == total as usize
        && chunks
            .iter()
            .enumerate()
            .all(|(i, (seq, _))| *seq as usize == i + 1);
    if !sequence_ok {
        return Err(CorruptDataError::Metadata(format!(
            "ICC profile has {} of {} chunks or bad sequence numbers",
            chunks.len(),
            total
        )));
    }

    Ok(Some(chunks.into_iter().flat_map(|(_, d)| d.iter().copied()).collect()))
}

// =============================================================================
// ColorProfile
// =============================================================================

/// A validated ICC profile.
///
/// Only the header fields the codec needs are interpreted; the bytes are
/// carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColorProfile {
    /// Four-character data colour space signature, e.g. `"RGB "`
    pub color_space: String,

    /// Channels implied by the colour space
    pub channels: u16,

    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl ColorProfile {
    /// Validate a profile header.
    ///
    /// # Errors
    /// Returns `Metadata` when the profile is shorter than its header, the
    /// declared size does not match, the `acsp` signature is missing, or the
    /// colour space is not one the codec maps to a band count.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, CorruptDataError> {
        if bytes.len() < PROFILE_HEADER_LEN {
            return Err(CorruptDataError::Metadata(format!(
                "ICC profile of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if declared != bytes.len() {
            return Err(CorruptDataError::Metadata(format!(
                "ICC profile declares {} bytes but has {}",
                declared,
                bytes.len()
            )));
        }
        if &bytes[36..40] != b"acsp" {
            return Err(CorruptDataError::Metadata("ICC profile lacks acsp signature".into()));
        }

        let signature = &bytes[16..20];
        let channels = match signature {
            b"GRAY" => 1,
            b"RGB " | b"Lab " | b"XYZ " | b"YCbr" => 3,
            b"CMYK" => 4,
            other => {
                return Err(CorruptDataError::Metadata(format!(
                    "unsupported ICC colour space {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        Ok(Self {
            color_space: String::from_utf8_lossy(signature).into_owned(),
            channels,
            bytes,
        })
    }

    pub fn is_lab(&self) -> bool {
        self.color_space == "Lab "
    }
}
