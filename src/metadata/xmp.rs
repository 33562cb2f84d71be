//! XMP packets.
//!
//! The packet is opaque UTF-8 XML. JPEG carries it in APP1 behind the XMP
//! namespace identifier; TIFF carries it as the Byte value of tag 700.

use serde::Serialize;

use crate::error::CorruptDataError;
use crate::format::jpeg::MAX_SEGMENT_PAYLOAD;

/// Identifier that opens an XMP APP1 payload.
pub const XMP_NAMESPACE: &[u8; 29] = b"http://ns.adobe.com/xap/1.0/\0";

/// An XMP packet, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct XmpPacket(pub String);

impl XmpPacket {
    pub fn new(xml: impl Into<String>) -> Self {
        Self(xml.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Build the APP1 payload.
    ///
    /// # Errors
    /// Returns `Metadata` if the packet does not fit in one segment.
    pub fn jpeg_payload(&self) -> Result<Vec<u8>, CorruptDataError> {
        let len = XMP_NAMESPACE.len() + self.0.len();
        if len > MAX_SEGMENT_PAYLOAD {
            return Err(CorruptDataError::Metadata(format!(
                "XMP packet of {} bytes does not fit in one APP1 segment",
                self.0.len()
            )));
        }
        let mut payload = Vec::with_capacity(len);
        payload.extend_from_slice(XMP_NAMESPACE);
        payload.extend_from_slice(self.0.as_bytes());
        Ok(payload)
    }

    /// Parse an APP1 payload. Returns `None` for non-XMP APP1 segments.
    pub fn from_jpeg_payload(payload: &[u8]) -> Option<Result<Self, CorruptDataError>> {
        let xml = payload.strip_prefix(XMP_NAMESPACE.as_slice())?;
        Some(Self::from_bytes(xml))
    }

    /// Decode a raw packet, dropping trailing NUL padding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CorruptDataError> {
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        std::str::from_utf8(&bytes[..end])
            .map(|s| Self(s.to_owned()))
            .map_err(|e| CorruptDataError::Metadata(format!("XMP packet is not UTF-8: {}", e)))
    }
}
