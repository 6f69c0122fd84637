//! Decoder for legacy-encoded aggregator links.
//!
//! The payload is URL-safe base64 over a small tag/length/value envelope:
//!
//! ```text
//! 0x08 <wire type> 0x22 <len> <len bytes of UTF-8 URL> [trailing records...]
//! ```
//!
//! Only the first record is read; anything after it is ignored.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use url::Url;

use super::ResolutionError;

/// Leading characters of a legacy payload (base64 of the tag and wire-type bytes).
pub(crate) const LEGACY_MARKER: &str = "CBM";

const TAG: u8 = 0x08;
const LENGTH_MARKER: u8 = 0x22;

/// URL-safe alphabet, padding optional, tolerant of non-zero trailing bits.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decode a legacy payload into the first URL it carries.
///
/// # Errors
///
/// - [`ResolutionError::InvalidBase64`] if the payload is not base64
/// - [`ResolutionError::Envelope`] / [`ResolutionError::NotUtf8`] for a
///   malformed envelope
/// - [`ResolutionError::EmptyUrl`] / [`ResolutionError::NotAbsolute`] if the
///   recovered text is not a usable absolute URL
pub fn decode_payload(payload: &str) -> Result<String, ResolutionError> {
    let bytes = PAYLOAD_ENGINE
        .decode(payload)
        .map_err(|_| ResolutionError::InvalidBase64)?;
    first_url(&bytes)
}

fn first_url(bytes: &[u8]) -> Result<String, ResolutionError> {
    let mut cursor = ByteCursor::new(bytes);
    cursor.expect(TAG, "tag")?;
    cursor.read_u8("wire type")?;
    cursor.expect(LENGTH_MARKER, "length marker")?;
    let len = usize::from(cursor.read_u8("length")?);
    let raw = cursor.take(len, "url")?;

    let text = std::str::from_utf8(raw).map_err(|_| ResolutionError::NotUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ResolutionError::EmptyUrl);
    }

    match Url::parse(text) {
        Ok(url) if url.has_host() => Ok(text.to_owned()),
        _ => Err(ResolutionError::NotAbsolute(text.to_owned())),
    }
}

/// Bounds-checked forward reader over the decoded bytes.
struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, ResolutionError> {
        let byte = *self.bytes.get(self.pos).ok_or_else(|| truncated(field, self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8, field: &'static str) -> Result<(), ResolutionError> {
        let at = self.pos;
        let found = self.read_u8(field)?;
        if found != expected {
            return Err(ResolutionError::Envelope(format!(
                "expected {field} 0x{expected:02x} at offset {at}, found 0x{found:02x}"
            )));
        }
        Ok(())
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], ResolutionError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                ResolutionError::Envelope(format!(
                    "{field} declares {len} bytes at offset {}, only {} remain",
                    self.pos,
                    self.bytes.len() - self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn truncated(field: &str, offset: usize) -> ResolutionError {
    ResolutionError::Envelope(format!("truncated before {field} at offset {offset}"))
}
