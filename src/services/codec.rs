//! Stored-payload codec — optional gzip compression for large values.
//!
//! Compressed payloads are `gz1:` followed by base64 of the gzip stream.
//! Anything without the marker is plain serialized JSON and passes through.

use std::borrow::Cow;
use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

pub const COMPRESSED_MARKER: &str = "gz1:";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("gzip error: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decompressed payload is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[must_use]
pub fn is_compressed(stored: &str) -> bool {
    stored.starts_with(COMPRESSED_MARKER)
}

/// Gzip `text` and wrap it as a marked payload.
///
/// # Errors
///
/// Returns [`CodecError::Gzip`] if the encoder fails.
pub fn compress(text: &str) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let bytes = encoder.finish()?;
    Ok(format!("{COMPRESSED_MARKER}{}", STANDARD.encode(bytes)))
}

/// Return the serialized JSON behind a stored payload.
///
/// # Errors
///
/// Returns a [`CodecError`] if a marked payload cannot be decoded.
pub fn decode(stored: &str) -> Result<Cow<'_, str>, CodecError> {
    let Some(body) = stored.strip_prefix(COMPRESSED_MARKER) else {
        return Ok(Cow::Borrowed(stored));
    };
    let bytes = STANDARD.decode(body)?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Cow::Owned(String::from_utf8(out)?))
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod tests;
