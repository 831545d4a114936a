//! base64url (no padding) helpers.
//!
//! Everything string-encoded on the wire — PSKs, token halves, attach
//! instance ids, key files — uses this alphabet. Decoding is strict: `=`,
//! `+`, `/` and lengths ≡ 1 (mod 4) are rejected.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::{ErrorCode, FsError, FsResult, Stage};

pub fn encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn decode(s: &str) -> FsResult<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(s).map_err(|e| {
        FsError::new(Stage::Validate, ErrorCode::InvalidB64)
            .with_message("invalid base64url")
            .with_source(e)
    })
}

/// Decode into a fixed-size array; rejects any other decoded length.
pub fn decode_exact<const N: usize>(s: &str) -> FsResult<[u8; N]> {
    let raw = decode(s)?;
    raw.try_into().map_err(|v: Vec<u8>| {
        FsError::new(Stage::Validate, ErrorCode::InvalidB64)
            .with_message(format!("expected {N} bytes, got {}", v.len()))
    })
}
