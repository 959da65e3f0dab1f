//! Byte/string conversions for the storage and wire formats.
//!
//! Keys, ciphertexts, IVs, salts and signatures travel as standard base64;
//! the public key hash (instance ID) travels as lowercase hex.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Errors from decoding an encoded field.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

pub fn encode_base64(bytes: impl AsRef<[u8]>) -> String {
    BASE64.encode(bytes)
}

pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(encoded.trim())?)
}

/// Decode a base64 field that must be exactly `N` bytes long.
pub fn decode_base64_array<const N: usize>(encoded: &str) -> Result<[u8; N], CodecError> {
    let bytes = decode_base64(encoded)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CodecError::Length { expected: N, actual })
}

pub fn encode_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(bytes)
}

pub fn decode_hex(encoded: &str) -> Result<Vec<u8>, CodecError> {
    Ok(hex::decode(encoded.trim())?)
}
