//! Codec for encoding and decoding Herald frames.
//!
//! Clients speak JSON over text frames by default. Binary frames carry the
//! same structures encoded as MessagePack.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Wire encoding of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8 JSON, sent as WebSocket text.
    #[default]
    Json,
    /// MessagePack with named fields, sent as WebSocket binary.
    MessagePack,
}

/// Encode a value.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized or is too large.
pub fn encode<T: Serialize>(value: &T, encoding: Encoding) -> Result<Bytes, ProtocolError> {
    let payload = match encoding {
        Encoding::Json => serde_json::to_vec(value)?,
        Encoding::MessagePack => rmp_serde::to_vec_named(value)?,
    };

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode a value.
///
/// # Errors
///
/// Returns an error if the data is too large or does not describe a `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8], encoding: Encoding) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let value = match encoding {
        Encoding::Json => serde_json::from_slice(data)?,
        Encoding::MessagePack => rmp_serde::from_slice(data)?,
    };
    Ok(value)
}
