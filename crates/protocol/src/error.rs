//! Protocol error types
//!
//! Errors that can occur when encoding, decoding or interpreting courier
//! protocol messages and events.

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message body is shorter than its fixed fields require
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    MessageTooShort { expected: usize, actual: usize },

    /// A frame carried a tag this implementation does not know
    #[error("unknown message tag {0:?}")]
    UnknownTag([u8; 4]),

    /// A fixed-size message declared the wrong body length
    #[error("invalid {tag} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Body (compressed or decompressed) exceeds the protocol limit
    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// zlib stream could not be produced or consumed
    #[error("compression error: {0}")]
    Compression(String),

    /// An event entry inside a data frame was malformed
    #[error("malformed event stream: {0}")]
    MalformedEvents(String),

    /// Event bytes were not a JSON object
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] serde_json::Error),

    /// Nonce was not exactly 16 bytes
    #[error("invalid nonce length: expected 16 bytes, got {0}")]
    InvalidNonceLength(usize),
}

impl ProtocolError {
    /// Create a message too short error
    #[inline]
    pub fn too_short(expected: usize, actual: usize) -> Self {
        Self::MessageTooShort { expected, actual }
    }

    /// Create an invalid fixed length error
    #[inline]
    pub fn invalid_length(tag: &'static str, expected: usize, actual: usize) -> Self {
        Self::InvalidLength {
            tag,
            expected,
            actual,
        }
    }

    /// Create a message too large error
    #[inline]
    pub fn too_large(size: usize, max: usize) -> Self {
        Self::MessageTooLarge { size, max }
    }

    /// Create a compression error
    #[inline]
    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a malformed event stream error
    #[inline]
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEvents(msg.into())
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;
