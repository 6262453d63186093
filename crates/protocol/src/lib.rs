//! Courier Protocol - events and the courier wire format
//!
//! This crate provides the types that flow from the spooler to the wire:
//! - `Event` - a log event with its pre-serialized JSON form
//! - `Nonce` - 16-byte payload identifier used to correlate acks
//! - `Message` - the closed set of courier frames (`HELO` .. `EVNT`)
//! - `FrameDecoder` / `encode` - framing with zlib event streams
//!
//! # Wire format
//!
//! ```text
//! [4-byte ASCII tag][4-byte big-endian length][body]
//! ```
//!
//! `JDAT` bodies are `nonce || zlib(events)` with a 10 MiB limit. `EVNT`
//! uses the length sentinel `0xFFFFFFFF` and ends where the zlib stream
//! ends.

mod codec;
mod error;
mod event;
mod message;
mod nonce;

pub use codec::{
    COMPRESSION_LEVEL, FrameDecoder, HEADER_LENGTH, MAX_BODY_LENGTH, MAX_DECOMPRESSED_LENGTH,
    STREAM_LENGTH, compress_events, encode, encode_data_frame, split_events,
};
pub use error::ProtocolError;
pub use event::{Event, EventBuilder, MESSAGE_KEY, OFFSET_KEY, SOURCE_KEY, TIMESTAMP_KEY};
pub use message::{
    ACK_LENGTH, FLAG_SUPPORTS_EVNT, HANDSHAKE_LENGTH, Handshake, IDENT, Message, tag,
};
pub use nonce::{NONCE_LENGTH, Nonce};

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
