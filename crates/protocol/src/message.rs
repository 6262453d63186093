//! Courier protocol messages
//!
//! Every frame is `[4-byte ASCII tag][4-byte big-endian length][body]`.
//! The set of messages is closed; see [`Message`].

use bytes::Bytes;

use crate::nonce::Nonce;

/// Frame tags
pub mod tag {
    pub const HELO: [u8; 4] = *b"HELO";
    pub const VERS: [u8; 4] = *b"VERS";
    pub const UNKN: [u8; 4] = *b"????";
    pub const PING: [u8; 4] = *b"PING";
    pub const PONG: [u8; 4] = *b"PONG";
    pub const ACKN: [u8; 4] = *b"ACKN";
    pub const JDAT: [u8; 4] = *b"JDAT";
    pub const EVNT: [u8; 4] = *b"EVNT";
}

/// Flag bit (byte 0) announcing support for streamed `EVNT` frames
pub const FLAG_SUPPORTS_EVNT: u8 = 0x01;

/// Length of a `HELO`/`VERS` body
pub const HANDSHAKE_LENGTH: usize = 20;

/// Length of an `ACKN` body
pub const ACK_LENGTH: usize = 20;

/// Identifier sent by this implementation in handshakes
pub const IDENT: [u8; 4] = *b"CRRS";

/// Body of `HELO` and `VERS`
///
/// Layout: 4 flag bytes, then major, minor and patch versions as
/// big-endian u32, then a 4-byte ASCII identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub flags: [u8; 4],
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub ident: [u8; 4],
}

impl Handshake {
    /// Handshake describing this build
    pub fn current(supports_evnt: bool) -> Self {
        let mut flags = [0u8; 4];
        if supports_evnt {
            flags[0] |= FLAG_SUPPORTS_EVNT;
        }
        Self {
            flags,
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            ident: IDENT,
        }
    }

    #[inline]
    pub fn supports_evnt(&self) -> bool {
        self.flags[0] & FLAG_SUPPORTS_EVNT != 0
    }

    /// Identifier as text, for logging
    pub fn ident_str(&self) -> String {
        String::from_utf8_lossy(&self.ident).into_owned()
    }
}

/// A courier protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client hello
    Helo(Handshake),
    /// Server version reply
    Vers(Handshake),
    /// Reply from a server that did not understand the last message
    Unknown,
    Ping,
    Pong,
    /// Acknowledgement of the first `sequence` events of a payload
    Ack { nonce: Nonce, sequence: u32 },
    /// Length-delimited compressed payload
    Jdat { nonce: Nonce, events: Vec<Bytes> },
    /// Streamed compressed payload, terminated by the zlib end of stream
    Evnt { nonce: Nonce, events: Vec<Bytes> },
}

impl Message {
    /// Frame tag for this message
    pub fn tag(&self) -> [u8; 4] {
        match self {
            Self::Helo(_) => tag::HELO,
            Self::Vers(_) => tag::VERS,
            Self::Unknown => tag::UNKN,
            Self::Ping => tag::PING,
            Self::Pong => tag::PONG,
            Self::Ack { .. } => tag::ACKN,
            Self::Jdat { .. } => tag::JDAT,
            Self::Evnt { .. } => tag::EVNT,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Helo(_) => "HELO",
            Self::Vers(_) => "VERS",
            Self::Unknown => "????",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Ack { .. } => "ACKN",
            Self::Jdat { .. } => "JDAT",
            Self::Evnt { .. } => "EVNT",
        }
    }
}
