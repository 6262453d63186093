//! Courier frame codec
//!
//! Encoding writes complete frames into a `BytesMut`. Decoding follows the
//! read-buffer style used by the socket loops: callers append to a
//! `BytesMut` and call [`FrameDecoder::decode`] until it returns `None`.
//! Streamed `EVNT` bodies have no length, so the decoder keeps a zlib
//! inflater across calls and hands unconsumed bytes back in the buffer.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::error::ProtocolError;
use crate::message::{tag, Handshake, Message, ACK_LENGTH, HANDSHAKE_LENGTH};
use crate::nonce::{Nonce, NONCE_LENGTH};

/// Tag plus length
pub const HEADER_LENGTH: usize = 8;

/// Length sentinel marking a streamed `EVNT` body
pub const STREAM_LENGTH: u32 = u32::MAX;

/// Maximum size of a length-delimited body
pub const MAX_BODY_LENGTH: usize = 10 * 1024 * 1024;

/// Maximum size of a decompressed event stream
pub const MAX_DECOMPRESSED_LENGTH: usize = 64 * 1024 * 1024;

/// zlib level used for event streams
pub const COMPRESSION_LEVEL: u32 = 3;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Compress events into a zlib stream of `[u32 BE length][bytes]` entries
///
/// The same stream is the body tail of both `JDAT` and `EVNT`, so callers
/// can compress once and frame it either way.
pub fn compress_events<'a, I>(events: I) -> Result<Bytes, ProtocolError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    for event in events {
        let len = u32::try_from(event.len())
            .map_err(|_| ProtocolError::too_large(event.len(), u32::MAX as usize))?;
        encoder
            .write_all(&len.to_be_bytes())
            .and_then(|_| encoder.write_all(event))
            .map_err(|e| ProtocolError::compression(e.to_string()))?;
    }
    let compressed = encoder
        .finish()
        .map_err(|e| ProtocolError::compression(e.to_string()))?;
    Ok(Bytes::from(compressed))
}

/// Split a decompressed event stream back into events
pub fn split_events(data: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let mut data = data;
    let mut events = Vec::new();
    while !data.is_empty() {
        if data.len() < LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::malformed("truncated length prefix"));
        }
        let len = data.get_u32() as usize;
        if data.len() < len {
            return Err(ProtocolError::malformed(format!(
                "event of {len} bytes with {} remaining",
                data.len()
            )));
        }
        events.push(data.split_to(len));
    }
    Ok(events)
}

/// Write a data frame around an already-compressed event stream
///
/// `streamed` selects `EVNT` framing (length sentinel, no size limit);
/// otherwise a `JDAT` frame is written and the 10 MiB limit applies.
pub fn encode_data_frame(
    nonce: &Nonce,
    compressed: &[u8],
    streamed: bool,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if streamed {
        dst.reserve(HEADER_LENGTH + NONCE_LENGTH + compressed.len());
        dst.put_slice(&tag::EVNT);
        dst.put_u32(STREAM_LENGTH);
    } else {
        let body_len = NONCE_LENGTH + compressed.len();
        if body_len > MAX_BODY_LENGTH {
            return Err(ProtocolError::too_large(body_len, MAX_BODY_LENGTH));
        }
        dst.reserve(HEADER_LENGTH + body_len);
        dst.put_slice(&tag::JDAT);
        dst.put_u32(body_len as u32);
    }
    dst.put_slice(nonce.as_bytes());
    dst.put_slice(compressed);
    Ok(())
}

/// Encode a message as a complete frame
pub fn encode(message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    match message {
        Message::Helo(handshake) | Message::Vers(handshake) => {
            dst.reserve(HEADER_LENGTH + HANDSHAKE_LENGTH);
            dst.put_slice(&message.tag());
            dst.put_u32(HANDSHAKE_LENGTH as u32);
            dst.put_slice(&handshake.flags);
            dst.put_u32(handshake.major);
            dst.put_u32(handshake.minor);
            dst.put_u32(handshake.patch);
            dst.put_slice(&handshake.ident);
        }
        Message::Unknown | Message::Ping | Message::Pong => {
            dst.reserve(HEADER_LENGTH);
            dst.put_slice(&message.tag());
            dst.put_u32(0);
        }
        Message::Ack { nonce, sequence } => {
            dst.reserve(HEADER_LENGTH + ACK_LENGTH);
            dst.put_slice(&tag::ACKN);
            dst.put_u32(ACK_LENGTH as u32);
            dst.put_slice(nonce.as_bytes());
            dst.put_u32(*sequence);
        }
        Message::Jdat { nonce, events } | Message::Evnt { nonce, events } => {
            let compressed = compress_events(events.iter().map(|e| e.as_ref()))?;
            let streamed = matches!(message, Message::Evnt { .. });
            encode_data_frame(nonce, &compressed, streamed, dst)?;
        }
    }
    Ok(())
}

enum State {
    Header,
    Stream {
        nonce: Nonce,
        inflate: Decompress,
        out: Vec<u8>,
    },
}

/// Incremental frame decoder
pub struct FrameDecoder {
    state: State,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Header,
        }
    }

    /// Whether the decoder is part-way through a streamed `EVNT` body
    pub fn in_stream(&self) -> bool {
        matches!(self.state, State::Stream { .. })
    }

    /// Decode the next message from `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `buf`; anything after the decoded message is left.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if let State::Header = self.state {
            if buf.len() < HEADER_LENGTH {
                return Ok(None);
            }
            let frame_tag = [buf[0], buf[1], buf[2], buf[3]];
            let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

            if frame_tag == tag::EVNT && len == STREAM_LENGTH {
                if buf.len() < HEADER_LENGTH + NONCE_LENGTH {
                    return Ok(None);
                }
                let nonce = Nonce::from_slice(&buf[HEADER_LENGTH..HEADER_LENGTH + NONCE_LENGTH])?;
                buf.advance(HEADER_LENGTH + NONCE_LENGTH);
                self.state = State::Stream {
                    nonce,
                    inflate: Decompress::new(true),
                    out: Vec::new(),
                };
            } else {
                let len = len as usize;
                if len > MAX_BODY_LENGTH {
                    return Err(ProtocolError::too_large(len, MAX_BODY_LENGTH));
                }
                if buf.len() < HEADER_LENGTH + len {
                    buf.reserve(HEADER_LENGTH + len - buf.len());
                    return Ok(None);
                }
                buf.advance(HEADER_LENGTH);
                let body = buf.split_to(len).freeze();
                return parse_body(frame_tag, body).map(Some);
            }
        }

        self.decode_stream(buf)
    }

    fn decode_stream(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let State::Stream {
            nonce,
            inflate,
            out,
        } = &mut self.state
        else {
            return Ok(None);
        };

        loop {
            if buf.is_empty() {
                return Ok(None);
            }
            if out.capacity() - out.len() < 32 * 1024 {
                out.reserve((buf.len() * 4).max(64 * 1024));
            }

            let before_in = inflate.total_in();
            let before_out = inflate.total_out();
            let status = inflate
                .decompress_vec(&buf[..], out, FlushDecompress::None)
                .map_err(|e| ProtocolError::compression(e.to_string()))?;
            let consumed = (inflate.total_in() - before_in) as usize;
            let produced = (inflate.total_out() - before_out) as usize;
            buf.advance(consumed);

            if out.len() > MAX_DECOMPRESSED_LENGTH {
                return Err(ProtocolError::too_large(out.len(), MAX_DECOMPRESSED_LENGTH));
            }

            match status {
                Status::StreamEnd => {
                    let nonce = *nonce;
                    let data = Bytes::from(std::mem::take(out));
                    self.state = State::Header;
                    let events = split_events(data)?;
                    return Ok(Some(Message::Evnt { nonce, events }));
                }
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

fn parse_body(frame_tag: [u8; 4], body: Bytes) -> Result<Message, ProtocolError> {
    match frame_tag {
        tag::HELO => Ok(Message::Helo(parse_handshake(&body))),
        tag::VERS => Ok(Message::Vers(parse_handshake(&body))),
        tag::UNKN => Ok(Message::Unknown),
        tag::PING => {
            expect_empty("PING", &body)?;
            Ok(Message::Ping)
        }
        tag::PONG => {
            expect_empty("PONG", &body)?;
            Ok(Message::Pong)
        }
        tag::ACKN => {
            if body.len() != ACK_LENGTH {
                return Err(ProtocolError::invalid_length("ACKN", ACK_LENGTH, body.len()));
            }
            let nonce = Nonce::from_slice(&body[..NONCE_LENGTH])?;
            let sequence = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
            Ok(Message::Ack { nonce, sequence })
        }
        tag::JDAT | tag::EVNT => {
            if body.len() < NONCE_LENGTH {
                return Err(ProtocolError::too_short(NONCE_LENGTH, body.len()));
            }
            let nonce = Nonce::from_slice(&body[..NONCE_LENGTH])?;
            let events = split_events(inflate_all(&body[NONCE_LENGTH..])?)?;
            if frame_tag == tag::JDAT {
                Ok(Message::Jdat { nonce, events })
            } else {
                Ok(Message::Evnt { nonce, events })
            }
        }
        other => Err(ProtocolError::UnknownTag(other)),
    }
}

/// Handshake bodies from older peers may be short; absent fields read as zero
fn parse_handshake(body: &[u8]) -> Handshake {
    let mut padded = [0u8; HANDSHAKE_LENGTH];
    let n = body.len().min(HANDSHAKE_LENGTH);
    padded[..n].copy_from_slice(&body[..n]);
    let word = |at: usize| u32::from_be_bytes([padded[at], padded[at + 1], padded[at + 2], padded[at + 3]]);
    Handshake {
        flags: [padded[0], padded[1], padded[2], padded[3]],
        major: word(4),
        minor: word(8),
        patch: word(12),
        ident: [padded[16], padded[17], padded[18], padded[19]],
    }
}

fn expect_empty(name: &'static str, body: &[u8]) -> Result<(), ProtocolError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::invalid_length(name, 0, body.len()))
    }
}

fn inflate_all(compressed: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut decoder = flate2::read::ZlibDecoder::new(compressed)
        .take(MAX_DECOMPRESSED_LENGTH as u64 + 1);
    let mut out = Vec::with_capacity(compressed.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::compression(e.to_string()))?;
    if out.len() > MAX_DECOMPRESSED_LENGTH {
        return Err(ProtocolError::too_large(out.len(), MAX_DECOMPRESSED_LENGTH));
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;
