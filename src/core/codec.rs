//! # Envelope Codec
//!
//! Framing for the checksummed envelope exchanged between peers.
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Command(12, ASCII, NUL-padded)] [Length(4, LE)] [Checksum(4)] [Payload(Length)]
//! ```
//! `Checksum` is the first four bytes of SHA-256 applied twice to the payload.
//!
//! ## Decoding
//! - Bytes before the next magic value are discarded (stream resynchronization).
//! - A length above the configured maximum rejects the envelope after
//!   consuming its magic value.
//! - A checksum mismatch rejects the envelope after consuming all of it, so
//!   the next call resumes at the following envelope.
//!
//! Decoding yields raw [`Frame`]s; turning a frame into a typed message is
//! the job of [`MessageRegistry`](crate::protocol::registry::MessageRegistry).
//!
//! ## Encoding
//! [`EnvelopeCodec::encode_message`] writes a whole envelope or nothing. When
//! the destination has too little room it reports the exact number of bytes
//! the envelope needs.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::WireMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Size of the magic prefix
pub const MAGIC_LEN: usize = 4;

/// Size of the NUL-padded command field
pub const COMMAND_LEN: usize = 12;

/// Total envelope header size
pub const HEADER_LEN: usize = MAGIC_LEN + COMMAND_LEN + 4 + 4;

const LENGTH_OFFSET: usize = MAGIC_LEN + COMMAND_LEN;
const CHECKSUM_OFFSET: usize = LENGTH_OFFSET + 4;

/// A framed envelope whose payload has not been interpreted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Size of this frame on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Result of a bounded encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// The whole envelope was appended, this many bytes
    Written(usize),
    /// Nothing was written; the envelope needs this many bytes
    Insufficient { required: usize },
}

/// First four bytes of SHA-256(SHA-256(payload))
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Validate a command and pad it to the fixed field width
pub fn encode_command(command: &str) -> Result<[u8; COMMAND_LEN]> {
    let bytes = command.as_bytes();
    if bytes.len() > COMMAND_LEN {
        return Err(ProtocolError::InvalidCommand(format!(
            "{}: {command:?}",
            constants::ERR_COMMAND_TOO_LONG
        )));
    }
    if !command.is_ascii() {
        return Err(ProtocolError::InvalidCommand(format!(
            "{}: {command:?}",
            constants::ERR_COMMAND_NOT_ASCII
        )));
    }
    let mut field = [0u8; COMMAND_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

fn decode_command(field: &[u8]) -> Result<String> {
    let end = field.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let trimmed = &field[..end];
    if !trimmed.is_ascii() {
        return Err(ProtocolError::InvalidCommand(
            constants::ERR_COMMAND_NOT_ASCII.to_string(),
        ));
    }
    Ok(trimmed.iter().map(|&b| char::from(b)).collect())
}

/// Stateless envelope framing for one network magic value
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    magic: [u8; MAGIC_LEN],
    max_payload: usize,
}

impl EnvelopeCodec {
    /// Codec accepting envelopes of at most `max_message_size` bytes in total
    pub fn new(magic: [u8; MAGIC_LEN], max_message_size: usize) -> Self {
        Self {
            magic,
            max_payload: max_message_size.saturating_sub(HEADER_LEN),
        }
    }

    pub fn magic(&self) -> [u8; MAGIC_LEN] {
        self.magic
    }

    /// Largest payload this codec accepts
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Largest whole envelope this codec accepts
    pub fn max_message_size(&self) -> usize {
        self.max_payload + HEADER_LEN
    }

    /// Discard bytes up to the next magic value.
    ///
    /// Returns false if no magic value is present; at most three trailing
    /// bytes are kept since they may be the start of one.
    fn resync(&self, src: &mut BytesMut) -> bool {
        if src.len() < MAGIC_LEN {
            return false;
        }
        match src.windows(MAGIC_LEN).position(|w| w == self.magic) {
            Some(0) => true,
            Some(pos) => {
                trace!(skipped = pos, "Resynchronized to magic value");
                src.advance(pos);
                true
            }
            None => {
                let skipped = src.len() - (MAGIC_LEN - 1);
                trace!(skipped, "No magic value in buffer");
                src.advance(skipped);
                false
            }
        }
    }

    /// Append the envelope for `message` to `dst` without letting it grow past `limit` bytes.
    ///
    /// Writes nothing and returns [`EncodeStatus::Insufficient`] when the
    /// envelope does not fit.
    pub fn encode_message<M: WireMessage>(
        &self,
        message: &M,
        version: u32,
        dst: &mut BytesMut,
        limit: usize,
    ) -> Result<EncodeStatus> {
        let command = encode_command(message.command())?;
        let length = message.encoded_len(version);
        if length > self.max_payload {
            return Err(ProtocolError::OversizedMessage {
                length: length + HEADER_LEN,
                max: self.max_message_size(),
            });
        }
        let required = HEADER_LEN + length;
        if dst.len() + required > limit {
            return Ok(EncodeStatus::Insufficient { required });
        }

        let start = dst.len();
        dst.reserve(required);
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(length as u32);
        dst.put_slice(&[0u8; 4]);
        message.encode_payload(version, dst);

        let written = dst.len() - start - HEADER_LEN;
        if written != length {
            dst.truncate(start);
            return Err(ProtocolError::MalformedPayload(format!(
                "{}: encoded {written} bytes but declared {length}",
                message.command()
            )));
        }
        let sum = checksum(&dst[start + HEADER_LEN..]);
        dst[start + CHECKSUM_OFFSET..start + HEADER_LEN].copy_from_slice(&sum);
        Ok(EncodeStatus::Written(required))
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if !self.resync(src) || src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_field = &src[LENGTH_OFFSET..CHECKSUM_OFFSET];
        let length = length_field.get_u32_le() as usize;
        if length > self.max_payload {
            src.advance(MAGIC_LEN);
            return Err(ProtocolError::OversizedMessage {
                length: length.saturating_add(HEADER_LEN),
                max: self.max_message_size(),
            });
        }
        if src.len() < HEADER_LEN + length {
            return Ok(None);
        }

        let header = src.split_to(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        let mut expected = [0u8; 4];
        expected.copy_from_slice(&header[CHECKSUM_OFFSET..HEADER_LEN]);
        let actual = checksum(&payload);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        let command = decode_command(&header[MAGIC_LEN..LENGTH_OFFSET])?;
        Ok(Some(Frame { command, payload }))
    }
}

impl Encoder<Frame> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let command = encode_command(&frame.command)?;
        if frame.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedMessage {
                length: frame.wire_len(),
                max: self.max_message_size(),
            });
        }
        dst.reserve(frame.wire_len());
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(frame.payload.len() as u32);
        dst.put_slice(&checksum(&frame.payload));
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
