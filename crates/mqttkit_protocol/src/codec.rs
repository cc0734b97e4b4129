//! Wire framing
//!
//! Every control packet is a fixed header byte, a variable-length "remaining
//! length" and a body of exactly that many bytes. `Packet::encode` produces
//! that framing; `Decoder` consumes it incrementally from a growing buffer so
//! callers can feed bytes as they arrive off the socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::ProtocolError;
use crate::packet::{Packet, PacketType};

/// Largest body a remaining length of four bytes can describe.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const MAX_LENGTH_BYTES: usize = 4;

/// Most the decoder reserves ahead of body bytes it has not seen yet.
pub const MAX_BODY_RESERVE: usize = 64 * 1024;

/// Writes `len` as a remaining length, 7 bits per byte, least significant
/// group first. Returns how many bytes were written.
pub fn write_remaining_length(buf: &mut BytesMut, len: usize) -> Result<usize, ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PayloadTooLong(len));
    }

    let mut remaining = len;
    let mut count = 0;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if remaining == 0 {
            return Ok(count);
        }
    }
}

/// Reads a remaining length from the front of `buf` without consuming it.
///
/// Returns the value and the number of length bytes, or `None` when `buf`
/// ends before the last length byte.
pub fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let (mut value, mut read) = (0, 0);
    for &byte in buf {
        if let Some(len) = length_step(&mut value, &mut read, byte)? {
            return Ok(Some((len, read)));
        }
    }
    Ok(None)
}

/// Folds one remaining-length byte into `value`, counting it in `read`.
/// Returns the length once its last byte has been seen.
fn length_step(
    value: &mut usize,
    read: &mut usize,
    byte: u8,
) -> Result<Option<usize>, ProtocolError> {
    *value += ((byte & 0x7f) as usize) << (7 * *read);
    *read += 1;
    if byte & 0x80 == 0 {
        return Ok(Some(*value));
    }
    if *read == MAX_LENGTH_BYTES {
        return Err(ProtocolError::MalformedRemainingLength);
    }
    Ok(None)
}

pub(crate) fn write_mqtt_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    write_mqtt_bytes(buf, value.as_bytes())
}

pub(crate) fn write_mqtt_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.extend_from_slice(value);
    Ok(())
}

fn truncated(what: &str) -> ProtocolError {
    ProtocolError::MalformedPacket(format!("packet body truncated while reading {what}"))
}

pub(crate) fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(truncated("a byte"));
    }
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(truncated("a 16-bit integer"));
    }
    Ok(buf.get_u16())
}

pub(crate) fn read_mqtt_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(truncated("a length-prefixed field"));
    }
    Ok(buf.split_to(len))
}

pub(crate) fn read_mqtt_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let bytes = read_mqtt_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Utf8)
}

impl Packet {
    /// Appends the framed packet to `buf` and returns the number of bytes
    /// written. Nothing is appended when encoding fails.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<usize, ProtocolError> {
        let mut body = BytesMut::new();
        self.write_body(&mut body)?;

        let start = buf.len();
        buf.put_u8(self.header());
        if let Err(err) = write_remaining_length(buf, body.len()) {
            buf.truncate(start);
            return Err(err);
        }
        buf.extend_from_slice(&body);
        Ok(buf.len() - start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Length { header: u8, value: usize, read: usize },
    Body { header: u8, remaining: usize },
}

/// Incremental packet decoder.
///
/// Feed it the connection's read buffer; it consumes at most one packet per
/// call and keeps partial progress between calls.
#[derive(Debug)]
pub struct Decoder {
    stage: Stage,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            stage: Stage::Header,
        }
    }

    /// Drops any partially decoded packet.
    pub fn reset(&mut self) {
        self.stage = Stage::Header;
    }

    /// True when no partial packet is buffered.
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Header
    }

    /// Decodes the next complete packet from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes belonging to a
    /// packet that fails to parse are consumed, so the next call starts on
    /// the following packet. A fatal error (see `ProtocolError::is_fatal`)
    /// resets the decoder; the caller is expected to drop the connection.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        loop {
            match self.stage {
                Stage::Header => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let header = buf.get_u8();
                    if PacketType::from_header(header).is_none() {
                        trace!("Discarding byte {header:#04x} with reserved packet type");
                        continue;
                    }
                    self.stage = Stage::Length {
                        header,
                        value: 0,
                        read: 0,
                    };
                }
                Stage::Length {
                    header,
                    mut value,
                    mut read,
                } => {
                    while !buf.is_empty() {
                        match length_step(&mut value, &mut read, buf.get_u8()) {
                            Ok(Some(remaining)) => {
                                self.stage = Stage::Body { header, remaining };
                                break;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                self.reset();
                                return Err(err);
                            }
                        }
                    }

                    if let Stage::Length { .. } = self.stage {
                        self.stage = Stage::Length {
                            header,
                            value,
                            read,
                        };
                        return Ok(None);
                    }
                }
                Stage::Body { header, remaining } => {
                    if buf.len() < remaining {
                        // The announced length is untrusted; grow in bounded steps.
                        buf.reserve((remaining - buf.len()).min(MAX_BODY_RESERVE));
                        return Ok(None);
                    }
                    let body = buf.split_to(remaining).freeze();
                    self.stage = Stage::Header;
                    return Packet::read(header, body).map(Some);
                }
            }
        }
    }
}
