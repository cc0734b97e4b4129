//! Protocol errors
//!
//! Errors raised while encoding or decoding control packets. Two of them
//! (`PayloadTooLong`, `MalformedRemainingLength`) break framing: once they
//! occur the byte stream can no longer be trusted and the connection has to
//! be torn down. Everything else is scoped to a single packet whose bytes
//! have already been consumed, so reading can continue.

use thiserror::Error;

use crate::codec::MAX_REMAINING_LENGTH;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload too long: {0} bytes exceeds the {MAX_REMAINING_LENGTH} byte maximum")]
    PayloadTooLong(usize),

    #[error("malformed remaining length: more than 4 length bytes")]
    MalformedRemainingLength,

    #[error("string too long: {0} bytes exceeds 65535")]
    StringTooLong(usize),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("string is not valid UTF-8")]
    Utf8,
}

impl ProtocolError {
    /// True when the error leaves the stream unframed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::PayloadTooLong(_) | ProtocolError::MalformedRemainingLength
        )
    }
}
