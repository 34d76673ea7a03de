//! Error types for the message codec.
//!
//! Every decode or encode failure short of an I/O error is a malformed
//! message: the bytes could not be turned into a well-formed header and body
//! pair, or the body did not match the schema its header announces. A
//! malformed inbound frame is fatal to the session.

use std::io;

use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

/// Reasons a message is malformed.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    /// Fewer bytes than a complete header.
    #[error("truncated header: have {have} bytes, need {need}")]
    TruncatedHeader {
        /// Bytes available.
        have: usize,
        /// Header size.
        need: usize,
    },

    /// The flags byte carries bits outside the defined set.
    #[error("unknown flag bits {bits:#04x}")]
    UnknownFlags {
        /// The offending flag byte.
        bits: u8,
    },

    /// The body does not belong to the header's `(protocol, message_type)`.
    #[error("body does not match header pair ({protocol}, {message_type})")]
    BodyMismatch {
        /// Protocol id from the header.
        protocol: u16,
        /// Message type from the header.
        message_type: u16,
    },

    /// The no-data flag disagrees with the presence of body bytes.
    #[error("no-data flag is {flag} but body length is {len}")]
    NoDataMismatch {
        /// Whether the no-data flag was set.
        flag: bool,
        /// Body length in bytes.
        len: usize,
    },

    /// Bytes remained after the body was decoded.
    #[error("{remaining} trailing bytes after body")]
    TrailingBytes {
        /// Unconsumed byte count.
        remaining: usize,
    },

    /// The body bytes failed schema decoding.
    #[error("body decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// The body could not be serialized.
    #[error("body encode failed: {0}")]
    Encode(#[from] EncodeError),
}

/// Top-level codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame could not be parsed into a well-formed message.
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    /// Transport I/O failure, including frame length violations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Returns `true` when the error is a malformed message rather than an
    /// I/O failure.
    #[must_use]
    pub fn is_malformed(&self) -> bool { matches!(self, Self::Malformed(_)) }
}

impl From<DecodeError> for CodecError {
    fn from(error: DecodeError) -> Self { Self::Malformed(MalformedMessage::Decode(error)) }
}

impl From<EncodeError> for CodecError {
    fn from(error: EncodeError) -> Self { Self::Malformed(MalformedMessage::Encode(error)) }
}
