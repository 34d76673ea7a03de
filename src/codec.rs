//! Message framing: headers, flags and the byte codec.
//!
//! A message is a fixed 21-byte big-endian header followed by the bincode
//! encoding of the body selected by the header's `(protocol, message_type)`
//! pair. [`encode`] and [`decode`] are pure transforms over one message;
//! [`EtpFrameCodec`] adds a 4-byte length prefix so messages can be carried
//! over a byte stream with `tokio_util::codec::Framed`.

use std::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub mod error;

pub use error::{CodecError, MalformedMessage};

use crate::{
    message::{MessageBody, MessageKind},
    protocol::Protocol,
};

/// Size of the encoded header in bytes.
pub const HEADER_LEN: usize = 21;

/// Minimum accepted frame length limit.
pub const MIN_FRAME_LENGTH: usize = 64;

/// Maximum accepted frame length limit (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub(crate) fn clamp_frame_length(value: usize) -> usize {
    value.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH)
}

/// Header flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Last message of a (possibly multi-part) response.
    pub const FINAL_PART: Self = Self(0b001);
    /// Header only; the body is empty.
    pub const NO_DATA: Self = Self(0b010);
    /// The sender asks for an `Acknowledge`.
    pub const ACKNOWLEDGE: Self = Self(0b100);

    const ALL: u8 = 0b111;

    /// Build flags from raw bits, rejecting undefined bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    #[must_use]
    pub const fn with(self, other: Self) -> Self { Self(self.0 | other.0) }

    #[must_use]
    pub const fn without(self, other: Self) -> Self { Self(self.0 & !other.0) }
}

impl BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { self.with(rhs) }
}

impl BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: Self) { *self = self.with(rhs); }
}

/// Message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageHeader {
    pub protocol: u16,
    pub message_type: u16,
    /// Sender-assigned id, unique for the sender's side of a session.
    pub message_id: i64,
    /// Id of the message being answered, or `0`.
    pub correlation_id: i64,
    pub flags: MessageFlags,
}

impl MessageHeader {
    /// Build the header for `body` travelling on `protocol`.
    ///
    /// The no-data flag is derived from the body.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage::BodyMismatch`] if the body kind is not
    /// valid on `protocol`.
    pub fn for_body(
        protocol: Protocol,
        body: &MessageBody,
        message_id: i64,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> Result<Self, MalformedMessage> {
        let message_type = match body.kind() {
            Some(kind) if kind.is_valid_on(protocol) => kind.message_type(),
            _ => {
                return Err(MalformedMessage::BodyMismatch {
                    protocol: protocol.id(),
                    message_type: 0,
                });
            }
        };
        Ok(Self {
            protocol: protocol.id(),
            message_type,
            message_id,
            correlation_id,
            flags: flags.without(MessageFlags::NO_DATA),
        })
    }

    /// Header for a body-less message of `kind` such as `Acknowledge`.
    #[must_use]
    pub fn no_data(
        protocol: Protocol,
        kind: MessageKind,
        message_id: i64,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> Self {
        Self {
            protocol: protocol.id(),
            message_type: kind.message_type(),
            message_id,
            correlation_id,
            flags: flags | MessageFlags::NO_DATA,
        }
    }

    /// The known protocol named by this header.
    #[must_use]
    pub fn protocol_kind(&self) -> Option<Protocol> { Protocol::from_id(self.protocol) }

    /// The catalog entry named by this header.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        self.protocol_kind()
            .and_then(|p| MessageKind::from_pair(p, self.message_type))
    }

    #[must_use]
    pub fn is_final(&self) -> bool { self.flags.contains(MessageFlags::FINAL_PART) }

    fn write(&self, dst: &mut BytesMut) {
        dst.put_u16(self.protocol);
        dst.put_u16(self.message_type);
        dst.put_i64(self.message_id);
        dst.put_i64(self.correlation_id);
        dst.put_u8(self.flags.bits());
    }

    fn read(mut src: &[u8]) -> Result<Self, MalformedMessage> {
        if src.len() < HEADER_LEN {
            return Err(MalformedMessage::TruncatedHeader {
                have: src.len(),
                need: HEADER_LEN,
            });
        }
        let protocol = src.get_u16();
        let message_type = src.get_u16();
        let message_id = src.get_i64();
        let correlation_id = src.get_i64();
        let bits = src.get_u8();
        let flags = MessageFlags::from_bits(bits).ok_or(MalformedMessage::UnknownFlags { bits })?;
        Ok(Self {
            protocol,
            message_type,
            message_id,
            correlation_id,
            flags,
        })
    }
}

/// A header and its body.
#[derive(Clone, Debug, PartialEq)]
pub struct EtpMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl EtpMessage {
    #[must_use]
    pub fn new(header: MessageHeader, body: MessageBody) -> Self { Self { header, body } }

    /// Catalog entry named by the header.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> { self.header.kind() }
}

/// Check that `body` is what `header` announces.
fn validate(header: &MessageHeader, body: &MessageBody) -> Result<(), MalformedMessage> {
    let mismatch = || MalformedMessage::BodyMismatch {
        protocol: header.protocol,
        message_type: header.message_type,
    };
    let no_data = header.flags.contains(MessageFlags::NO_DATA);
    let Some(kind) = header.kind() else {
        return match body {
            MessageBody::Unsupported(raw) if raw.is_empty() == no_data => Ok(()),
            MessageBody::Unsupported(raw) => Err(MalformedMessage::NoDataMismatch {
                flag: no_data,
                len: raw.len(),
            }),
            _ => Err(mismatch()),
        };
    };
    match body {
        MessageBody::Empty if no_data => Ok(()),
        MessageBody::Empty => Err(MalformedMessage::NoDataMismatch { flag: false, len: 0 }),
        _ if no_data => Err(MalformedMessage::NoDataMismatch { flag: true, len: 1 }),
        _ if body.kind() == Some(kind) => Ok(()),
        _ => Err(mismatch()),
    }
}

/// Encode a message into its wire bytes (without length prefix).
///
/// # Errors
///
/// Returns [`MalformedMessage`] if the body does not match the header or
/// cannot be serialized.
///
/// # Examples
///
/// ```
/// use wellstream::{
///     codec::{MessageFlags, MessageHeader, decode, encode},
///     message::{CloseSession, MessageBody},
///     protocol::Protocol,
/// };
///
/// let body = MessageBody::CloseSession(CloseSession { reason: "done".into() });
/// let header =
///     MessageHeader::for_body(Protocol::Core, &body, 7, 0, MessageFlags::FINAL_PART).unwrap();
/// let bytes = encode(&header, &body).unwrap();
/// let decoded = decode(&bytes).unwrap();
/// assert_eq!(decoded.header, header);
/// assert_eq!(decoded.body, body);
/// ```
pub fn encode(header: &MessageHeader, body: &MessageBody) -> Result<Bytes, MalformedMessage> {
    validate(header, body)?;
    let payload = body.encode()?;
    let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.write(&mut dst);
    dst.extend_from_slice(&payload);
    Ok(dst.freeze())
}

/// Decode one message from its wire bytes (without length prefix).
///
/// Messages whose `(protocol, message_type)` pair has no catalog entry decode
/// to [`MessageBody::Unsupported`] so the receiver can reject them without
/// tearing down the connection.
///
/// # Errors
///
/// Returns [`MalformedMessage`] if the header is truncated, carries unknown
/// flags, or the body does not decode exactly with the
/// schema its header announces.
pub fn decode(bytes: &[u8]) -> Result<EtpMessage, MalformedMessage> {
    let header = MessageHeader::read(bytes)?;
    let payload = &bytes[HEADER_LEN..];
    let no_data = header.flags.contains(MessageFlags::NO_DATA);

    let Some(kind) = header.kind() else {
        if no_data != payload.is_empty() {
            return Err(MalformedMessage::NoDataMismatch {
                flag: no_data,
                len: payload.len(),
            });
        }
        return Ok(EtpMessage::new(
            header,
            MessageBody::Unsupported(payload.to_vec()),
        ));
    };

    if no_data {
        if !payload.is_empty() {
            return Err(MalformedMessage::NoDataMismatch {
                flag: true,
                len: payload.len(),
            });
        }
        return Ok(EtpMessage::new(header, MessageBody::Empty));
    }
    if kind.is_bodyless() {
        return Err(MalformedMessage::NoDataMismatch {
            flag: false,
            len: payload.len(),
        });
    }

    let (body, used) = MessageBody::decode(kind, payload)?;
    if used != payload.len() {
        return Err(MalformedMessage::TrailingBytes {
            remaining: payload.len() - used,
        });
    }
    Ok(EtpMessage::new(header, body))
}

/// Length-prefixed stream codec for [`EtpMessage`]s.
#[derive(Debug)]
pub struct EtpFrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
}

impl EtpFrameCodec {
    /// Construct a codec accepting frames up to `max_frame_length` bytes,
    /// clamped to [`MIN_FRAME_LENGTH`]..=[`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        let max_frame_length = clamp_frame_length(max_frame_length);
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
        }
    }

    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }
}

impl Default for EtpFrameCodec {
    fn default() -> Self { Self::new(1024 * 1024) }
}

impl Decoder for EtpFrameCodec {
    type Item = EtpMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(decode(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<EtpMessage> for EtpFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: EtpMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = encode(&item.header, &item.body)?;
        self.inner.encode(bytes, dst)?;
        Ok(())
    }
}
