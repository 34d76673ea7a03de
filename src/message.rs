//! Typed message bodies and the catalog mapping them to wire identifiers.
//!
//! Each body type derives bincode's [`Encode`] and [`Decode`]; the
//! [`Message`] blanket trait provides the helpers used by the codec. The
//! closed [`MessageBody`] enum is what the session and handlers pass around,
//! and [`MessageKind`] ties each variant to its `(protocol, message_type)`
//! pair.

use bincode::error::{DecodeError, EncodeError};
use bincode::{BorrowDecode, Encode, borrow_decode_from_slice, config, encode_to_vec};

pub mod session;
pub mod streaming;

pub use self::session::{CloseSession, OpenSession, ProtocolException, RequestSession};
pub use self::streaming::{
    ChannelDescribe,
    ChannelMetadata,
    CloseChannel,
    InfillRealtimeData,
    OpenChannel,
    RealtimeData,
    Start,
};
use crate::{codec::MAX_FRAME_LENGTH, protocol::Protocol};

/// Decoding never claims more memory than one frame can carry.
const BODY_LIMIT: usize = MAX_FRAME_LENGTH;

/// Wrapper trait for wire message bodies.
///
/// Any type deriving [`Encode`] and [`BorrowDecode`] implements this trait
/// through the blanket implementation below.
pub trait Message: Encode + for<'de> BorrowDecode<'de, ()> {
    /// Serialize the message into a byte vector.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if serialization fails.
    fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_to_vec(self, config::standard().with_limit::<BODY_LIMIT>())
    }

    /// Deserialize a message from a byte slice, returning the message and
    /// the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if deserialization fails.
    fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), DecodeError>
    where
        Self: Sized,
    {
        borrow_decode_from_slice(bytes, config::standard().with_limit::<BODY_LIMIT>())
    }
}

impl<T> Message for T where for<'de> T: Encode + BorrowDecode<'de, ()> {}

/// Message type shared by every protocol for `ProtocolException`.
pub const PROTOCOL_EXCEPTION_TYPE: u16 = 1000;
/// Message type shared by every protocol for `Acknowledge`.
pub const ACKNOWLEDGE_TYPE: u16 = 1001;

/// Every message in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RequestSession,
    OpenSession,
    CloseSession,
    ProtocolException,
    Acknowledge,
    Start,
    ChannelDescribe,
    ChannelMetadata,
    RealtimeData,
    OpenChannel,
    CloseChannel,
    InfillRealtimeData,
}

impl MessageKind {
    /// Numeric message type within the owning protocol.
    #[must_use]
    pub const fn message_type(self) -> u16 {
        match self {
            MessageKind::RequestSession => 1,
            MessageKind::OpenSession => 2,
            MessageKind::CloseSession => 5,
            MessageKind::ProtocolException => PROTOCOL_EXCEPTION_TYPE,
            MessageKind::Acknowledge => ACKNOWLEDGE_TYPE,
            MessageKind::Start => 0,
            MessageKind::ChannelDescribe => 1,
            MessageKind::ChannelMetadata => 2,
            MessageKind::RealtimeData => 3,
            MessageKind::OpenChannel => 4,
            MessageKind::CloseChannel => 5,
            MessageKind::InfillRealtimeData => 6,
        }
    }

    /// Owning protocol, or `None` for kinds valid on every protocol.
    #[must_use]
    pub const fn protocol(self) -> Option<Protocol> {
        match self {
            MessageKind::ProtocolException | MessageKind::Acknowledge => None,
            MessageKind::RequestSession | MessageKind::OpenSession | MessageKind::CloseSession => {
                Some(Protocol::Core)
            }
            MessageKind::Start
            | MessageKind::ChannelDescribe
            | MessageKind::ChannelMetadata
            | MessageKind::RealtimeData
            | MessageKind::OpenChannel
            | MessageKind::CloseChannel
            | MessageKind::InfillRealtimeData => Some(Protocol::ChannelStreaming),
        }
    }

    /// Whether this kind may travel on `protocol`.
    #[must_use]
    pub fn is_valid_on(self, protocol: Protocol) -> bool {
        self.protocol().is_none_or(|p| p == protocol)
    }

    /// Resolve a header's `(protocol, message_type)` pair.
    #[must_use]
    pub fn from_pair(protocol: Protocol, message_type: u16) -> Option<Self> {
        match message_type {
            PROTOCOL_EXCEPTION_TYPE => return Some(MessageKind::ProtocolException),
            ACKNOWLEDGE_TYPE => return Some(MessageKind::Acknowledge),
            _ => {}
        }
        const CATALOG: [MessageKind; 10] = [
            MessageKind::RequestSession,
            MessageKind::OpenSession,
            MessageKind::CloseSession,
            MessageKind::Start,
            MessageKind::ChannelDescribe,
            MessageKind::ChannelMetadata,
            MessageKind::RealtimeData,
            MessageKind::OpenChannel,
            MessageKind::CloseChannel,
            MessageKind::InfillRealtimeData,
        ];
        CATALOG
            .into_iter()
            .find(|k| k.protocol() == Some(protocol) && k.message_type() == message_type)
    }

    /// Kinds with no body schema; they only travel with the no-data flag.
    #[must_use]
    pub const fn is_bodyless(self) -> bool { matches!(self, MessageKind::Acknowledge) }
}

/// Body of a decoded message.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    /// Header-only message; the no-data flag is set.
    Empty,
    RequestSession(RequestSession),
    OpenSession(OpenSession),
    CloseSession(CloseSession),
    ProtocolException(ProtocolException),
    Start(Start),
    ChannelDescribe(ChannelDescribe),
    ChannelMetadata(ChannelMetadata),
    RealtimeData(RealtimeData),
    OpenChannel(OpenChannel),
    CloseChannel(CloseChannel),
    InfillRealtimeData(InfillRealtimeData),
    /// Raw body of a message addressed to a protocol this endpoint does not
    /// know.
    Unsupported(Vec<u8>),
}

impl MessageBody {
    /// Catalog entry for this body; `None` for `Empty` and `Unsupported`.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        let kind = match self {
            MessageBody::Empty | MessageBody::Unsupported(_) => return None,
            MessageBody::RequestSession(_) => MessageKind::RequestSession,
            MessageBody::OpenSession(_) => MessageKind::OpenSession,
            MessageBody::CloseSession(_) => MessageKind::CloseSession,
            MessageBody::ProtocolException(_) => MessageKind::ProtocolException,
            MessageBody::Start(_) => MessageKind::Start,
            MessageBody::ChannelDescribe(_) => MessageKind::ChannelDescribe,
            MessageBody::ChannelMetadata(_) => MessageKind::ChannelMetadata,
            MessageBody::RealtimeData(_) => MessageKind::RealtimeData,
            MessageBody::OpenChannel(_) => MessageKind::OpenChannel,
            MessageBody::CloseChannel(_) => MessageKind::CloseChannel,
            MessageBody::InfillRealtimeData(_) => MessageKind::InfillRealtimeData,
        };
        Some(kind)
    }

    /// Serialize the body without its header.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            MessageBody::Empty => Ok(Vec::new()),
            MessageBody::Unsupported(raw) => Ok(raw.clone()),
            MessageBody::RequestSession(b) => b.to_bytes(),
            MessageBody::OpenSession(b) => b.to_bytes(),
            MessageBody::CloseSession(b) => b.to_bytes(),
            MessageBody::ProtocolException(b) => b.to_bytes(),
            MessageBody::Start(b) => b.to_bytes(),
            MessageBody::ChannelDescribe(b) => b.to_bytes(),
            MessageBody::ChannelMetadata(b) => b.to_bytes(),
            MessageBody::RealtimeData(b) => b.to_bytes(),
            MessageBody::OpenChannel(b) => b.to_bytes(),
            MessageBody::CloseChannel(b) => b.to_bytes(),
            MessageBody::InfillRealtimeData(b) => b.to_bytes(),
        }
    }

    /// Decode `bytes` with the schema of `kind`, returning the body and the
    /// number of bytes consumed.
    pub(crate) fn decode(kind: MessageKind, bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        fn wrap<T: Message>(
            bytes: &[u8],
            f: impl FnOnce(T) -> MessageBody,
        ) -> Result<(MessageBody, usize), DecodeError> {
            T::from_bytes(bytes).map(|(body, used)| (f(body), used))
        }
        match kind {
            MessageKind::Acknowledge => Err(DecodeError::Other("acknowledge carries no body")),
            MessageKind::RequestSession => wrap(bytes, MessageBody::RequestSession),
            MessageKind::OpenSession => wrap(bytes, MessageBody::OpenSession),
            MessageKind::CloseSession => wrap(bytes, MessageBody::CloseSession),
            MessageKind::ProtocolException => wrap(bytes, MessageBody::ProtocolException),
            MessageKind::Start => wrap(bytes, MessageBody::Start),
            MessageKind::ChannelDescribe => wrap(bytes, MessageBody::ChannelDescribe),
            MessageKind::ChannelMetadata => wrap(bytes, MessageBody::ChannelMetadata),
            MessageKind::RealtimeData => wrap(bytes, MessageBody::RealtimeData),
            MessageKind::OpenChannel => wrap(bytes, MessageBody::OpenChannel),
            MessageKind::CloseChannel => wrap(bytes, MessageBody::CloseChannel),
            MessageKind::InfillRealtimeData => wrap(bytes, MessageBody::InfillRealtimeData),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Protocol::Core, 1, Some(MessageKind::RequestSession))]
    #[case(Protocol::Core, 2, Some(MessageKind::OpenSession))]
    #[case(Protocol::ChannelStreaming, 1, Some(MessageKind::ChannelDescribe))]
    #[case(Protocol::ChannelStreaming, 1000, Some(MessageKind::ProtocolException))]
    #[case(Protocol::Store, 1001, Some(MessageKind::Acknowledge))]
    #[case(Protocol::Core, 3, None)]
    #[case(Protocol::Store, 1, None)]
    fn pairs_resolve_to_kinds(
        #[case] protocol: Protocol,
        #[case] message_type: u16,
        #[case] expected: Option<MessageKind>,
    ) {
        assert_eq!(MessageKind::from_pair(protocol, message_type), expected);
    }

    #[test]
    fn agnostic_kinds_are_valid_everywhere() {
        for protocol in Protocol::ALL {
            assert!(MessageKind::ProtocolException.is_valid_on(protocol));
        }
        assert!(!MessageKind::Start.is_valid_on(Protocol::Core));
    }
}
