#![doc(html_root_url = "https://docs.rs/wellstream/latest")]
//! Public API for the `wellstream` library.
//!
//! `wellstream` implements the session layer of the Energistics Transfer
//! Protocol: framing and the message catalog, capability negotiation,
//! request correlation, handler dispatch, channel streaming and
//! growing-object liveness tracking.
//!
//! A [`SessionBuilder`] turns any duplex byte stream into a [`Session`].
//! Protocol logic lives in [`ProtocolHandler`](registry::ProtocolHandler)
//! implementations bound to the session, such as
//! [`ChannelProducer`](streaming::ChannelProducer) and
//! [`ChannelConsumer`](streaming::ChannelConsumer). [`server::EtpServer`]
//! accepts TCP connections and runs one session per connection.

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod liveness;
pub mod message;
pub mod metrics;
pub mod preamble;
pub mod protocol;
pub mod registry;
mod rewind_stream;
pub mod server;
pub mod session;
pub mod streaming;

pub use capabilities::{CapabilityProvider, StaticCapabilities};
pub use codec::{EtpFrameCodec, EtpMessage, MessageFlags, MessageHeader};
pub use config::EtpConfig;
pub use error::{CloseReason, EtpError, Result};
pub use message::{MessageBody, MessageKind};
pub use metrics::{
    Direction,
    GROWING_OBJECTS_EXPIRED_TOTAL,
    MESSAGES_TOTAL,
    PROTOCOL_ERRORS_TOTAL,
    SESSIONS_ACTIVE,
};
pub use protocol::{ErrorCode, Protocol, Role, SupportedProtocol, Version};
pub use registry::{Capability, HandlerError, HandlerRegistry, ProtocolHandler};
pub use session::{Session, SessionBuilder, SessionState, WeakSession};
