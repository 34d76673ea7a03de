//! Canonical error and close-reason types for the crate.
//!
//! [`EtpError`] is the single error surface returned by session, streaming
//! and correlation operations. [`CloseReason`] records why a session left the
//! `Open` state; it travels inside [`EtpError::SessionClosed`] to every
//! caller whose pending operation was cut short.

use std::{fmt, io, time::Duration};

use thiserror::Error;

use crate::{
    codec::MalformedMessage,
    message::{MessageKind, ProtocolException},
    registry::RegistryError,
    session::SessionState,
};

/// Why a session is closing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally through [`crate::session::Session::close`].
    Requested(String),
    /// The peer sent `CloseSession`.
    PeerClosed(String),
    /// No inbound traffic within the configured idle timeout.
    IdleTimeout,
    /// Too many consecutive protocol failures.
    ProtocolErrors(u32),
    /// Capability negotiation failed.
    NegotiationFailed(String),
    /// An inbound frame could not be decoded.
    Malformed(String),
    /// The transport failed while reading or writing.
    Transport(String),
    /// The transport reached end of stream without a `CloseSession`.
    Disconnected,
}

impl CloseReason {
    /// Graceful closes flush queued outbound data; abrupt ones discard it.
    #[must_use]
    pub fn is_graceful(&self) -> bool {
        !matches!(
            self,
            CloseReason::Malformed(_) | CloseReason::Transport(_) | CloseReason::Disconnected
        )
    }

    /// Whether the local side announces the close with `CloseSession`.
    #[must_use]
    pub(crate) fn announces_close(&self) -> bool {
        matches!(
            self,
            CloseReason::Requested(_) | CloseReason::IdleTimeout | CloseReason::ProtocolErrors(_)
        )
    }

    /// Text carried by the `CloseSession` announcing this close. A local
    /// request sends the caller's reason unchanged.
    pub(crate) fn wire_reason(&self) -> String {
        match self {
            CloseReason::Requested(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested(reason) => write!(f, "closed locally: {reason}"),
            CloseReason::PeerClosed(reason) => write!(f, "closed by peer: {reason}"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::ProtocolErrors(count) => write!(f, "{count} consecutive protocol errors"),
            CloseReason::NegotiationFailed(reason) => write!(f, "negotiation failed: {reason}"),
            CloseReason::Malformed(reason) => write!(f, "malformed message: {reason}"),
            CloseReason::Transport(reason) => write!(f, "transport error: {reason}"),
            CloseReason::Disconnected => f.write_str("peer disconnected"),
        }
    }
}

/// Top-level error type exposed by `wellstream`.
#[derive(Debug, Error)]
pub enum EtpError {
    /// A message could not be encoded or decoded.
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    /// The peer answered with a `ProtocolException`.
    #[error("protocol exception: {0}")]
    Protocol(ProtocolException),

    /// A correlated request received no response in time.
    #[error("request {message_id} timed out after {timeout:?}")]
    Timeout {
        /// Id of the unanswered request.
        message_id: i64,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The session closed before the operation completed.
    #[error("session closed: {0}")]
    SessionClosed(CloseReason),

    /// The operation needs a different session state.
    #[error("operation not permitted in session state {0:?}")]
    InvalidState(SessionState),

    /// A channel id is not in the local metadata table.
    #[error("unrecognized channel {0}")]
    UnrecognizedChannel(i64),

    /// A channel id is already open for a different uri.
    #[error("channel {channel_id} is already open for {uri}")]
    ChannelInUse {
        /// The conflicting id.
        channel_id: i64,
        /// Uri currently bound to the id.
        uri: String,
    },

    /// A uri was never advertised by the producer.
    #[error("unknown channel uri {0}")]
    UnknownUri(String),

    /// A correlated response had a type the request did not expect.
    #[error("unexpected response type {0:?}")]
    UnexpectedResponse(Option<MessageKind>),

    /// A streaming handler is not attached to a live session.
    #[error("handler is not bound to an open session")]
    Unbound,

    /// Channel data was offered before streaming started.
    #[error("channel streaming has not started")]
    NotStarted,

    /// Handler registry lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EtpError {
    /// Returns `true` for errors that mean the session is gone.
    #[must_use]
    pub fn is_session_closed(&self) -> bool { matches!(self, Self::SessionClosed(_)) }
}

/// Result alias used across the crate.
pub type Result<T, E = EtpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::CloseReason;

    #[rstest]
    #[case(CloseReason::Requested("maintenance".into()), "maintenance")]
    #[case(CloseReason::Requested(String::new()), "")]
    #[case(CloseReason::IdleTimeout, "idle timeout")]
    #[case(CloseReason::ProtocolErrors(3), "3 consecutive protocol errors")]
    fn announced_reason_text(#[case] reason: CloseReason, #[case] expected: &str) {
        assert!(reason.announces_close());
        assert_eq!(reason.wire_reason(), expected);
    }

    #[test]
    fn local_display_keeps_its_prefix() {
        let reason = CloseReason::Requested("maintenance".into());
        assert_eq!(reason.to_string(), "closed locally: maintenance");
    }
}
