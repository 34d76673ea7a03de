//! Bodies of the core (session) protocol and the protocol-agnostic exception.

use bincode::{Decode, Encode};

use crate::protocol::{ErrorCode, SupportedProtocol};

/// Sent by a client to open a session.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct RequestSession {
    pub application_name: String,
    pub application_version: String,
    pub requested_protocols: Vec<SupportedProtocol>,
    /// Object content types the client wants to work with. Empty means "all".
    pub supported_objects: Vec<String>,
}

/// Server reply to [`RequestSession`] listing the negotiated protocols.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct OpenSession {
    pub application_name: String,
    pub application_version: String,
    pub session_id: String,
    /// Negotiated protocols carrying the server's role for each.
    pub supported_protocols: Vec<SupportedProtocol>,
    pub supported_objects: Vec<String>,
}

/// Graceful session teardown.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CloseSession {
    pub reason: String,
}

/// Wire-level error report, valid on every protocol.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ProtocolException {
    pub error_code: u32,
    pub error_message: String,
}

impl ProtocolException {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code.code(),
            error_message: message.into(),
        }
    }

    /// The decoded error code, if it is one this crate knows.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> { ErrorCode::from_code(self.error_code) }
}

impl std::fmt::Display for ProtocolException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.error_code, self.error_message)
    }
}
