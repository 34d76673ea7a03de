//! Capability negotiation.
//!
//! The server answers `RequestSession` with the subset of requested protocols
//! it can serve: the protocol ids match, the roles are counterparts, the
//! major versions agree and, outside core, a handler is bound for the local
//! role. Core must be part of the agreement.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{info, warn};

use super::{PeerInfo, Session, SessionState, read};
use crate::{
    codec::{MessageFlags, MessageHeader},
    correlation::Response,
    error::{CloseReason, EtpError, Result},
    message::{MessageBody, OpenSession, ProtocolException, RequestSession},
    protocol::{ErrorCode, Protocol, Role, SupportedProtocol},
};

/// Protocols both sides agreed on, from each side's point of view.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Agreement {
    /// Entries carrying the local role.
    pub local: Vec<SupportedProtocol>,
    /// Entries carrying the peer's role.
    pub peer: Vec<SupportedProtocol>,
}

/// Intersect the peer's `requested` protocols with the local `offer`.
///
/// `bound` reports whether a handler exists for a non-core pair.
pub(crate) fn agree(
    offer: &[SupportedProtocol],
    requested: &[SupportedProtocol],
    bound: impl Fn(Protocol, Role) -> bool,
) -> std::result::Result<Agreement, ProtocolException> {
    let mut agreement = Agreement::default();
    for wanted in requested {
        let Some(protocol) = wanted.kind() else {
            continue;
        };
        let local_role = wanted.role.counterpart();
        let Some(local) = offer
            .iter()
            .find(|l| l.protocol == wanted.protocol && l.role == local_role)
        else {
            continue;
        };
        if !local.version.is_compatible_with(&wanted.version) {
            return Err(ProtocolException::new(
                ErrorCode::UnsupportedVersion,
                format!(
                    "{protocol} version {} is incompatible with {}",
                    wanted.version, local.version
                ),
            ));
        }
        if protocol != Protocol::Core && !bound(protocol, local_role) {
            continue;
        }
        if agreement.local.contains(local) {
            continue;
        }
        agreement.local.push(local.clone());
        agreement.peer.push(wanted.clone());
    }
    if !agreement
        .local
        .iter()
        .any(|e| e.kind() == Some(Protocol::Core))
    {
        return Err(ProtocolException::new(
            ErrorCode::NoRole,
            "no compatible core protocol role",
        ));
    }
    Ok(agreement)
}

/// Object types both sides work with. An empty list on either side means
/// "any".
pub(crate) fn intersect_object_types(requested: &[String], local: &[String]) -> Vec<String> {
    match (requested.is_empty(), local.is_empty()) {
        (true, _) => local.to_vec(),
        (false, true) => requested.to_vec(),
        (false, false) => requested
            .iter()
            .filter(|t| local.contains(t))
            .cloned()
            .collect(),
    }
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

fn new_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let sequence = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:016x}-{sequence:08x}", nanos & u128::from(u64::MAX))
}

impl Session {
    /// Server side: answer `RequestSession`.
    pub(super) fn negotiate(&self, header: &MessageHeader, request: RequestSession) {
        let offer = self.local_offer();
        let outcome = {
            let registry = read(&self.inner.registry);
            agree(&offer, &request.requested_protocols, |p, r| {
                registry.contains(p, r)
            })
        };
        let agreement = match outcome {
            Ok(agreement) => agreement,
            Err(exception) => {
                warn!(
                    "rejecting session request from {}: {exception}",
                    request.application_name
                );
                let reason = exception.error_message.clone();
                self.send_exception(header, exception);
                self.begin_close(CloseReason::NegotiationFailed(reason));
                return;
            }
        };

        let session_id = new_session_id();
        let _ = self.inner.session_id.set(session_id.clone());
        let object_types = intersect_object_types(
            &request.supported_objects,
            &self.inner.capabilities.supported_object_types(),
        );
        let open = OpenSession {
            application_name: self.inner.application_name.clone(),
            application_version: self.inner.application_version.clone(),
            session_id,
            supported_protocols: agreement.local,
            supported_objects: object_types.clone(),
        };
        let _ = self.inner.peer.set(PeerInfo {
            application_name: request.application_name,
            application_version: request.application_version,
            protocols: agreement.peer,
            object_types,
        });
        if let Err(error) = self.enqueue(
            Protocol::Core,
            MessageBody::OpenSession(open),
            header.message_id,
            MessageFlags::FINAL_PART,
        ) {
            warn!("failed to send OpenSession: {error}");
            return;
        }
        if self.transition(SessionState::Open) {
            info!(
                "session {} open with {:?}",
                self.session_id().unwrap_or("-"),
                self.negotiated_protocols()
            );
            self.activate();
        }
    }

    /// Client side: confirm the response to `RequestSession`.
    ///
    /// The driver normally accepted the `OpenSession` already, before reading
    /// the frames behind it.
    pub(super) fn complete_open(&self, response: &Response) -> Result<()> {
        if self.inner.activated.load(Ordering::Acquire) {
            return Ok(());
        }
        match response.first().map(|m| &m.body) {
            Some(MessageBody::OpenSession(open)) => self.accept_open(open.clone()),
            _ => Err(EtpError::UnexpectedResponse(
                response.first().and_then(|m| m.kind()),
            )),
        }
    }

    /// Client side: accept the server's `OpenSession`.
    pub(super) fn accept_open(&self, open: OpenSession) -> Result<()> {
        let offer = self.local_offer();
        let protocols: Vec<SupportedProtocol> = open
            .supported_protocols
            .into_iter()
            .filter(|server| {
                offer.iter().any(|local| {
                    local.protocol == server.protocol && local.role == server.role.counterpart()
                })
            })
            .collect();
        if !protocols.iter().any(|e| e.kind() == Some(Protocol::Core)) {
            return Err(EtpError::Protocol(ProtocolException::new(
                ErrorCode::NoRole,
                "server did not agree to the core protocol",
            )));
        }
        let _ = self.inner.session_id.set(open.session_id);
        let _ = self.inner.peer.set(PeerInfo {
            application_name: open.application_name,
            application_version: open.application_version,
            protocols,
            object_types: open.supported_objects,
        });
        if !self.transition(SessionState::Open) {
            return Err(EtpError::InvalidState(self.state()));
        }
        info!(
            "session {} open with {:?}",
            self.session_id().unwrap_or("-"),
            self.negotiated_protocols()
        );
        self.activate();
        Ok(())
    }

    /// Handle a core message that is not a response.
    pub(super) fn on_core(&self, header: &MessageHeader, body: MessageBody) {
        match body {
            MessageBody::RequestSession(request)
                if self.inner.endpoint == Role::Server
                    && self.state() == SessionState::Negotiating =>
            {
                self.negotiate(header, request);
            }
            MessageBody::RequestSession(_) => {
                self.reject(
                    header,
                    ProtocolException::new(
                        ErrorCode::InvalidState,
                        format!("cannot negotiate in state {}", self.state()),
                    ),
                );
            }
            MessageBody::CloseSession(close) => {
                self.begin_close(CloseReason::PeerClosed(close.reason));
            }
            _ => {
                self.reject(
                    header,
                    ProtocolException::new(
                        ErrorCode::InvalidMessageType,
                        format!("unexpected core message type {}", header.message_type),
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::protocol::Version;

    fn server_offer() -> Vec<SupportedProtocol> {
        vec![
            SupportedProtocol::new(Protocol::Core, Role::Server),
            SupportedProtocol::new(Protocol::ChannelStreaming, Role::Producer),
        ]
    }

    #[test]
    fn streaming_consumer_meets_local_producer() {
        let requested = vec![
            SupportedProtocol::new(Protocol::Core, Role::Client),
            SupportedProtocol::new(Protocol::ChannelStreaming, Role::Consumer),
        ];

        let agreement = agree(&server_offer(), &requested, |_, _| true).expect("agreement");

        assert_eq!(agreement.local, server_offer());
        assert_eq!(agreement.peer, requested);
    }

    #[test]
    fn unbound_protocols_are_left_out() {
        let requested = vec![
            SupportedProtocol::new(Protocol::Core, Role::Client),
            SupportedProtocol::new(Protocol::ChannelStreaming, Role::Consumer),
        ];

        let agreement = agree(&server_offer(), &requested, |_, _| false).expect("agreement");

        assert_eq!(
            agreement.local,
            vec![SupportedProtocol::new(Protocol::Core, Role::Server)]
        );
    }

    #[rstest]
    #[case::no_core(
        vec![SupportedProtocol::new(Protocol::ChannelStreaming, Role::Consumer)],
        ErrorCode::NoRole
    )]
    #[case::same_role(
        vec![SupportedProtocol::new(Protocol::Core, Role::Server)],
        ErrorCode::NoRole
    )]
    #[case::major_mismatch(
        vec![SupportedProtocol::new(Protocol::Core, Role::Client)
            .with_version(Version::new(2, 0, 0, 0))],
        ErrorCode::UnsupportedVersion
    )]
    fn failed_negotiation_reports_code(
        #[case] requested: Vec<SupportedProtocol>,
        #[case] code: ErrorCode,
    ) {
        let error = agree(&server_offer(), &requested, |_, _| true).expect_err("should fail");
        assert_eq!(error.code(), Some(code));
    }

    #[test]
    fn unknown_requested_protocols_are_ignored() {
        let requested = vec![
            SupportedProtocol::new(Protocol::Core, Role::Client),
            SupportedProtocol {
                protocol: 999,
                version: Version::V1_1,
                role: Role::Customer,
            },
        ];
        let agreement = agree(&server_offer(), &requested, |_, _| true).expect("agreement");
        assert_eq!(agreement.local.len(), 1);
    }

    #[rstest]
    #[case(&[], &["a"], &["a"])]
    #[case(&["a", "b"], &[], &["a", "b"])]
    #[case(&["a", "b"], &["b", "c"], &["b"])]
    fn object_types_intersect(
        #[case] requested: &[&str],
        #[case] local: &[&str],
        #[case] expected: &[&str],
    ) {
        let owned = |s: &[&str]| s.iter().map(|t| (*t).to_owned()).collect::<Vec<_>>();
        assert_eq!(
            intersect_object_types(&owned(requested), &owned(local)),
            owned(expected)
        );
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
