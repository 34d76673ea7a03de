//! Matching of inbound responses to outstanding requests.
//!
//! [`CorrelationTable`] maps the message id of every request awaiting a reply
//! to a [`PendingRequest`] holding the caller's continuation. Responses carry
//! the request's id as their correlation id. A response may span several
//! messages; parts accumulate until one arrives with the final-part flag.
//!
//! The table never expires entries on its own. The owning session sweeps it
//! with [`CorrelationTable::sweep_expired`] and drains it with
//! [`CorrelationTable::cancel_all`] when it closes.

use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, warn};

use crate::{
    codec::EtpMessage,
    error::{CloseReason, EtpError},
    message::{MessageBody, MessageKind, ProtocolException},
    protocol::ErrorCode,
};

/// Receiver of a request's outcome.
pub type Continuation = oneshot::Sender<Result<Response, EtpError>>;

/// All parts of a completed response, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    parts: Vec<EtpMessage>,
}

impl Response {
    #[must_use]
    pub fn parts(&self) -> &[EtpMessage] { &self.parts }

    #[must_use]
    pub fn into_parts(self) -> Vec<EtpMessage> { self.parts }

    /// Bodies of every part.
    pub fn bodies(&self) -> impl Iterator<Item = &MessageBody> { self.parts.iter().map(|m| &m.body) }

    /// The first (often only) part.
    #[must_use]
    pub fn first(&self) -> Option<&EtpMessage> { self.parts.first() }
}

/// A request awaiting its response.
pub struct PendingRequest {
    message_id: i64,
    expected: Vec<MessageKind>,
    created_at: Instant,
    parts: Vec<EtpMessage>,
    continuation: Continuation,
}

impl PendingRequest {
    #[must_use]
    pub fn new(message_id: i64, expected: &[MessageKind], continuation: Continuation) -> Self {
        Self {
            message_id,
            expected: expected.to_vec(),
            created_at: Instant::now(),
            parts: Vec::new(),
            continuation,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> i64 { self.message_id }

    #[must_use]
    pub fn created_at(&self) -> Instant { self.created_at }

    fn accepts(&self, kind: Option<MessageKind>) -> bool {
        kind.is_some_and(|k| self.expected.is_empty() || self.expected.contains(&k))
    }

    fn complete(self, outcome: Result<Response, EtpError>) {
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.continuation.send(outcome);
    }
}

/// Outcome of offering a message to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The pending entry finished and was removed.
    Completed,
    /// A non-final part was stored; the entry remains.
    Partial,
    /// An `Acknowledge` for a request expecting something else; the entry
    /// remains.
    Acknowledged,
    /// No pending entry has this correlation id.
    Unmatched,
}

impl Resolution {
    /// Whether the message was consumed by the table.
    #[must_use]
    pub fn is_matched(self) -> bool { !matches!(self, Resolution::Unmatched) }
}

/// Concurrent map of pending requests keyed by message id.
#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<i64, PendingRequest>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register a request awaiting a response of one of `expected` kinds.
    ///
    /// An empty `expected` accepts any kind.
    pub fn register(&self, message_id: i64, expected: &[MessageKind], continuation: Continuation) {
        let previous = self.pending.insert(
            message_id,
            PendingRequest::new(message_id, expected, continuation),
        );
        if previous.is_some() {
            warn!(message_id, "replaced pending request with duplicate message id");
        }
    }

    /// Offer an inbound message to the table.
    ///
    /// A `ProtocolException` completes the matching request with
    /// [`EtpError::Protocol`]; a message of an unexpected kind completes it
    /// with [`EtpError::UnexpectedResponse`]. Messages whose correlation id is
    /// zero or unknown are left for the caller to handle.
    pub fn resolve(&self, message: EtpMessage) -> Resolution {
        let correlation_id = message.header.correlation_id;
        if correlation_id == 0 {
            return Resolution::Unmatched;
        }
        let Entry::Occupied(mut entry) = self.pending.entry(correlation_id) else {
            debug!(correlation_id, "no pending request for response");
            return Resolution::Unmatched;
        };

        let kind = message.kind();
        if kind == Some(MessageKind::ProtocolException) {
            let exception = match message.body {
                MessageBody::ProtocolException(exception) => exception,
                _ => ProtocolException::new(ErrorCode::InvalidState, "empty protocol exception"),
            };
            entry.remove().complete(Err(EtpError::Protocol(exception)));
            return Resolution::Completed;
        }
        if !entry.get().accepts(kind) {
            if kind == Some(MessageKind::Acknowledge) {
                debug!(correlation_id, "request acknowledged by peer");
                return Resolution::Acknowledged;
            }
            warn!(correlation_id, ?kind, "unexpected response type");
            entry.remove().complete(Err(EtpError::UnexpectedResponse(kind)));
            return Resolution::Completed;
        }

        let is_final = message.header.is_final();
        entry.get_mut().parts.push(message);
        if !is_final {
            return Resolution::Partial;
        }
        let mut pending = entry.remove();
        let parts = std::mem::take(&mut pending.parts);
        pending.complete(Ok(Response { parts }));
        Resolution::Completed
    }

    /// Drop the entry for `message_id` without completing it.
    ///
    /// Returns `true` if an entry was removed.
    pub fn cancel(&self, message_id: i64) -> bool { self.pending.remove(&message_id).is_some() }

    /// Complete every entry older than `timeout` with [`EtpError::Timeout`].
    ///
    /// Returns the number of expired entries.
    pub fn sweep_expired(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.created_at) >= timeout)
            .map(|entry| *entry.key())
            .collect();
        let mut count = 0;
        for message_id in expired {
            if let Some((_, pending)) = self.pending.remove(&message_id) {
                debug!(message_id, "pending request timed out");
                pending.complete(Err(EtpError::Timeout {
                    message_id,
                    timeout,
                }));
                count += 1;
            }
        }
        count
    }

    /// Complete every entry with [`EtpError::SessionClosed`].
    ///
    /// Returns the number of cancelled entries.
    pub fn cancel_all(&self, reason: &CloseReason) -> usize {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut count = 0;
        for message_id in ids {
            if let Some((_, pending)) = self.pending.remove(&message_id) {
                pending.complete(Err(EtpError::SessionClosed(reason.clone())));
                count += 1;
            }
        }
        count
    }

    #[must_use]
    pub fn contains(&self, message_id: i64) -> bool { self.pending.contains_key(&message_id) }

    #[must_use]
    pub fn len(&self) -> usize { self.pending.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::{
        codec::{MessageFlags, MessageHeader},
        message::{ChannelMetadata, CloseSession},
        protocol::Protocol,
    };

    #[fixture]
    fn table() -> CorrelationTable { CorrelationTable::new() }

    fn metadata_part(correlation_id: i64, flags: MessageFlags) -> EtpMessage {
        let body = MessageBody::ChannelMetadata(ChannelMetadata {
            channels: Vec::new(),
        });
        let header =
            MessageHeader::for_body(Protocol::ChannelStreaming, &body, 90, correlation_id, flags)
                .expect("valid header");
        EtpMessage::new(header, body)
    }

    #[rstest]
    #[tokio::test]
    async fn final_response_completes_request(table: CorrelationTable) {
        let (tx, rx) = oneshot::channel();
        table.register(4, &[MessageKind::ChannelMetadata], tx);

        let resolution = table.resolve(metadata_part(4, MessageFlags::FINAL_PART));

        assert_eq!(resolution, Resolution::Completed);
        assert!(table.is_empty());
        let response = rx.await.expect("continuation sent").expect("ok response");
        assert_eq!(response.parts().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn multi_part_response_accumulates_until_final(table: CorrelationTable) {
        let (tx, rx) = oneshot::channel();
        table.register(5, &[MessageKind::ChannelMetadata], tx);

        assert_eq!(
            table.resolve(metadata_part(5, MessageFlags::NONE)),
            Resolution::Partial
        );
        assert_eq!(
            table.resolve(metadata_part(5, MessageFlags::NONE)),
            Resolution::Partial
        );
        assert!(table.contains(5));
        assert_eq!(
            table.resolve(metadata_part(5, MessageFlags::FINAL_PART)),
            Resolution::Completed
        );

        let response = rx.await.expect("continuation sent").expect("ok response");
        assert_eq!(response.parts().len(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn protocol_exception_fails_request(table: CorrelationTable) {
        let (tx, rx) = oneshot::channel();
        table.register(6, &[MessageKind::ChannelMetadata], tx);
        let body = MessageBody::ProtocolException(ProtocolException::new(
            ErrorCode::InvalidArgument,
            "bad uri",
        ));
        let header = MessageHeader::for_body(
            Protocol::ChannelStreaming,
            &body,
            1,
            6,
            MessageFlags::FINAL_PART,
        )
        .expect("valid header");

        assert_eq!(
            table.resolve(EtpMessage::new(header, body)),
            Resolution::Completed
        );
        let outcome = rx.await.expect("continuation sent");
        assert!(matches!(outcome, Err(EtpError::Protocol(e)) if e.code() == Some(ErrorCode::InvalidArgument)));
    }

    #[rstest]
    #[tokio::test]
    async fn unexpected_kind_fails_request(table: CorrelationTable) {
        let (tx, rx) = oneshot::channel();
        table.register(8, &[MessageKind::OpenSession], tx);
        let body = MessageBody::CloseSession(CloseSession {
            reason: "bye".into(),
        });
        let header = MessageHeader::for_body(Protocol::Core, &body, 1, 8, MessageFlags::FINAL_PART)
            .expect("valid header");

        assert_eq!(
            table.resolve(EtpMessage::new(header, body)),
            Resolution::Completed
        );
        assert!(matches!(
            rx.await.expect("continuation sent"),
            Err(EtpError::UnexpectedResponse(Some(MessageKind::CloseSession)))
        ));
    }

    #[rstest]
    fn uncorrelated_and_unknown_messages_are_unmatched(table: CorrelationTable) {
        assert_eq!(
            table.resolve(metadata_part(0, MessageFlags::FINAL_PART)),
            Resolution::Unmatched
        );
        assert_eq!(
            table.resolve(metadata_part(77, MessageFlags::FINAL_PART)),
            Resolution::Unmatched
        );
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn sweep_expires_only_old_entries(table: CorrelationTable) {
        let (old_tx, old_rx) = oneshot::channel();
        table.register(1, &[], old_tx);
        tokio::time::advance(Duration::from_secs(10)).await;
        let (new_tx, _new_rx) = oneshot::channel();
        table.register(2, &[], new_tx);

        assert_eq!(table.sweep_expired(Duration::from_secs(5)), 1);
        assert!(table.contains(2));
        assert!(matches!(
            old_rx.await.expect("continuation sent"),
            Err(EtpError::Timeout { message_id: 1, .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn cancel_all_resolves_with_session_closed(table: CorrelationTable) {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        table.register(1, &[], tx1);
        table.register(2, &[], tx2);

        assert_eq!(table.cancel_all(&CloseReason::Disconnected), 2);
        assert!(table.is_empty());
        for rx in [rx1, rx2] {
            assert!(matches!(
                rx.await.expect("continuation sent"),
                Err(EtpError::SessionClosed(CloseReason::Disconnected))
            ));
        }
    }
}
