//! Session tasks: the inbound driver, the outbound writer and the
//! per-protocol dispatch lanes.

use std::sync::{Arc, atomic::Ordering};

use futures::{
    SinkExt,
    StreamExt,
    stream::{SplitSink, SplitStream},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tokio_util::codec::Framed;

use super::{Session, SessionState, WeakSession, lock, read};
use crate::{
    codec::{EtpFrameCodec, EtpMessage, MessageFlags, MessageHeader},
    error::CloseReason,
    message::{CloseSession, MessageBody, MessageKind, ProtocolException},
    metrics::{self, Direction},
    protocol::{ErrorCode, Protocol, Role},
    registry::ProtocolHandler,
};

/// A message queued for a protocol's dispatch lane.
pub(super) struct Dispatch {
    handler: Arc<dyn ProtocolHandler>,
    message: EtpMessage,
}

type FrameSink<S> = SplitSink<Framed<S, EtpFrameCodec>, EtpMessage>;
type FrameStream<S> = SplitStream<Framed<S, EtpFrameCodec>>;

/// Read frames until the session starts closing, then run the close
/// sequence.
pub(super) async fn drive<S>(session: Session, mut frames: FrameStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shutdown = session.inner.shutdown.clone();
    let idle_timeout = session.inner.config.idle_timeout;
    let request_timeout = session.inner.config.request_timeout;
    let mut sweep = interval(
        session
            .inner
            .config
            .liveness_sweep_interval
            .min(request_timeout),
    );
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.reset();
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        select! {
            biased;

            () = shutdown.cancelled() => break,
            _ = sweep.tick() => {
                let expired = session.inner.correlation.sweep_expired(request_timeout);
                if expired > 0 {
                    debug!("swept {expired} expired requests");
                }
            }
            () = &mut idle => {
                session.begin_close(CloseReason::IdleTimeout);
            }
            frame = frames.next() => match frame {
                Some(Ok(message)) => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    session.on_message(message);
                }
                Some(Err(error)) if error.is_malformed() => {
                    warn!("closing session on malformed message: {error}");
                    session.begin_close(CloseReason::Malformed(error.to_string()));
                }
                Some(Err(error)) => {
                    warn!("transport read failed: {error}");
                    session.begin_close(CloseReason::Transport(error.to_string()));
                }
                None => {
                    session.begin_close(CloseReason::Disconnected);
                }
            },
        }
    }

    session.finish_close().await;
}

/// Drain the outbound queue into the transport.
///
/// Ends when every sender is dropped, closing the transport after the last
/// queued message.
pub(super) async fn write_loop<S>(
    mut sink: FrameSink<S>,
    mut rx: mpsc::UnboundedReceiver<EtpMessage>,
    session: WeakSession,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(message) = rx.recv().await {
        let mut result = sink.feed(message).await;
        if result.is_ok() && rx.is_empty() {
            result = sink.flush().await;
        }
        if let Err(error) = result {
            warn!("transport write failed: {error}");
            if let Some(session) = session.upgrade() {
                session.begin_close(CloseReason::Transport(error.to_string()));
            }
            return;
        }
        metrics::inc_messages(Direction::Outbound);
    }
    if let Err(error) = sink.close().await {
        debug!("failed to close transport: {error}");
    }
}

impl Session {
    /// Entry point for every decoded inbound message.
    pub(super) fn on_message(&self, message: EtpMessage) {
        metrics::inc_messages(Direction::Inbound);
        let header = message.header;
        if header.flags.contains(MessageFlags::ACKNOWLEDGE) {
            let protocol = header.protocol_kind().unwrap_or(Protocol::Core);
            if let Err(error) = self.enqueue_no_data(
                protocol,
                MessageKind::Acknowledge,
                header.message_id,
                MessageFlags::FINAL_PART,
            ) {
                debug!("failed to acknowledge message {}: {error}", header.message_id);
            }
        }

        if header.correlation_id != 0 {
            self.on_response(message);
            return;
        }

        let Some(protocol) = header.protocol_kind() else {
            warn!("message {} uses unsupported protocol {}", header.message_id, header.protocol);
            self.reject(
                &header,
                ProtocolException::new(
                    ErrorCode::UnsupportedProtocol,
                    format!("protocol {} is not supported", header.protocol),
                ),
            );
            return;
        };

        match message.kind() {
            Some(MessageKind::Acknowledge) => {
                debug!("ignoring uncorrelated acknowledge {}", header.message_id);
                return;
            }
            Some(MessageKind::ProtocolException) => {
                if let MessageBody::ProtocolException(exception) = &message.body {
                    warn!("peer reported {exception} on {protocol}");
                }
                return;
            }
            _ => {}
        }

        if matches!(message.body, MessageBody::Unsupported(_)) {
            self.reject_uncatalogued(protocol, &header);
            return;
        }

        if protocol == Protocol::Core {
            self.on_core(&header, message.body);
            return;
        }

        let state = self.state();
        if state != SessionState::Open {
            self.reject(
                &header,
                ProtocolException::new(
                    ErrorCode::InvalidState,
                    format!("session is {state}"),
                ),
            );
            return;
        }

        match self.route(protocol) {
            Ok(handler) => self.dispatch(protocol, handler, message),
            Err(error) => {
                warn!("no handler for message {} on {protocol}: {error}", header.message_id);
                self.reject(
                    &header,
                    ProtocolException::new(ErrorCode::UnsupportedProtocol, error.to_string()),
                );
            }
        }
    }

    /// Reject a message whose `(protocol, message_type)` pair has no body
    /// schema. Bound protocols get `EINVALID_MESSAGETYPE`; anything else is
    /// an unsupported protocol.
    fn reject_uncatalogued(&self, protocol: Protocol, header: &MessageHeader) {
        let exception = match (protocol, self.route(protocol)) {
            (Protocol::Core, _) | (_, Ok(_)) => ProtocolException::new(
                ErrorCode::InvalidMessageType,
                format!("message type {} is not defined on {protocol}", header.message_type),
            ),
            (_, Err(error)) => {
                warn!("message {} uses unsupported protocol {protocol}: {error}", header.message_id);
                ProtocolException::new(ErrorCode::UnsupportedProtocol, error.to_string())
            }
        };
        self.reject(header, exception);
    }

    fn on_response(&self, message: EtpMessage) {
        let correlation_id = message.header.correlation_id;
        let exception = match &message.body {
            MessageBody::ProtocolException(exception) => Some(exception.to_string()),
            _ => None,
        };
        if let MessageBody::OpenSession(open) = &message.body
            && self.inner.endpoint == Role::Client
            && self.state() == SessionState::Negotiating
            && self.inner.correlation.contains(correlation_id)
            && let Err(error) = self.accept_open(open.clone())
        {
            debug!("OpenSession {correlation_id} not accepted: {error}");
        }
        let kind = message.kind();
        if self.inner.correlation.resolve(message).is_matched() {
            return;
        }
        match exception {
            Some(exception) => {
                warn!("peer reported {exception} for message {correlation_id}");
            }
            None => debug!("dropping {kind:?} correlated to unknown message {correlation_id}"),
        }
    }

    /// Report a semantic failure to the peer and count it against the
    /// protocol error threshold.
    pub(super) fn reject(&self, header: &MessageHeader, exception: ProtocolException) {
        self.send_exception(header, exception);
        self.record_protocol_error();
    }

    fn dispatch(&self, protocol: Protocol, handler: Arc<dyn ProtocolHandler>, message: EtpMessage) {
        let mut lanes = lock(&self.inner.lanes);
        let lane = lanes
            .entry(protocol)
            .or_insert_with(|| self.spawn_lane(protocol));
        if lane.send(Dispatch { handler, message }).is_err() {
            debug!("dispatch lane for {protocol} is closed");
        }
    }

    fn spawn_lane(&self, protocol: Protocol) -> mpsc::UnboundedSender<Dispatch> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();
        let session = self.downgrade();
        self.inner.tasks.spawn(async move {
            while let Some(Dispatch { handler, message }) = rx.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.run_handler(handler.as_ref(), message).await;
            }
            debug!("dispatch lane for {protocol} stopped");
        });
        tx
    }

    async fn run_handler(&self, handler: &dyn ProtocolHandler, message: EtpMessage) {
        let header = message.header;
        match handler.handle(self, message).await {
            Ok(()) => self.reset_protocol_errors(),
            Err(error) => {
                warn!(
                    "{} {} handler rejected message {}: {error}",
                    handler.protocol(),
                    handler.role(),
                    header.message_id
                );
                self.reject(&header, error.into());
            }
        }
    }

    /// Tear the session down after the driver stopped.
    ///
    /// Graceful closes let handlers flush, announce the close when the local
    /// side initiated it, and drain the writer; abrupt closes discard queued
    /// output. Pending requests resolve with `SessionClosed` and every handler
    /// is told the session ended.
    pub(super) async fn finish_close(&self) {
        let reason = self
            .inner
            .close_reason
            .get_or_init(|| CloseReason::Disconnected)
            .clone();
        self.transition(SessionState::Closing);
        let handlers = read(&self.inner.registry).handlers();

        if reason.is_graceful() {
            for handler in &handlers {
                handler.on_session_closing(self, &reason).await;
            }
            if reason.announces_close() {
                let body = MessageBody::CloseSession(CloseSession {
                    reason: reason.wire_reason(),
                });
                if let Err(error) =
                    self.enqueue(Protocol::Core, body, 0, MessageFlags::FINAL_PART)
                {
                    debug!("failed to send CloseSession: {error}");
                }
            }
        }

        lock(&self.inner.outbound).tx = None;
        lock(&self.inner.lanes).clear();
        let writer = lock(&self.inner.writer).take();
        if let Some(mut writer) = writer {
            if reason.is_graceful() {
                let drained =
                    tokio::time::timeout(self.inner.config.request_timeout, &mut writer).await;
                if drained.is_err() {
                    warn!("outbound queue did not drain; discarding");
                    writer.abort();
                }
            } else {
                writer.abort();
                let _ = writer.await;
            }
        }
        self.inner.tasks.close();

        let cancelled = self.inner.correlation.cancel_all(&reason);
        if cancelled > 0 {
            debug!("cancelled {cancelled} pending requests");
        }
        self.transition(SessionState::Closed);
        for handler in &handlers {
            handler.on_session_closed(&reason);
        }
        if self.inner.activated.load(Ordering::Acquire) {
            metrics::dec_sessions();
        }
        info!(
            "session {} closed: {reason}",
            self.session_id().unwrap_or("-")
        );
    }
}
