//! ETP sessions.
//!
//! A [`Session`] owns one transport connection. It negotiates capabilities,
//! allocates outbound message ids, correlates responses with requests and
//! routes every other inbound message to the [`ProtocolHandler`] bound for
//! the peer's counterpart role.
//!
//! Each session runs two tasks: a driver that reads frames, sweeps the
//! correlation table and watches for idleness, and a writer that drains the
//! outbound queue into the transport. Handlers run on per-protocol dispatch
//! lanes so a handler awaiting [`Session::request`] never stalls the driver.
//! `Session` is a cheap handle; clones share the same connection.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        OnceLock,
        PoisonError,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
        Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

mod builder;
mod negotiation;
mod pump;
mod state;

pub use builder::SessionBuilder;
pub use state::SessionState;

use crate::{
    capabilities::CapabilityProvider,
    codec::{EtpMessage, MessageFlags, MessageHeader},
    config::EtpConfig,
    correlation::{CorrelationTable, Response},
    error::{CloseReason, EtpError, Result},
    message::{MessageBody, MessageKind, ProtocolException},
    metrics,
    protocol::{Protocol, Role, SupportedProtocol},
    registry::{Capability, HandlerRegistry, ProtocolHandler, RegistryError},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// What the peer agreed to during negotiation.
#[derive(Clone, Debug, Default)]
struct PeerInfo {
    application_name: String,
    application_version: String,
    /// Negotiated protocols carrying the peer's role for each.
    protocols: Vec<SupportedProtocol>,
    object_types: Vec<String>,
}

struct Outbound {
    next_id: i64,
    tx: Option<mpsc::UnboundedSender<EtpMessage>>,
}

struct SessionInner {
    endpoint: Role,
    config: EtpConfig,
    application_name: String,
    application_version: String,
    session_id: OnceLock<String>,
    state: watch::Sender<SessionState>,
    outbound: Mutex<Outbound>,
    correlation: CorrelationTable,
    registry: RwLock<HandlerRegistry>,
    capabilities: Arc<dyn CapabilityProvider>,
    peer: OnceLock<PeerInfo>,
    activated: AtomicBool,
    shutdown: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    protocol_errors: AtomicU32,
    lanes: Mutex<HashMap<Protocol, mpsc::UnboundedSender<pump::Dispatch>>>,
    tasks: TaskTracker,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning reference to a [`Session`].
#[derive(Clone, Debug, Default)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    /// The session, if it has not been dropped.
    #[must_use]
    pub fn upgrade(&self) -> Option<Session> { self.0.upgrade().map(|inner| Session { inner }) }
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("session_id", &self.session_id.get())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.inner.fmt(f) }
}

impl Session {
    fn from_parts(parts: builder::SessionParts, tx: mpsc::UnboundedSender<EtpMessage>) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            inner: Arc::new(SessionInner {
                endpoint: parts.endpoint,
                config: parts.config,
                application_name: parts.application_name,
                application_version: parts.application_version,
                session_id: OnceLock::new(),
                state,
                outbound: Mutex::new(Outbound {
                    next_id: 1,
                    tx: Some(tx),
                }),
                correlation: CorrelationTable::new(),
                registry: RwLock::new(parts.registry),
                capabilities: parts.capabilities,
                peer: OnceLock::new(),
                activated: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                close_reason: OnceLock::new(),
                protocol_errors: AtomicU32::new(0),
                lanes: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                writer: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSession { WeakSession(Arc::downgrade(&self.inner)) }

    /// Identifier assigned by the server during negotiation.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> { self.inner.session_id.get().map(String::as_str) }

    /// `Client` for connected sessions, `Server` for accepted ones.
    #[must_use]
    pub fn endpoint(&self) -> Role { self.inner.endpoint }

    #[must_use]
    pub fn config(&self) -> &EtpConfig { &self.inner.config }

    #[must_use]
    pub fn state(&self) -> SessionState { *self.inner.state.borrow() }

    /// Receiver observing every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> { self.inner.state.subscribe() }

    /// Why the session is closing, once it is.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> { self.inner.close_reason.get().cloned() }

    /// Application name the peer announced.
    #[must_use]
    pub fn peer_application(&self) -> Option<(&str, &str)> {
        self.inner.peer.get().map(|peer| {
            (
                peer.application_name.as_str(),
                peer.application_version.as_str(),
            )
        })
    }

    /// Negotiated protocols with the peer's role for each.
    #[must_use]
    pub fn peer_protocols(&self) -> Vec<SupportedProtocol> {
        self.inner
            .peer
            .get()
            .map(|peer| peer.protocols.clone())
            .unwrap_or_default()
    }

    /// Negotiated protocols with the local role for each.
    #[must_use]
    pub fn negotiated_protocols(&self) -> Vec<SupportedProtocol> {
        self.peer_protocols()
            .into_iter()
            .map(|mut entry| {
                entry.role = entry.role.counterpart();
                entry
            })
            .collect()
    }

    /// Whether the peer negotiated `protocol` in `role`.
    #[must_use]
    pub fn peer_declared(&self, protocol: Protocol, role: Role) -> bool {
        self.peer_role(protocol) == Some(role)
    }

    /// Object content types agreed during negotiation.
    #[must_use]
    pub fn supported_object_types(&self) -> Vec<String> {
        self.inner
            .peer
            .get()
            .map(|peer| peer.object_types.clone())
            .unwrap_or_default()
    }

    /// Requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize { self.inner.correlation.len() }

    fn peer_role(&self, protocol: Protocol) -> Option<Role> {
        self.inner.peer.get().and_then(|peer| {
            peer.protocols
                .iter()
                .find(|entry| entry.kind() == Some(protocol))
                .map(|entry| entry.role)
        })
    }

    /// Bind `handler` under its own protocol and role, replacing any earlier
    /// binding for the same pair.
    pub fn register_handler(
        &self,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        write(&self.inner.registry).bind(handler)
    }

    /// Handler bound to `(protocol, role)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if nothing is bound.
    pub fn handler_for(
        &self,
        protocol: Protocol,
        role: Role,
    ) -> std::result::Result<Arc<dyn ProtocolHandler>, RegistryError> {
        read(&self.inner.registry).handler_for(protocol, role)
    }

    #[must_use]
    pub fn handlers_implementing(&self, capability: Capability) -> Vec<Arc<dyn ProtocolHandler>> {
        read(&self.inner.registry).handlers_implementing(capability)
    }

    /// Handler receiving what the peer sends on `protocol`.
    fn route(
        &self,
        protocol: Protocol,
    ) -> std::result::Result<Arc<dyn ProtocolHandler>, RegistryError> {
        let peer_role = self
            .peer_role(protocol)
            .ok_or(RegistryError::NotNegotiated(protocol))?;
        read(&self.inner.registry).route(protocol, peer_role)
    }

    /// Local protocol offer: the capability list restricted to protocols with
    /// a bound handler, with core always present.
    fn local_offer(&self) -> Vec<SupportedProtocol> {
        let registry = read(&self.inner.registry);
        let mut offer: Vec<SupportedProtocol> = self
            .inner
            .capabilities
            .supported_protocols()
            .into_iter()
            .filter(|entry| match entry.kind() {
                Some(Protocol::Core) => true,
                Some(protocol) => registry.contains(protocol, entry.role),
                None => false,
            })
            .collect();
        if !offer.iter().any(|e| e.kind() == Some(Protocol::Core)) {
            offer.insert(0, SupportedProtocol::new(Protocol::Core, self.inner.endpoint));
        }
        offer
    }

    fn closed_error(&self) -> EtpError {
        EtpError::SessionClosed(self.close_reason().unwrap_or(CloseReason::Disconnected))
    }

    fn ensure_can_send(&self, protocol: Protocol) -> Result<()> {
        match self.state() {
            SessionState::Closed => Err(self.closed_error()),
            SessionState::Open | SessionState::Closing => Ok(()),
            _ if protocol == Protocol::Core => Ok(()),
            state => Err(EtpError::InvalidState(state)),
        }
    }

    /// Allocate an id, build the header and enqueue under one lock so wire
    /// order matches id order.
    fn enqueue(
        &self,
        protocol: Protocol,
        body: MessageBody,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> Result<i64> {
        let mut outbound = lock(&self.inner.outbound);
        let message_id = outbound.next_id;
        let header = MessageHeader::for_body(protocol, &body, message_id, correlation_id, flags)?;
        self.push(&outbound, EtpMessage::new(header, body))?;
        outbound.next_id += 1;
        Ok(message_id)
    }

    fn enqueue_no_data(
        &self,
        protocol: Protocol,
        kind: MessageKind,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> Result<i64> {
        let mut outbound = lock(&self.inner.outbound);
        let message_id = outbound.next_id;
        let header = MessageHeader::no_data(protocol, kind, message_id, correlation_id, flags);
        self.push(&outbound, EtpMessage::new(header, MessageBody::Empty))?;
        outbound.next_id += 1;
        Ok(message_id)
    }

    fn push(&self, outbound: &Outbound, message: EtpMessage) -> Result<()> {
        let tx = outbound.tx.as_ref().ok_or_else(|| self.closed_error())?;
        tx.send(message).map_err(|_| self.closed_error())
    }

    /// Send a fire-and-forget message and return its id.
    ///
    /// Pass the id of the message being answered as `correlation_id`, or `0`.
    /// Only core messages may be sent before the session is open.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::InvalidState`] before negotiation completes,
    /// [`EtpError::SessionClosed`] once the transport is gone and
    /// [`EtpError::Malformed`] if `body` does not belong to `protocol`.
    pub fn send(&self, protocol: Protocol, body: MessageBody, correlation_id: i64) -> Result<i64> {
        self.send_with_flags(protocol, body, correlation_id, MessageFlags::NONE)
    }

    /// As [`Session::send`] with explicit header flags.
    ///
    /// # Errors
    ///
    /// As [`Session::send`].
    pub fn send_with_flags(
        &self,
        protocol: Protocol,
        body: MessageBody,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> Result<i64> {
        self.ensure_can_send(protocol)?;
        self.enqueue(protocol, body, correlation_id, flags)
    }

    /// Send a header-only message of `kind`.
    ///
    /// # Errors
    ///
    /// As [`Session::send`].
    pub fn send_no_data(
        &self,
        protocol: Protocol,
        kind: MessageKind,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> Result<i64> {
        self.ensure_can_send(protocol)?;
        self.enqueue_no_data(protocol, kind, correlation_id, flags)
    }

    /// Send `bodies` as consecutive parts of one logical message.
    ///
    /// The last part carries the final-part flag. Parts are queued together
    /// so no other message interleaves with them.
    ///
    /// # Errors
    ///
    /// As [`Session::send`]. Nothing is queued when any part is invalid.
    pub fn send_multipart(
        &self,
        protocol: Protocol,
        bodies: Vec<MessageBody>,
        correlation_id: i64,
    ) -> Result<Vec<i64>> {
        self.ensure_can_send(protocol)?;
        let mut outbound = lock(&self.inner.outbound);
        let last = bodies.len().saturating_sub(1);
        let mut messages = Vec::with_capacity(bodies.len());
        for (index, body) in bodies.into_iter().enumerate() {
            let flags = if index == last {
                MessageFlags::FINAL_PART
            } else {
                MessageFlags::NONE
            };
            let message_id = outbound.next_id + i64::try_from(index).unwrap_or(i64::MAX);
            let header =
                MessageHeader::for_body(protocol, &body, message_id, correlation_id, flags)?;
            messages.push(EtpMessage::new(header, body));
        }
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(message.header.message_id);
            self.push(&outbound, message)?;
            outbound.next_id += 1;
        }
        Ok(ids)
    }

    /// Answer `request` with a single final part.
    ///
    /// # Errors
    ///
    /// As [`Session::send`].
    pub fn respond(&self, request: &MessageHeader, body: MessageBody) -> Result<i64> {
        let protocol = request.protocol_kind().unwrap_or(Protocol::Core);
        self.send_with_flags(
            protocol,
            body,
            request.message_id,
            MessageFlags::FINAL_PART,
        )
    }

    /// Report `exception` to the peer in answer to `request`.
    fn send_exception(&self, request: &MessageHeader, exception: ProtocolException) {
        let protocol = request.protocol_kind().unwrap_or(Protocol::Core);
        let body = MessageBody::ProtocolException(exception);
        if let Err(error) = self.enqueue(
            protocol,
            body,
            request.message_id,
            MessageFlags::FINAL_PART,
        ) {
            debug!("failed to send protocol exception: {error}");
        }
    }

    /// Reserve the next outbound id for a message queued elsewhere.
    pub(crate) fn reserve_message_id(&self) -> Result<i64> {
        let mut outbound = lock(&self.inner.outbound);
        if outbound.tx.is_none() {
            return Err(self.closed_error());
        }
        let message_id = outbound.next_id;
        outbound.next_id += 1;
        Ok(message_id)
    }

    /// Send a message under an id obtained from
    /// [`Session::reserve_message_id`].
    pub(crate) fn send_reserved(
        &self,
        message_id: i64,
        protocol: Protocol,
        body: MessageBody,
        flags: MessageFlags,
    ) -> Result<()> {
        let header = MessageHeader::for_body(protocol, &body, message_id, 0, flags)?;
        let outbound = lock(&self.inner.outbound);
        self.push(&outbound, EtpMessage::new(header, body))
    }

    /// Send `body` and wait for the correlated response.
    ///
    /// The response must be one of `expected` (any kind when empty); a
    /// multi-part response is returned once its final part arrives. The
    /// request also expires when the session's periodic sweep finds it older
    /// than the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::Timeout`] when no response arrives in time,
    /// [`EtpError::Protocol`] when the peer answers with a
    /// `ProtocolException`, [`EtpError::UnexpectedResponse`] for a response
    /// of another kind and [`EtpError::SessionClosed`] if the session closes
    /// first.
    pub async fn request(
        &self,
        protocol: Protocol,
        body: MessageBody,
        expected: &[MessageKind],
        timeout: Duration,
    ) -> Result<Response> {
        self.ensure_can_send(protocol)?;
        let (tx, rx) = oneshot::channel();
        let message_id = {
            let mut outbound = lock(&self.inner.outbound);
            let message_id = outbound.next_id;
            let header =
                MessageHeader::for_body(protocol, &body, message_id, 0, MessageFlags::NONE)?;
            self.inner.correlation.register(message_id, expected, tx);
            if let Err(error) = self.push(&outbound, EtpMessage::new(header, body)) {
                self.inner.correlation.cancel(message_id);
                return Err(error);
            }
            outbound.next_id += 1;
            message_id
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.inner.correlation.cancel(message_id);
                debug!("request {message_id} timed out after {timeout:?}");
                Err(EtpError::Timeout {
                    message_id,
                    timeout,
                })
            }
        }
    }

    /// Close the session and wait until it is fully closed.
    ///
    /// Queued outbound data is flushed and the peer is sent `CloseSession`.
    pub async fn close(&self, reason: impl Into<String>) {
        self.begin_close(CloseReason::Requested(reason.into()));
        self.wait_closed().await;
    }

    /// Wait until the session reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut previous = None;
        let changed = self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            info!(
                "session {} ({}): {previous} -> {next}",
                self.session_id().unwrap_or("-"),
                self.inner.endpoint
            );
        }
        changed
    }

    /// Start closing for `reason`. The first reason wins; later calls are
    /// ignored. Returns `true` if this call started the close.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        if self.inner.close_reason.set(reason.clone()).is_err() {
            return false;
        }
        debug!("session closing: {reason}");
        self.transition(SessionState::Closing);
        self.inner.shutdown.cancel();
        true
    }

    fn record_protocol_error(&self) {
        metrics::inc_protocol_errors();
        let count = self.inner.protocol_errors.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.inner.config.max_protocol_errors {
            warn!("closing session after {count} consecutive protocol errors");
            self.begin_close(CloseReason::ProtocolErrors(count));
        }
    }

    fn reset_protocol_errors(&self) { self.inner.protocol_errors.store(0, Ordering::Release); }

    /// Notify handlers of negotiated protocols that the session is open.
    ///
    /// Runs at most once per session.
    fn activate(&self) {
        if self.inner.activated.swap(true, Ordering::AcqRel) {
            return;
        }
        metrics::inc_sessions();
        let handlers: Vec<_> = {
            let registry = read(&self.inner.registry);
            self.negotiated_protocols()
                .into_iter()
                .filter_map(|entry| {
                    let protocol = entry.kind()?;
                    registry.handler_for(protocol, entry.role).ok()
                })
                .collect()
        };
        for handler in handlers {
            let session = self.clone();
            self.inner.tasks.spawn(async move {
                handler.on_session_opened(&session).await;
            });
        }
    }
}

#[cfg(test)]
mod tests;
