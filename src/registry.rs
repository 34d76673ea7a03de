//! Per-session binding of protocol roles to handlers.
//!
//! A [`HandlerRegistry`] maps each `(protocol, role)` pair to exactly one
//! [`ProtocolHandler`]. The session populates it while it is being built and
//! consults it for every inbound message: a message from a peer acting in
//! role `R` is routed to the local handler bound to `R`'s counterpart.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    codec::EtpMessage,
    error::{CloseReason, EtpError},
    message::ProtocolException,
    protocol::{ErrorCode, Protocol, Role, SupportedProtocol},
    session::Session,
};

/// Behaviour a handler advertises beyond its `(protocol, role)` binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Publishes channel metadata and data batches.
    ChannelDataProducer,
    /// Receives channel metadata and data batches.
    ChannelDataConsumer,
    /// Feeds append activity into the growing-object liveness registry.
    GrowingObjectActivity,
}

/// Failure returned by [`ProtocolHandler::handle`].
///
/// The session reports it to the peer as a `ProtocolException` correlated to
/// the offending message; the connection stays open.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The message type is not accepted by the receiving role.
    #[must_use]
    pub fn invalid_message_type(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidMessageType, message)
    }

    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }
}

impl From<HandlerError> for ProtocolException {
    fn from(error: HandlerError) -> Self { ProtocolException::new(error.code, error.message) }
}

impl From<EtpError> for HandlerError {
    fn from(error: EtpError) -> Self {
        let code = match &error {
            EtpError::Protocol(exception) => exception.code().unwrap_or(ErrorCode::InvalidState),
            EtpError::UnrecognizedChannel(_) | EtpError::ChannelInUse { .. } => {
                ErrorCode::InvalidChannelId
            }
            EtpError::UnknownUri(_) => ErrorCode::InvalidArgument,
            EtpError::Registry(_) => ErrorCode::UnsupportedProtocol,
            _ => ErrorCode::InvalidState,
        };
        Self::new(code, error.to_string())
    }
}

/// Errors raised by registry lookups.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No handler is bound to the requested pair.
    #[error("no handler bound for {protocol} as {role}")]
    NotFound { protocol: Protocol, role: Role },

    /// The protocol was not agreed during negotiation.
    #[error("{0} was not negotiated for this session")]
    NotNegotiated(Protocol),
}

/// Logic for one role of one protocol.
///
/// Implementations are shared between the session's dispatch lane for their
/// protocol and whatever application code drives them, so all methods take
/// `&self`.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Protocol this handler serves.
    fn protocol(&self) -> Protocol;

    /// Local role this handler plays.
    fn role(&self) -> Role;

    /// Extra capabilities, used by [`HandlerRegistry::handlers_implementing`].
    fn capabilities(&self) -> &'static [Capability] { &[] }

    /// Called once after negotiation when this handler's protocol was agreed.
    async fn on_session_opened(&self, _session: &Session) {}

    /// Process one inbound message addressed to this handler.
    ///
    /// Messages for one protocol are delivered sequentially in wire order.
    ///
    /// # Errors
    ///
    /// A returned [`HandlerError`] is reported to the peer as a
    /// `ProtocolException`.
    async fn handle(&self, session: &Session, message: EtpMessage) -> Result<(), HandlerError>;

    /// Called during a graceful close, before the transport is shut down.
    async fn on_session_closing(&self, _session: &Session, _reason: &CloseReason) {}

    /// Called after the session reached `Closed`.
    fn on_session_closed(&self, _reason: &CloseReason) {}
}

/// Mapping from `(protocol, role)` to the handler bound to it.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(Protocol, Role), Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Bind `handler` to `(protocol, role)`.
    ///
    /// A later registration for the same pair replaces the earlier one; the
    /// replaced handler is returned.
    pub fn register(
        &mut self,
        protocol: Protocol,
        role: Role,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.insert((protocol, role), handler)
    }

    /// Bind `handler` under its own protocol and role.
    pub fn bind(&mut self, handler: Arc<dyn ProtocolHandler>) -> Option<Arc<dyn ProtocolHandler>> {
        self.register(handler.protocol(), handler.role(), handler)
    }

    /// Handler bound to `(protocol, role)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when nothing is bound to the pair.
    pub fn handler_for(
        &self,
        protocol: Protocol,
        role: Role,
    ) -> Result<Arc<dyn ProtocolHandler>, RegistryError> {
        self.handlers
            .get(&(protocol, role))
            .cloned()
            .ok_or(RegistryError::NotFound { protocol, role })
    }

    /// Handler that receives messages a peer sends on `protocol` while acting
    /// as `sender_role`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when no handler is bound to the
    /// counterpart role.
    pub fn route(
        &self,
        protocol: Protocol,
        sender_role: Role,
    ) -> Result<Arc<dyn ProtocolHandler>, RegistryError> {
        self.handler_for(protocol, sender_role.counterpart())
    }

    /// All handlers advertising `capability`.
    #[must_use]
    pub fn handlers_implementing(&self, capability: Capability) -> Vec<Arc<dyn ProtocolHandler>> {
        let mut found: Vec<_> = self
            .handlers
            .iter()
            .filter(|(_, h)| h.capabilities().contains(&capability))
            .collect();
        found.sort_by_key(|(key, _)| **key);
        found.into_iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Whether anything is bound to `(protocol, role)`.
    #[must_use]
    pub fn contains(&self, protocol: Protocol, role: Role) -> bool {
        self.handlers.contains_key(&(protocol, role))
    }

    /// Every binding as a [`SupportedProtocol`], in protocol order.
    #[must_use]
    pub fn supported_protocols(&self) -> Vec<SupportedProtocol> {
        let mut keys: Vec<_> = self.handlers.keys().copied().collect();
        keys.sort();
        keys.into_iter()
            .map(|(protocol, role)| SupportedProtocol::new(protocol, role))
            .collect()
    }

    /// Every bound handler, in protocol order.
    #[must_use]
    pub fn handlers(&self) -> Vec<Arc<dyn ProtocolHandler>> {
        let mut entries: Vec<_> = self.handlers.iter().collect();
        entries.sort_by_key(|(key, _)| **key);
        entries.into_iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize { self.handlers.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("bindings", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    struct Named {
        protocol: Protocol,
        role: Role,
        name: &'static str,
        capabilities: &'static [Capability],
    }

    #[async_trait]
    impl ProtocolHandler for Named {
        fn protocol(&self) -> Protocol { self.protocol }

        fn role(&self) -> Role { self.role }

        fn capabilities(&self) -> &'static [Capability] { self.capabilities }

        async fn handle(&self, _: &Session, _: EtpMessage) -> Result<(), HandlerError> { Ok(()) }
    }

    fn named(protocol: Protocol, role: Role, name: &'static str) -> Arc<Named> {
        Arc::new(Named {
            protocol,
            role,
            name,
            capabilities: &[],
        })
    }

    fn name_of(handler: &Arc<dyn ProtocolHandler>) -> *const () {
        Arc::as_ptr(handler).cast::<()>()
    }

    #[fixture]
    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.bind(Arc::new(Named {
            protocol: Protocol::ChannelStreaming,
            role: Role::Producer,
            name: "producer",
            capabilities: &[Capability::ChannelDataProducer],
        }));
        registry.bind(Arc::new(Named {
            protocol: Protocol::ChannelStreaming,
            role: Role::Consumer,
            name: "consumer",
            capabilities: &[
                Capability::ChannelDataConsumer,
                Capability::GrowingObjectActivity,
            ],
        }));
        registry
    }

    #[rstest]
    fn second_registration_replaces_first(mut registry: HandlerRegistry) {
        let replacement = named(Protocol::ChannelStreaming, Role::Producer, "replacement");
        let replacement_dyn: Arc<dyn ProtocolHandler> = replacement.clone();

        let previous = registry.bind(replacement_dyn.clone());

        assert!(previous.is_some());
        assert_eq!(registry.len(), 2);
        let bound = registry
            .handler_for(Protocol::ChannelStreaming, Role::Producer)
            .expect("bound");
        assert_eq!(name_of(&bound), name_of(&replacement_dyn));
        assert_eq!(replacement.name, "replacement");
    }

    #[rstest]
    fn missing_binding_is_not_found(registry: HandlerRegistry) {
        let err = registry
            .handler_for(Protocol::Store, Role::Store)
            .err()
            .expect("lookup should fail");
        assert_eq!(
            err,
            RegistryError::NotFound {
                protocol: Protocol::Store,
                role: Role::Store,
            }
        );
    }

    #[rstest]
    #[case(Role::Producer, Role::Consumer)]
    #[case(Role::Consumer, Role::Producer)]
    fn route_selects_counterpart(
        registry: HandlerRegistry,
        #[case] sender: Role,
        #[case] receiver: Role,
    ) {
        let handler = registry
            .route(Protocol::ChannelStreaming, sender)
            .expect("routed");
        assert_eq!(handler.role(), receiver);
    }

    #[rstest]
    fn capability_lookup_filters_handlers(registry: HandlerRegistry) {
        let consumers = registry.handlers_implementing(Capability::GrowingObjectActivity);
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].role(), Role::Consumer);
        assert_eq!(
            registry
                .handlers_implementing(Capability::ChannelDataProducer)
                .len(),
            1
        );
    }

    #[rstest]
    fn supported_protocols_follow_bindings(registry: HandlerRegistry) {
        let advertised = registry.supported_protocols();
        assert_eq!(
            advertised,
            vec![
                SupportedProtocol::new(Protocol::ChannelStreaming, Role::Producer),
                SupportedProtocol::new(Protocol::ChannelStreaming, Role::Consumer),
            ]
        );
    }

    #[test]
    fn handler_error_maps_to_exception() {
        let exception: ProtocolException = HandlerError::invalid_argument("bad").into();
        assert_eq!(exception.code(), Some(ErrorCode::InvalidArgument));
        assert_eq!(exception.error_message, "bad");

        let from_channel: HandlerError = EtpError::UnrecognizedChannel(9).into();
        assert_eq!(from_channel.code, ErrorCode::InvalidChannelId);
    }
}
