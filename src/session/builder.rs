//! Construction of sessions over a transport stream.

use std::sync::Arc;

use futures::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::Framed;

use super::{Session, SessionState, lock, pump};
use crate::{
    capabilities::{CapabilityProvider, StaticCapabilities},
    codec::EtpFrameCodec,
    config::EtpConfig,
    error::{CloseReason, Result},
    message::{MessageBody, MessageKind, RequestSession},
    protocol::{Protocol, Role},
    registry::{HandlerRegistry, ProtocolHandler},
};

pub(super) struct SessionParts {
    pub endpoint: Role,
    pub config: EtpConfig,
    pub application_name: String,
    pub application_version: String,
    pub registry: HandlerRegistry,
    pub capabilities: Arc<dyn CapabilityProvider>,
}

/// Configures and starts a [`Session`].
///
/// ```no_run
/// use std::sync::Arc;
///
/// use tokio::net::TcpStream;
/// use wellstream::{EtpConfig, SessionBuilder, streaming::ChannelConsumer};
///
/// # async fn run() -> wellstream::Result<()> {
/// let (consumer, mut batches) = ChannelConsumer::with_channel(&EtpConfig::default());
/// let stream = TcpStream::connect("127.0.0.1:9000").await?;
/// let session = SessionBuilder::new(EtpConfig::default())
///     .application("rig-viewer", "2.0")
///     .handler(Arc::new(consumer))
///     .connect(stream)
///     .await?;
/// while let Some(batch) = batches.recv().await {
///     println!("{} items", batch.items.len());
/// }
/// session.close("done").await;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    config: EtpConfig,
    application_name: String,
    application_version: String,
    capabilities: Option<Arc<dyn CapabilityProvider>>,
    registry: HandlerRegistry,
}

impl SessionBuilder {
    #[must_use]
    pub fn new(config: EtpConfig) -> Self {
        Self {
            config,
            application_name: env!("CARGO_PKG_NAME").to_owned(),
            application_version: env!("CARGO_PKG_VERSION").to_owned(),
            capabilities: None,
            registry: HandlerRegistry::new(),
        }
    }

    /// Application name and version announced during negotiation.
    #[must_use]
    pub fn application(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.application_name = name.into();
        self.application_version = version.into();
        self
    }

    /// Use `provider` for the local capability list.
    ///
    /// Without a provider the session offers core plus every bound handler.
    #[must_use]
    pub fn capabilities(mut self, provider: impl CapabilityProvider) -> Self {
        self.capabilities = Some(Arc::new(provider));
        self
    }

    /// Bind `handler` under its own protocol and role.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.registry.bind(handler);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EtpConfig { &self.config }

    /// Start a server-side session on an accepted transport.
    ///
    /// The session waits for the peer's `RequestSession`. Must be called from
    /// within a Tokio runtime.
    pub fn accept<S>(self, stream: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.spawn(stream, Role::Server)
    }

    /// Start a client-side session and negotiate with the server.
    ///
    /// # Errors
    ///
    /// Fails when the server rejects the request, does not answer within the
    /// configured request timeout or the transport closes. The session is
    /// closed before the error is returned.
    pub async fn connect<S>(self, stream: S) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let timeout = self.config.request_timeout;
        let session = self.spawn(stream, Role::Client);
        let request = RequestSession {
            application_name: session.inner.application_name.clone(),
            application_version: session.inner.application_version.clone(),
            requested_protocols: session.local_offer(),
            supported_objects: session.inner.capabilities.supported_object_types(),
        };
        let outcome = session
            .request(
                Protocol::Core,
                MessageBody::RequestSession(request),
                &[MessageKind::OpenSession],
                timeout,
            )
            .await
            .and_then(|response| session.complete_open(&response));
        if let Err(error) = outcome {
            session.begin_close(CloseReason::NegotiationFailed(error.to_string()));
            session.wait_closed().await;
            return Err(error);
        }
        Ok(session)
    }

    fn spawn<S>(self, stream: S, endpoint: Role) -> Session
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let capabilities = self.capabilities.unwrap_or_else(|| {
            let mut caps = StaticCapabilities::new().with_protocol(Protocol::Core, endpoint);
            for entry in self.registry.supported_protocols() {
                caps = caps.with_supported(entry);
            }
            Arc::new(caps)
        });
        let framed = Framed::new(stream, EtpFrameCodec::new(self.config.max_frame_length));
        let (sink, frames) = framed.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::from_parts(
            SessionParts {
                endpoint,
                config: self.config,
                application_name: self.application_name,
                application_version: self.application_version,
                registry: self.registry,
                capabilities,
            },
            tx,
        );
        let writer = tokio::spawn(pump::write_loop(sink, rx, session.downgrade()));
        *lock(&session.inner.writer) = Some(writer);
        session.transition(SessionState::Negotiating);
        tokio::spawn(pump::drive(session.clone(), frames));
        session
    }
}
