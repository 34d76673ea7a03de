//! TCP server running one ETP session per connection.
//!
//! [`EtpServer`] accepts connections on worker tasks, reads the transport
//! preamble from each one, lets an optional hook vet the authorization token
//! and then starts a server-side [`Session`](crate::session::Session) built
//! by the factory. Shutdown stops accepting, closes every live session
//! gracefully and waits for the connection tasks to finish.

use std::{
    future::Future,
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    num::NonZeroUsize,
    sync::Arc,
};

use futures::future::BoxFuture;
use log::{info, warn};
use tokio::{net::TcpListener, select, signal, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

mod backoff;
mod connection;

pub use backoff::BackoffConfig;

use crate::{
    preamble::{PreambleError, TransportPreamble},
    session::SessionBuilder,
};

/// Decides whether a connection may proceed after its preamble was read.
pub trait PreambleHook:
    for<'a> Fn(&'a TransportPreamble) -> BoxFuture<'a, Result<(), PreambleError>>
    + Send
    + Sync
    + 'static
{
}

impl<F> PreambleHook for F where
    F: for<'a> Fn(&'a TransportPreamble) -> BoxFuture<'a, Result<(), PreambleError>>
        + Send
        + Sync
        + 'static
{
}

/// Errors raised by [`EtpServer`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),
    /// [`EtpServer::run`] was called before a listener was bound.
    #[error("server is not bound to an address")]
    NotBound,
}

#[derive(Clone)]
pub(crate) struct ConnectionOptions {
    pub preamble: Option<Arc<dyn PreambleHook>>,
    pub require_preamble: bool,
}

/// Accepts ETP connections.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use wellstream::{EtpConfig, SessionBuilder, server::EtpServer, streaming::ChannelConsumer};
///
/// # async fn run() -> Result<(), wellstream::server::ServerError> {
/// let config = EtpConfig::default();
/// let server = EtpServer::new(move || {
///     let (consumer, _batches) = ChannelConsumer::with_channel(&config);
///     SessionBuilder::new(config.clone()).handler(Arc::new(consumer))
/// })
/// .bind(([127, 0, 0, 1], 9000).into())?;
/// server.run().await
/// # }
/// ```
pub struct EtpServer<F>
where
    F: Fn() -> SessionBuilder + Send + Sync + Clone + 'static,
{
    factory: F,
    listener: Option<Arc<TcpListener>>,
    workers: usize,
    backoff: BackoffConfig,
    options: ConnectionOptions,
}

impl<F> EtpServer<F>
where
    F: Fn() -> SessionBuilder + Send + Sync + Clone + 'static,
{
    /// Server building each session with `factory`.
    pub fn new(factory: F) -> Self {
        let workers = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            factory,
            listener: None,
            workers,
            backoff: BackoffConfig::default(),
            options: ConnectionOptions {
                preamble: None,
                require_preamble: true,
            },
        }
    }

    /// Number of accept loops.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    #[must_use]
    pub fn worker_count(&self) -> usize { self.workers }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff.normalized();
        self
    }

    /// Run `hook` on every decoded preamble. An error closes the connection.
    #[must_use]
    pub fn on_preamble<H>(mut self, hook: H) -> Self
    where
        H: PreambleHook,
    {
        self.options.preamble = Some(Arc::new(hook));
        self
    }

    /// Start framing immediately, without reading a preamble.
    #[must_use]
    pub fn without_preamble(mut self) -> Self {
        self.options.require_preamble = false;
        self
    }

    /// Listen on `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub fn bind(self, addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_listener(listener)
    }

    /// Listen on an already bound socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the socket cannot be registered with
    /// the runtime.
    pub fn bind_listener(mut self, listener: StdTcpListener) -> Result<Self, ServerError> {
        listener.set_nonblocking(true).map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(listener).map_err(ServerError::Bind)?;
        self.listener = Some(Arc::new(listener));
        Ok(self)
    }

    /// Address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Run until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotBound`] without a listener.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run until `shutdown` resolves, then close every session and wait for
    /// the connection tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotBound`] without a listener.
    pub async fn run_with_shutdown<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let listener = self.listener.ok_or(ServerError::NotBound)?;
        if let Ok(addr) = listener.local_addr() {
            info!("listening on {addr} with {} workers", self.workers);
        }
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        for _ in 0..self.workers {
            tracker.spawn(accept_loop(
                listener.clone(),
                self.factory.clone(),
                self.options.clone(),
                self.backoff,
                token.clone(),
                tracker.clone(),
            ));
        }

        shutdown.await;
        info!("shutting down server");
        token.cancel();
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

async fn accept_loop<F>(
    listener: Arc<TcpListener>,
    factory: F,
    options: ConnectionOptions,
    backoff: BackoffConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) where
    F: Fn() -> SessionBuilder + Send + Sync + Clone + 'static,
{
    let mut delay = backoff.initial_delay;
    loop {
        select! {
            biased;

            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connection::spawn_connection_task(
                        stream,
                        factory.clone(),
                        options.clone(),
                        shutdown.clone(),
                        &tracker,
                    );
                    delay = backoff.initial_delay;
                }
                Err(error) => {
                    let local_addr = listener.local_addr().ok();
                    warn!("accept error: error={error:?}, local_addr={local_addr:?}");
                    sleep(delay).await;
                    delay = (delay * 2).min(backoff.max_delay);
                }
            },
        }
    }
}
