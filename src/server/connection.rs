//! Per-connection task: preamble, then one session until it closes.

use std::{any::Any, net::SocketAddr};

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::{net::TcpStream, select, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::ConnectionOptions;
use crate::{
    preamble::{PreambleError, TransportPreamble, read_preamble},
    rewind_stream::RewindStream,
    session::SessionBuilder,
};

/// Spawn a task serving `stream`, logging and discarding any panic.
pub(super) fn spawn_connection_task<F>(
    stream: TcpStream,
    factory: F,
    options: ConnectionOptions,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) where
    F: Fn() -> SessionBuilder + Send + Sync + 'static,
{
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!("failed to retrieve peer address: error={e}");
            None
        }
    };
    tracker.spawn(async move {
        let fut = std::panic::AssertUnwindSafe(process_stream(
            stream, peer_addr, factory, options, shutdown,
        ))
        .catch_unwind();

        if let Err(panic) = fut.await {
            let panic_msg = panic_message(panic.as_ref());
            error!("connection task panicked: panic={panic_msg}, peer_addr={peer_addr:?}");
            tracing::error!(panic = %panic_msg, ?peer_addr, "connection task panicked");
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else {
        format!("{payload:?}")
    }
}

async fn process_stream<F>(
    mut stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    factory: F,
    options: ConnectionOptions,
    shutdown: CancellationToken,
) where
    F: Fn() -> SessionBuilder + Send + Sync + 'static,
{
    let builder = factory();
    let leftover = if options.require_preamble {
        let limit = builder.config().preamble_timeout;
        match timeout(limit, accept_preamble(&mut stream, &options)).await {
            Ok(Ok(leftover)) => leftover,
            Ok(Err(e)) => {
                warn!("rejecting connection: error={e}, peer_addr={peer_addr:?}");
                return;
            }
            Err(_) => {
                warn!(
                    "rejecting connection: error={}, peer_addr={peer_addr:?}",
                    PreambleError::Timeout(limit)
                );
                return;
            }
        }
    } else {
        Vec::new()
    };

    let session = builder.accept(RewindStream::new(leftover, stream));
    info!("accepted connection from {peer_addr:?}");
    select! {
        () = shutdown.cancelled() => session.close("server shutting down").await,
        () = session.wait_closed() => {}
    }
    debug!(
        "connection from {peer_addr:?} finished: {}",
        session
            .close_reason()
            .map_or_else(|| "unknown".to_owned(), |r| r.to_string())
    );
}

async fn accept_preamble(
    stream: &mut TcpStream,
    options: &ConnectionOptions,
) -> Result<Vec<u8>, PreambleError> {
    let (preamble, leftover) = read_preamble::<_, TransportPreamble>(stream).await?;
    preamble.validate()?;
    if let Some(hook) = options.preamble.as_ref() {
        hook(&preamble).await?;
    }
    Ok(leftover)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Box::new("boom"), "boom")]
    #[case(Box::new(String::from("bang")), "bang")]
    fn string_panics_print_verbatim(#[case] payload: Box<dyn Any + Send>, #[case] expected: &str) {
        assert_eq!(panic_message(payload.as_ref()), expected);
    }

    #[test]
    fn other_payloads_fall_back_to_debug() {
        let payload: Box<dyn Any + Send> = Box::new(5_u32);
        assert!(panic_message(payload.as_ref()).contains("Any"));
    }
}
