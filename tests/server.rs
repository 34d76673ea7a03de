//! Tests for the TCP server: preamble handling, session start-up and
//! shutdown.

use std::{net::SocketAddr, time::Duration};

use futures::future::BoxFuture;
use rstest::rstest;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use wellstream::{
    CloseReason,
    EtpConfig,
    SessionBuilder,
    SessionState,
    preamble::{PreambleError, TransportPreamble, write_preamble},
    protocol::Protocol,
    server::{EtpServer, ServerError},
};
use wellstream_testing::{TestResult, config, unused_listener};

const TOKEN: &str = "bearer rig-7";

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    async fn stop(self) -> TestResult {
        let _ = self.shutdown.send(());
        timeout(Duration::from_secs(5), self.task).await???;
        Ok(())
    }
}

fn start<F>(server: EtpServer<F>) -> TestResult<RunningServer>
where
    F: Fn() -> SessionBuilder + Send + Sync + Clone + 'static,
{
    let server = server.workers(1).bind_listener(unused_listener()?)?;
    let addr = server.local_addr().ok_or("server has no address")?;
    let (shutdown, rx) = oneshot::channel();
    let task = tokio::spawn(server.run_with_shutdown(async {
        let _ = rx.await;
    }));
    Ok(RunningServer {
        addr,
        shutdown,
        task,
    })
}

fn factory(config: EtpConfig) -> impl Fn() -> SessionBuilder + Send + Sync + Clone + 'static {
    move || SessionBuilder::new(config.clone()).application("wellstream-test-server", "1.0")
}

fn token_check(
    expected: &'static str,
) -> impl for<'a> Fn(&'a TransportPreamble) -> BoxFuture<'a, Result<(), PreambleError>>
+ Send
+ Sync
+ 'static {
    move |preamble| {
        let allowed = preamble.authorization.as_deref() == Some(expected);
        Box::pin(async move {
            if allowed {
                Ok(())
            } else {
                Err(PreambleError::Rejected("unknown token".into()))
            }
        })
    }
}

async fn expect_disconnect(stream: &mut TcpStream) -> TestResult {
    let mut buf = [0_u8; 64];
    match timeout(Duration::from_secs(3), stream.read(&mut buf)).await? {
        Ok(0) | Err(_) => Ok(()),
        Ok(n) => Err(format!("server wrote {n} bytes to a refused connection").into()),
    }
}

#[rstest]
#[tokio::test]
async fn sessions_open_after_the_preamble(config: EtpConfig) -> TestResult {
    let server = start(EtpServer::new(factory(config.clone())))?;
    let mut stream = TcpStream::connect(server.addr).await?;
    write_preamble(&mut stream, &TransportPreamble::new(Some(TOKEN.into()))).await?;

    let session = SessionBuilder::new(config).connect(stream).await?;

    assert_eq!(session.state(), SessionState::Open);
    assert!(session.session_id().is_some());
    assert_eq!(
        session.peer_application(),
        Some(("wellstream-test-server", "1.0"))
    );
    assert!(
        session
            .negotiated_protocols()
            .iter()
            .any(|p| p.protocol == Protocol::Core.id())
    );

    session.close("done").await;
    server.stop().await
}

#[rstest]
#[tokio::test]
async fn preamble_hook_sees_the_token(config: EtpConfig) -> TestResult {
    let server = start(
        EtpServer::new(factory(config.clone())).on_preamble(token_check(TOKEN)),
    )?;

    let mut refused = TcpStream::connect(server.addr).await?;
    write_preamble(&mut refused, &TransportPreamble::new(Some("bearer nope".into()))).await?;
    expect_disconnect(&mut refused).await?;

    let mut accepted = TcpStream::connect(server.addr).await?;
    write_preamble(&mut accepted, &TransportPreamble::new(Some(TOKEN.into()))).await?;
    let session = SessionBuilder::new(config).connect(accepted).await?;
    assert_eq!(session.state(), SessionState::Open);

    session.close("done").await;
    server.stop().await
}

#[rstest]
#[tokio::test]
async fn bad_magic_is_refused(config: EtpConfig) -> TestResult {
    let server = start(EtpServer::new(factory(config)))?;
    let mut stream = TcpStream::connect(server.addr).await?;
    let preamble = TransportPreamble {
        magic: *b"HTTP",
        ..TransportPreamble::default()
    };
    write_preamble(&mut stream, &preamble).await?;

    expect_disconnect(&mut stream).await?;
    server.stop().await
}

#[rstest]
#[tokio::test]
async fn silent_clients_time_out(config: EtpConfig) -> TestResult {
    let server = start(EtpServer::new(factory(config)))?;
    let mut stream = TcpStream::connect(server.addr).await?;

    expect_disconnect(&mut stream).await?;
    server.stop().await
}

#[rstest]
#[tokio::test]
async fn preamble_can_be_disabled(config: EtpConfig) -> TestResult {
    let server = start(EtpServer::new(factory(config.clone())).without_preamble())?;
    let stream = TcpStream::connect(server.addr).await?;

    let session = SessionBuilder::new(config).connect(stream).await?;

    assert_eq!(session.state(), SessionState::Open);
    session.close("done").await;
    server.stop().await
}

#[rstest]
#[tokio::test]
async fn shutdown_closes_live_sessions(config: EtpConfig) -> TestResult {
    let server = start(EtpServer::new(factory(config.clone())))?;
    let mut stream = TcpStream::connect(server.addr).await?;
    write_preamble(&mut stream, &TransportPreamble::default()).await?;
    let session = SessionBuilder::new(config).connect(stream).await?;

    server.stop().await?;

    timeout(Duration::from_secs(5), session.wait_closed()).await?;
    assert_eq!(
        session.close_reason(),
        Some(CloseReason::PeerClosed("server shutting down".into()))
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn run_requires_a_listener(config: EtpConfig) {
    let server = EtpServer::new(factory(config));
    assert!(server.local_addr().is_none());
    assert!(matches!(
        server.run_with_shutdown(async {}).await,
        Err(ServerError::NotBound)
    ));
}

#[rstest]
fn worker_count_is_never_zero(config: EtpConfig) {
    let server = EtpServer::new(factory(config));
    assert!(server.worker_count() >= 1);
    assert_eq!(server.workers(0).worker_count(), 1);
}
