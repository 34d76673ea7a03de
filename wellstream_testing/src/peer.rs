//! Scripted remote endpoint speaking framed ETP.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncWriteExt, DuplexStream, duplex},
    time::timeout,
};
use tokio_util::codec::Framed;
use wellstream::{
    EtpFrameCodec,
    EtpMessage,
    MessageBody,
    MessageFlags,
    MessageHeader,
    MessageKind,
    Session,
    SessionBuilder,
    message::{OpenSession, RequestSession},
    protocol::{Protocol, SupportedProtocol},
};

use crate::TestResult;

/// How long [`TestPeer::recv`] waits before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

const DUPLEX_CAPACITY: usize = 64 * 1024;

/// The far end of a session under test.
///
/// Outbound message ids are allocated from 1 upwards, like a real endpoint.
#[derive(Debug)]
pub struct TestPeer {
    framed: Framed<DuplexStream, EtpFrameCodec>,
    next_id: i64,
}

impl TestPeer {
    /// Wrap one end of a duplex stream.
    #[must_use]
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, EtpFrameCodec::default()),
            next_id: 1,
        }
    }

    /// Start a server-side session from `builder` and return it with the
    /// peer acting as its client.
    #[must_use]
    pub fn accept(builder: SessionBuilder) -> (Session, Self) {
        let (local, remote) = duplex(DUPLEX_CAPACITY);
        (builder.accept(local), Self::new(remote))
    }

    /// A connected pair of streams: one for the session, one for the peer.
    #[must_use]
    pub fn pair() -> (DuplexStream, Self) {
        let (local, remote) = duplex(DUPLEX_CAPACITY);
        (local, Self::new(remote))
    }

    /// Send `body` on `protocol` and return its message id.
    ///
    /// # Errors
    ///
    /// Fails if the header cannot be built or the transport is closed.
    pub async fn send(
        &mut self,
        protocol: Protocol,
        body: MessageBody,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> TestResult<i64> {
        let message_id = self.allocate();
        let header = MessageHeader::for_body(protocol, &body, message_id, correlation_id, flags)?;
        self.send_message(EtpMessage::new(header, body)).await?;
        Ok(message_id)
    }

    /// Send a header-only message of `kind`.
    ///
    /// # Errors
    ///
    /// Fails if the transport is closed.
    pub async fn send_no_data(
        &mut self,
        protocol: Protocol,
        kind: MessageKind,
        correlation_id: i64,
        flags: MessageFlags,
    ) -> TestResult<i64> {
        let message_id = self.allocate();
        let header = MessageHeader::no_data(protocol, kind, message_id, correlation_id, flags);
        self.send_message(EtpMessage::new(header, MessageBody::Empty))
            .await?;
        Ok(message_id)
    }

    /// Send a prebuilt message, header untouched.
    ///
    /// # Errors
    ///
    /// Fails if encoding fails or the transport is closed.
    pub async fn send_message(&mut self, message: EtpMessage) -> TestResult {
        self.framed.send(message).await?;
        Ok(())
    }

    /// Write `bytes` as one length-prefixed frame without encoding them.
    ///
    /// # Errors
    ///
    /// Fails if the transport is closed.
    pub async fn send_raw_frame(&mut self, bytes: &[u8]) -> TestResult {
        let len = u32::try_from(bytes.len())?;
        let stream = self.framed.get_mut();
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Next message from the session.
    ///
    /// # Errors
    ///
    /// Fails after [`RECV_TIMEOUT`], when the transport closes or when the
    /// frame does not decode.
    pub async fn recv(&mut self) -> TestResult<EtpMessage> {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(message))) => Ok(message),
            Ok(Some(Err(error))) => Err(error.into()),
            Ok(None) => Err("transport closed".into()),
            Err(_) => Err(format!("no message within {RECV_TIMEOUT:?}").into()),
        }
    }

    /// Next message other than an `Acknowledge`.
    ///
    /// # Errors
    ///
    /// As [`TestPeer::recv`].
    pub async fn recv_skipping_acks(&mut self) -> TestResult<EtpMessage> {
        loop {
            let message = self.recv().await?;
            if message.kind() != Some(MessageKind::Acknowledge) {
                return Ok(message);
            }
        }
    }

    /// The next message if one arrives within `wait`.
    ///
    /// # Errors
    ///
    /// Fails when the transport closes or a frame does not decode.
    pub async fn recv_within(&mut self, wait: Duration) -> TestResult<Option<EtpMessage>> {
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(message))) => Ok(Some(message)),
            Ok(Some(Err(error))) => Err(error.into()),
            Ok(None) => Err("transport closed".into()),
            Err(_) => Ok(None),
        }
    }

    /// Read until the session closes the transport, returning everything
    /// received on the way.
    ///
    /// # Errors
    ///
    /// Fails if the transport stays open past [`RECV_TIMEOUT`] of silence.
    pub async fn drain_until_closed(&mut self) -> TestResult<Vec<EtpMessage>> {
        let mut seen = Vec::new();
        loop {
            match timeout(RECV_TIMEOUT, self.framed.next()).await {
                Ok(Some(Ok(message))) => seen.push(message),
                Ok(Some(Err(_)) | None) => return Ok(seen),
                Err(_) => return Err("transport still open".into()),
            }
        }
    }

    /// Negotiate as a client requesting `protocols`.
    ///
    /// # Errors
    ///
    /// Fails if the session answers with anything but a correlated
    /// `OpenSession`.
    pub async fn open(&mut self, protocols: Vec<SupportedProtocol>) -> TestResult<OpenSession> {
        let request_id = self
            .send(
                Protocol::Core,
                request_session(protocols),
                0,
                MessageFlags::NONE,
            )
            .await?;
        let reply = self.recv().await?;
        if reply.header.correlation_id != request_id {
            return Err(format!(
                "reply correlates to {} not {request_id}",
                reply.header.correlation_id
            )
            .into());
        }
        match reply.body {
            MessageBody::OpenSession(open) => Ok(open),
            other => Err(format!("expected OpenSession, got {other:?}").into()),
        }
    }

    /// Close the peer's side of the transport.
    ///
    /// # Errors
    ///
    /// Fails if flushing pending frames fails.
    pub async fn shutdown(mut self) -> TestResult {
        self.framed.close().await?;
        Ok(())
    }

    fn allocate(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// `RequestSession` from an application called `test-peer`.
#[must_use]
pub fn request_session(protocols: Vec<SupportedProtocol>) -> MessageBody {
    MessageBody::RequestSession(RequestSession {
        application_name: "test-peer".into(),
        application_version: "1.0".into(),
        requested_protocols: protocols,
        supported_objects: Vec::new(),
    })
}
