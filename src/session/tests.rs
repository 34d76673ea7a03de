//! Unit tests for session internals driven by a raw framed peer.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rstest::{fixture, rstest};
use tokio::io::{DuplexStream, duplex};
use tokio_util::codec::Framed;

use super::*;
use crate::{
    codec::EtpFrameCodec,
    message::{CloseSession, RequestSession, Start},
};

type RawPeer = Framed<DuplexStream, EtpFrameCodec>;

#[fixture]
fn config() -> EtpConfig {
    EtpConfig {
        request_timeout: Duration::from_secs(2),
        ..EtpConfig::default()
    }
}

fn accept(config: EtpConfig) -> (Session, RawPeer) {
    let (local, remote) = duplex(64 * 1024);
    let session = SessionBuilder::new(config).accept(local);
    (session, Framed::new(remote, EtpFrameCodec::default()))
}

fn request_session(message_id: i64) -> EtpMessage {
    let body = MessageBody::RequestSession(RequestSession {
        application_name: "peer".into(),
        application_version: "1".into(),
        requested_protocols: vec![SupportedProtocol::new(Protocol::Core, Role::Client)],
        supported_objects: Vec::new(),
    });
    let header = MessageHeader::for_body(Protocol::Core, &body, message_id, 0, MessageFlags::NONE)
        .expect("valid header");
    EtpMessage::new(header, body)
}

fn farewell() -> MessageBody {
    MessageBody::CloseSession(CloseSession {
        reason: "test".into(),
    })
}

async fn next(peer: &mut RawPeer) -> EtpMessage {
    tokio::time::timeout(Duration::from_secs(1), peer.next())
        .await
        .expect("message in time")
        .expect("stream open")
        .expect("decodable")
}

#[rstest]
#[tokio::test]
async fn non_core_sends_wait_for_open(config: EtpConfig) {
    let (session, _peer) = accept(config);
    assert_eq!(session.state(), SessionState::Negotiating);

    let body = MessageBody::Start(Start {
        max_message_rate: 1,
        max_data_items: 1,
    });
    let error = session
        .send(Protocol::ChannelStreaming, body, 0)
        .expect_err("streaming before open");

    assert!(matches!(
        error,
        EtpError::InvalidState(SessionState::Negotiating)
    ));
}

#[rstest]
#[tokio::test]
async fn message_ids_are_allocated_in_order(config: EtpConfig) {
    let (session, mut peer) = accept(config);
    peer.send(request_session(1)).await.expect("send request");

    let open = next(&mut peer).await;
    assert_eq!(open.kind(), Some(MessageKind::OpenSession));
    assert_eq!(open.header.message_id, 1);
    assert_eq!(open.header.correlation_id, 1);
    assert!(open.header.is_final());

    let reserved = session.reserve_message_id().expect("reserve");
    let sent = session
        .send(Protocol::Core, farewell(), 0)
        .expect("send");
    assert_eq!((reserved, sent), (2, 3));
}

#[rstest]
#[tokio::test]
async fn close_announces_and_cancels_pending_requests(config: EtpConfig) {
    let (session, mut peer) = accept(config);
    peer.send(request_session(1)).await.expect("send request");
    let _open = next(&mut peer).await;

    let waiter = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .request(
                    Protocol::Core,
                    farewell(),
                    &[MessageKind::Acknowledge],
                    Duration::from_secs(5),
                )
                .await
        })
    };
    let request = next(&mut peer).await;
    assert_eq!(request.kind(), Some(MessageKind::CloseSession));

    session.close("maintenance").await;

    let outcome = waiter.await.expect("join");
    assert!(matches!(
        outcome,
        Err(EtpError::SessionClosed(CloseReason::Requested(ref r))) if r == "maintenance"
    ));
    let announced = next(&mut peer).await;
    assert!(matches!(
        announced.body,
        MessageBody::CloseSession(ref close) if close.reason == "maintenance"
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.send(Protocol::Core, request.body, 0).is_err());
}

#[rstest]
#[tokio::test]
async fn peer_disconnect_closes_abruptly(config: EtpConfig) {
    let (session, peer) = accept(config);
    drop(peer);

    tokio::time::timeout(Duration::from_secs(1), session.wait_closed())
        .await
        .expect("closed in time");

    assert_eq!(session.close_reason(), Some(CloseReason::Disconnected));
}
