//! Two NAT engines punching each other over loopback

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use arena_protocol::config::NatConfig;
use arena_protocol::core::attribute::SessionId;
use arena_protocol::error::ProtocolError;
use arena_protocol::protocol::message::PeerOffer;
use arena_protocol::transport::nat::{
    ChannelRequest, ChannelState, CloseReason, NatAssessment, NatEngine, NatLevel, NatRole,
};
use arena_protocol::utils::Metrics;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

const ALICE: SessionId = SessionId([0xA1; 16]);
const BOB: SessionId = SessionId([0xB0; 16]);

fn config() -> NatConfig {
    NatConfig {
        bind_address: "127.0.0.1:0".into(),
        mediator_timeout: Duration::from_millis(50),
        mediator_retries: 0,
        punch_attempt_timeout: Duration::from_millis(100),
        punch_attempts: 5,
        ..NatConfig::default()
    }
}

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("loopback engines are IPv4"),
    }
}

/// An engine whose mapping is its own socket address.
async fn forwarded_engine(config: NatConfig) -> (NatEngine, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let (engine, _notices) = NatEngine::bind(config, Arc::clone(&metrics)).await.unwrap();
    engine.prime_assessment(NatAssessment {
        level: NatLevel::ConsistentPortForwarded,
        inbound_filtered: false,
        public: Some(v4(engine.local_addr())),
        port_delta: Some(0),
    });
    (engine, metrics)
}

/// Run the server-relayed offer/accept exchange and punch from both sides.
async fn connect(
    alice: &NatEngine,
    bob: &NatEngine,
) -> (
    arena_protocol::error::Result<arena_protocol::transport::nat::PeerChannel>,
    arena_protocol::error::Result<arena_protocol::transport::nat::PeerChannel>,
) {
    let offer = alice.create_offer(BOB).await;
    let received_by_bob = PeerOffer {
        session_id: ALICE,
        ..offer.clone()
    };

    let (public, local) = bob.local_hints().await;
    let received_by_alice = PeerOffer {
        session_id: BOB,
        token: offer.token,
        salt: offer.salt,
        public,
        local,
    };

    tokio::join!(
        alice.request_peer_channel(ChannelRequest::from_offer(
            ALICE,
            &received_by_alice,
            NatRole::Originator
        )),
        bob.request_peer_channel(ChannelRequest::from_offer(
            BOB,
            &received_by_bob,
            NatRole::Recipient
        )),
    )
}

#[tokio::test]
async fn test_channel_established_both_ways() {
    let (alice, alice_metrics) = forwarded_engine(config()).await;
    let (bob, _) = forwarded_engine(config()).await;

    let (a, b) = timeout(Duration::from_secs(3), connect(&alice, &bob))
        .await
        .expect("punching took too long");
    let mut a = a.unwrap();
    let mut b = b.unwrap();

    assert_eq!(a.endpoint(), bob.local_addr());
    assert_eq!(b.endpoint(), alice.local_addr());
    assert_eq!(a.peer(), BOB);
    assert_eq!(b.peer(), ALICE);
    assert_eq!(a.token(), b.token());
    assert_eq!(a.state(), ChannelState::Established);
    assert!(a.health().is_ok());

    a.send(Bytes::from_static(b"over the wall")).await.unwrap();
    let got = timeout(Duration::from_secs(1), b.recv()).await.unwrap();
    assert_eq!(got, Some(Bytes::from_static(b"over the wall")));

    b.send(Bytes::from_static(b"and back")).await.unwrap();
    let got = timeout(Duration::from_secs(1), a.recv()).await.unwrap();
    assert_eq!(got, Some(Bytes::from_static(b"and back")));

    let snapshot = alice_metrics.snapshot();
    assert_eq!(snapshot.peer_channels_requested, 1);
    assert_eq!(snapshot.peer_channels_established, 1);
}

#[tokio::test]
async fn test_close_reaches_peer_and_is_idempotent() {
    let (alice, _) = forwarded_engine(config()).await;
    let (bob, _) = forwarded_engine(config()).await;
    let (a, b) = connect(&alice, &bob).await;
    let mut a = a.unwrap();
    let mut b = b.unwrap();

    a.close();
    a.close();
    timeout(Duration::from_secs(1), a.closed())
        .await
        .expect("local close did not finish");
    assert!(matches!(
        a.send(Bytes::from_static(b"late")).await,
        Err(ProtocolError::ChannelClosed)
    ));

    // Bob's side ends once the close datagram lands
    let end = timeout(Duration::from_secs(1), b.recv()).await.unwrap();
    assert_eq!(end, None);
    timeout(Duration::from_secs(1), b.closed()).await.unwrap();
    assert_eq!(b.close_reason(), Some(CloseReason::ClosedByPeer));
    assert!(matches!(b.health(), Err(ProtocolError::ChannelClosed)));
    assert_eq!(a.close_reason(), Some(CloseReason::ClosedLocally));
}

#[tokio::test]
async fn test_silent_peer_is_unreachable_within_budget() {
    let config = config();
    let budget = config.punch_budget();
    let (engine, metrics) = forwarded_engine(config).await;

    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = ChannelRequest {
        peer: BOB,
        own: ALICE,
        token: 0x0BAD_F00D,
        salt: arena_protocol::core::attribute::OpaqueId([9; 16]),
        public: Some(v4(silent.local_addr().unwrap())),
        local: None,
        role: NatRole::Originator,
    };

    let started = Instant::now();
    let result = timeout(budget * 4, engine.request_peer_channel(request))
        .await
        .expect("request outlived its punch budget");
    assert!(matches!(result, Err(ProtocolError::PeerUnreachable(_))));
    assert!(started.elapsed() >= budget / 2);
    assert_eq!(metrics.snapshot().peer_channels_unreachable, 1);

    // The pings did go out
    let mut buf = [0u8; 64];
    let (len, from) = silent.recv_from(&mut buf).await.unwrap();
    assert!(len >= 7);
    assert_eq!(&buf[..2], b"UA");
    assert_eq!(from, engine.local_addr());
}

#[tokio::test]
async fn test_mediator_failure_falls_back_to_offered_hints() {
    // Unworkable NAT forces a lookup; nothing listens at the mediator
    let (alice, _) = forwarded_engine(config()).await;
    let metrics = Arc::new(Metrics::new());
    let (bob, _notices) = NatEngine::bind(config(), metrics).await.unwrap();
    bob.prime_assessment(NatAssessment::unworkable());

    let (a, b) = timeout(Duration::from_secs(3), connect(&alice, &bob))
        .await
        .expect("punching took too long");
    assert_eq!(b.unwrap().endpoint(), alice.local_addr());
    assert_eq!(a.unwrap().endpoint(), bob.local_addr());
}

#[tokio::test]
async fn test_token_collision_is_rejected() {
    let (engine, _) = forwarded_engine(config()).await;
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = ChannelRequest {
        peer: BOB,
        own: ALICE,
        token: 77,
        salt: arena_protocol::core::attribute::OpaqueId([1; 16]),
        public: Some(v4(silent.local_addr().unwrap())),
        local: None,
        role: NatRole::Originator,
    };

    let first = tokio::spawn({
        let engine = engine.clone();
        let request = request.clone();
        async move { engine.request_peer_channel(request).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = engine.request_peer_channel(request).await;
    assert!(matches!(second, Err(ProtocolError::HandshakeError(_))));
    assert!(first.await.unwrap().is_err());
}
