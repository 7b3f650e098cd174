#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arena_protocol::config::NatConfig;
use arena_protocol::core::attribute::SessionId;
use arena_protocol::protocol::dispatcher::Dispatcher;
use arena_protocol::protocol::message::PeerOffer;
use arena_protocol::transport::nat::{
    ChannelRequest, NatAssessment, NatEngine, NatLevel, NatRole,
};
use arena_protocol::utils::Metrics;
use bytes::Bytes;
use tokio::task::JoinSet;

async fn engine() -> NatEngine {
    let config = NatConfig {
        bind_address: "127.0.0.1:0".into(),
        ..NatConfig::default()
    };
    let (engine, _notices) = NatEngine::bind(config, Arc::new(Metrics::new())).await.unwrap();
    let SocketAddr::V4(addr) = engine.local_addr() else {
        unreachable!("bound to an IPv4 address")
    };
    engine.prime_assessment(NatAssessment {
        level: NatLevel::ConsistentPortForwarded,
        inbound_filtered: false,
        public: Some(addr),
        port_delta: Some(0),
    });
    engine
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_channels_share_one_socket() {
    let alice = engine().await;
    let bob = engine().await;
    let channels = 8u8;

    let mut tasks = JoinSet::new();
    for i in 0..channels {
        let alice = alice.clone();
        let bob = bob.clone();
        tasks.spawn(async move {
            let a_id = SessionId([i; 16]);
            let b_id = SessionId([i | 0x80; 16]);
            let offer = alice.create_offer(b_id).await;
            let (public, local) = bob.local_hints().await;
            let accept = PeerOffer {
                session_id: b_id,
                public,
                local,
                ..offer.clone()
            };
            let request = PeerOffer {
                session_id: a_id,
                ..offer
            };

            let (a, b) = tokio::join!(
                alice.request_peer_channel(ChannelRequest::from_offer(
                    a_id,
                    &accept,
                    NatRole::Originator
                )),
                bob.request_peer_channel(ChannelRequest::from_offer(
                    b_id,
                    &request,
                    NatRole::Recipient
                )),
            );
            let a = a.unwrap();
            let mut b = b.unwrap();

            let payload = Bytes::from(vec![i; 32]);
            a.send(payload.clone()).await.unwrap();
            let got = tokio::time::timeout(Duration::from_secs(2), b.recv())
                .await
                .unwrap();
            assert_eq!(got, Some(payload));
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_shared_across_threads() {
    let dispatcher = Dispatcher::new();
    let mut tasks = JoinSet::new();

    for t in 0..8u16 {
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move {
            let type_id = 0x1000 + t;
            dispatcher
                .register(type_id, move |p| Ok(Some(p.clone())))
                .unwrap();
            for _ in 0..1_000 {
                let packet = arena_protocol::core::packet::Packet::new(type_id);
                assert_eq!(dispatcher.dispatch(&packet).unwrap(), Some(packet));
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
    assert!((0..8).all(|t| dispatcher.is_registered(0x1000 + t)));
}
