#![allow(clippy::unwrap_used)]

use arena_protocol::core::attribute::{AttributeValue, ValueTag};
use arena_protocol::core::codec::PacketCodec;
use arena_protocol::core::packet::{Frame, Packet};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn stress_packet_encode_decode_large_series() {
    // Heavy burst through one codec and one buffer
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();

    for members in [0u32, 1, 16, 256, 1024] {
        let packet = Packet::new(0x0040).with(
            "friends",
            AttributeValue::List {
                item_tag: ValueTag::Int32,
                items: (0..members).map(AttributeValue::Int32).collect(),
            },
        );
        for _ in 0..2_000 {
            codec.encode(&packet, &mut buf).unwrap();
        }
        for _ in 0..2_000 {
            match codec.decode(&mut buf).unwrap() {
                Some(Frame::Packet(decoded)) => assert_eq!(decoded.attributes.len(), 1),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(buf.is_empty());
    }
}
