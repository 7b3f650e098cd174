//! Tokio codec over the packet framing layer.
//!
//! Decoding yields [`Frame`]s rather than packets so the session can report
//! a malformed body as an anomaly and keep reading. Only a framing error
//! surfaces as `Err`, after which the stream must be dropped.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::{
    peek_declared_size, try_extract_packet, Frame, Packet, DEFAULT_MAX_PACKET_SIZE,
};
use crate::error::{ProtocolError, Result};

/// Per-connection codec. Owns the scratch buffer used to assemble packet
/// bodies before the header is known.
#[derive(Debug)]
pub struct PacketCodec {
    max_packet_size: usize,
    scratch: BytesMut,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            scratch: BytesMut::with_capacity(256),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match try_extract_packet(&src[..], self.max_packet_size)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => {
                // Size is already validated against the limit at this point
                if let Some(declared) = peek_declared_size(&src[..]) {
                    src.reserve(declared.saturating_sub(src.len()));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_with(&mut self.scratch, dst, self.max_packet_size)?;
        Ok(())
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_with(&mut self.scratch, dst, self.max_packet_size)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::attribute::AttributeValue;
    use crate::error::FramingError;

    #[test]
    fn test_decode_advances_only_on_full_frame() {
        let mut codec = PacketCodec::default();
        let packet = Packet::new(0x0010).with("value", AttributeValue::Int32(77));
        let bytes = packet.to_bytes().unwrap();

        let mut buf = BytesMut::from(&bytes[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&bytes[3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Packet(packet)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_is_fatal() {
        let mut codec = PacketCodec::new(128);
        let mut buf = BytesMut::from(&[0x00, 0x10, 0x01, 0x00][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Framing(FramingError::Oversized { declared: 4096, limit: 128 })
        ));
    }

    #[test]
    fn test_encode_reuses_scratch() {
        let mut codec = PacketCodec::default();
        let mut dst = BytesMut::new();
        let packet = Packet::new(0x0020)
            .with("peer", AttributeValue::Int32(1))
            .with("body", AttributeValue::text("hello"));

        codec.encode(&packet, &mut dst).unwrap();
        codec.encode(packet.clone(), &mut dst).unwrap();
        assert!(codec.scratch.is_empty());

        let first = codec.decode(&mut dst).unwrap();
        let second = codec.decode(&mut dst).unwrap();
        assert_eq!(first, Some(Frame::Packet(packet.clone())));
        assert_eq!(second, Some(Frame::Packet(packet)));
        assert!(dst.is_empty());
    }
}
