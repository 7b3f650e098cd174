//! Peer-to-peer datagram format.
//!
//! ```text
//! ["UA"(2)] [Kind(1)] [Token(4, LE)] [Body]
//! Ping / Pong:            [Nonce(4, LE)] [Proof(8)]
//! KeepAlive / KeepAliveAck: [Seq(4, LE)]
//! Data:                   [Payload...]
//! Close:                  (empty)
//! ```
//!
//! The token picks the channel on the receiving engine. Proofs are the
//! first 8 bytes of `SHA1(salt ‖ label ‖ nonce_le)`; only a holder of the
//! channel salt can produce them.

use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::core::attribute::OpaqueId;
use crate::error::DecodeError;

pub const MAGIC: [u8; 2] = *b"UA";
pub const HEADER_LEN: usize = 7;
pub const PROOF_LEN: usize = 8;

/// Largest datagram the engine sends or expects (Ethernet MTU minus IPv4/UDP).
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Largest payload a single `Data` datagram carries.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_LEN;

const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;
const KIND_KEEPALIVE: u8 = 3;
const KIND_KEEPALIVE_ACK: u8 = 4;
const KIND_DATA: u8 = 5;
const KIND_CLOSE: u8 = 6;

pub type Proof = [u8; PROOF_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofLabel {
    Ping,
    Pong,
}

impl ProofLabel {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            ProofLabel::Ping => b"ping",
            ProofLabel::Pong => b"pong",
        }
    }
}

pub fn compute_proof(salt: &OpaqueId, label: ProofLabel, nonce: u32) -> Proof {
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hasher.update(label.as_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();

    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(&digest[..PROOF_LEN]);
    proof
}

/// Compare without an early exit on the first differing byte.
pub fn verify_proof(salt: &OpaqueId, label: ProofLabel, nonce: u32, proof: &Proof) -> bool {
    let expected = compute_proof(salt, label, nonce);
    expected
        .iter()
        .zip(proof.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramBody {
    Ping { nonce: u32, proof: Proof },
    Pong { nonce: u32, proof: Proof },
    KeepAlive { seq: u32 },
    KeepAliveAck { seq: u32 },
    Data(Bytes),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDatagram {
    pub token: u32,
    pub body: DatagramBody,
}

impl PeerDatagram {
    pub fn new(token: u32, body: DatagramBody) -> Self {
        Self { token, body }
    }

    pub fn ping(token: u32, salt: &OpaqueId, nonce: u32) -> Self {
        Self::new(
            token,
            DatagramBody::Ping {
                nonce,
                proof: compute_proof(salt, ProofLabel::Ping, nonce),
            },
        )
    }

    pub fn pong(token: u32, salt: &OpaqueId, nonce: u32) -> Self {
        Self::new(
            token,
            DatagramBody::Pong {
                nonce,
                proof: compute_proof(salt, ProofLabel::Pong, nonce),
            },
        )
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + PROOF_LEN + 4);
        dst.put_slice(&MAGIC);
        let kind = match &self.body {
            DatagramBody::Ping { .. } => KIND_PING,
            DatagramBody::Pong { .. } => KIND_PONG,
            DatagramBody::KeepAlive { .. } => KIND_KEEPALIVE,
            DatagramBody::KeepAliveAck { .. } => KIND_KEEPALIVE_ACK,
            DatagramBody::Data(_) => KIND_DATA,
            DatagramBody::Close => KIND_CLOSE,
        };
        dst.put_u8(kind);
        dst.put_u32_le(self.token);

        match &self.body {
            DatagramBody::Ping { nonce, proof } | DatagramBody::Pong { nonce, proof } => {
                dst.put_u32_le(*nonce);
                dst.put_slice(proof);
            }
            DatagramBody::KeepAlive { seq } | DatagramBody::KeepAliveAck { seq } => {
                dst.put_u32_le(*seq);
            }
            DatagramBody::Data(payload) => dst.put_slice(payload),
            DatagramBody::Close => {}
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<Self, DecodeError> {
        let token = peek_token(src).ok_or(DecodeError::Truncated {
            needed: HEADER_LEN,
            available: src.len(),
        })?;
        let kind = src[2];
        let body = &src[HEADER_LEN..];

        let body = match kind {
            KIND_PING | KIND_PONG => {
                let (nonce, proof) = nonce_and_proof(body)?;
                if kind == KIND_PING {
                    DatagramBody::Ping { nonce, proof }
                } else {
                    DatagramBody::Pong { nonce, proof }
                }
            }
            KIND_KEEPALIVE | KIND_KEEPALIVE_ACK => {
                let seq = exact_u32(body)?;
                if kind == KIND_KEEPALIVE {
                    DatagramBody::KeepAlive { seq }
                } else {
                    DatagramBody::KeepAliveAck { seq }
                }
            }
            KIND_DATA => DatagramBody::Data(Bytes::copy_from_slice(body)),
            KIND_CLOSE => DatagramBody::Close,
            other => return Err(DecodeError::UnknownTag(other)),
        };
        Ok(Self { token, body })
    }
}

/// Channel token of a peer datagram, if the buffer carries the magic.
pub fn peek_token(src: &[u8]) -> Option<u32> {
    if src.len() < HEADER_LEN || src[..2] != MAGIC {
        return None;
    }
    Some(u32::from_le_bytes([src[3], src[4], src[5], src[6]]))
}

fn exact_u32(body: &[u8]) -> Result<u32, DecodeError> {
    let bytes: [u8; 4] = body.try_into().map_err(|_| DecodeError::LengthMismatch {
        declared: 4,
        consumed: body.len(),
    })?;
    Ok(u32::from_le_bytes(bytes))
}

fn nonce_and_proof(body: &[u8]) -> Result<(u32, Proof), DecodeError> {
    if body.len() != 4 + PROOF_LEN {
        return Err(DecodeError::LengthMismatch {
            declared: 4 + PROOF_LEN,
            consumed: body.len(),
        });
    }
    let nonce = exact_u32(&body[..4])?;
    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(&body[4..]);
    Ok((nonce, proof))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SALT: OpaqueId = OpaqueId([0x11; 16]);

    #[test]
    fn test_ping_layout() {
        let bytes = PeerDatagram::ping(0x0403_0201, &SALT, 7).to_bytes();
        assert_eq!(&bytes[..7], &[b'U', b'A', 1, 1, 2, 3, 4]);
        assert_eq!(&bytes[7..11], &[7, 0, 0, 0]);
        assert_eq!(bytes.len(), HEADER_LEN + 4 + PROOF_LEN);
        assert_eq!(peek_token(&bytes), Some(0x0403_0201));
    }

    #[test]
    fn test_decode_each_kind() {
        let datagrams = [
            PeerDatagram::ping(1, &SALT, 10),
            PeerDatagram::pong(1, &SALT, 10),
            PeerDatagram::new(2, DatagramBody::KeepAlive { seq: 5 }),
            PeerDatagram::new(2, DatagramBody::KeepAliveAck { seq: 5 }),
            PeerDatagram::new(3, DatagramBody::Data(Bytes::from_static(b"payload"))),
            PeerDatagram::new(3, DatagramBody::Close),
        ];
        for datagram in datagrams {
            assert_eq!(PeerDatagram::decode(&datagram.to_bytes()).unwrap(), datagram);
        }
    }

    #[test]
    fn test_proof_binds_salt_label_and_nonce() {
        let proof = compute_proof(&SALT, ProofLabel::Ping, 9);
        assert!(verify_proof(&SALT, ProofLabel::Ping, 9, &proof));
        assert!(!verify_proof(&SALT, ProofLabel::Pong, 9, &proof));
        assert!(!verify_proof(&SALT, ProofLabel::Ping, 10, &proof));
        assert!(!verify_proof(&OpaqueId([0x12; 16]), ProofLabel::Ping, 9, &proof));
    }

    #[test]
    fn test_rejects_foreign_and_short_input() {
        assert_eq!(peek_token(b"XX\x01\x00\x00\x00\x00"), None);
        assert!(matches!(
            PeerDatagram::decode(b"UA\x01"),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(
            PeerDatagram::decode(b"UA\x09\x00\x00\x00\x00"),
            Err(DecodeError::UnknownTag(9))
        );
        assert!(matches!(
            PeerDatagram::decode(b"UA\x03\x00\x00\x00\x00\x01\x02"),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }
}
