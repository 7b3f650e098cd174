//! # Packet Framing
//!
//! ```text
//! [TotalSize(2, LE)] [TypeId(2, LE)] [AttrCount(1)] [Attribute * AttrCount]
//! ```
//!
//! `TotalSize` counts every byte of the frame including the header. Frame
//! extraction works on a growing, in-order byte buffer and never consumes
//! anything until a whole frame is present, so the transport may fragment or
//! coalesce frames arbitrarily.
//!
//! ## Security
//! - The declared size is validated against a limit before anything is
//!   buffered for it
//! - A body that does not fill its declared size exactly is rejected as a
//!   whole; nothing from it is dispatched

use bytes::{BufMut, BytesMut};

use crate::core::attribute::{Attribute, AttributeValue, OpaqueId, SessionId};
use crate::error::{DecodeError, EncodeError, FramingError, ProtocolError, Result};

/// Size + type id + attribute count.
pub const HEADER_LEN: usize = 5;

/// Default ceiling for a declared frame size.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// A decoded packet: a type id and its attributes in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub type_id: u16,
    pub attributes: Vec<Attribute>,
}

/// Result of extracting one frame from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed packet
    Packet(Packet),
    /// The frame boundary was sound but the body was not; the frame's bytes
    /// have been consumed and the packet must be dropped.
    Malformed {
        type_id: u16,
        size: usize,
        error: DecodeError,
    },
}

impl Packet {
    pub fn new(type_id: u16) -> Self {
        Self {
            type_id,
            attributes: Vec::new(),
        }
    }

    /// Builder-style append.
    pub fn with(mut self, name: &str, value: AttributeValue) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &str, value: AttributeValue) {
        self.attributes.push(Attribute::new(name, value));
    }

    /// First attribute with the given name.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| &attr.value)
    }

    pub fn text(&self, name: &'static str) -> std::result::Result<&str, DecodeError> {
        self.require(name)?
            .as_text()
            .ok_or(DecodeError::WrongType(name))
    }

    pub fn int(&self, name: &'static str) -> std::result::Result<u32, DecodeError> {
        self.require(name)?
            .as_int()
            .ok_or(DecodeError::WrongType(name))
    }

    pub fn session_id(&self, name: &'static str) -> std::result::Result<SessionId, DecodeError> {
        self.require(name)?
            .as_session_id()
            .ok_or(DecodeError::WrongType(name))
    }

    pub fn generic_id(&self, name: &'static str) -> std::result::Result<OpaqueId, DecodeError> {
        self.require(name)?
            .as_generic_id()
            .ok_or(DecodeError::WrongType(name))
    }

    pub fn opt_text(&self, name: &'static str) -> std::result::Result<Option<&str>, DecodeError> {
        self.get(name)
            .map(|value| value.as_text().ok_or(DecodeError::WrongType(name)))
            .transpose()
    }

    pub fn opt_int(&self, name: &'static str) -> std::result::Result<Option<u32>, DecodeError> {
        self.get(name)
            .map(|value| value.as_int().ok_or(DecodeError::WrongType(name)))
            .transpose()
    }

    pub fn opt_generic_id(
        &self,
        name: &'static str,
    ) -> std::result::Result<Option<OpaqueId>, DecodeError> {
        self.get(name)
            .map(|value| value.as_generic_id().ok_or(DecodeError::WrongType(name)))
            .transpose()
    }

    fn require(&self, name: &'static str) -> std::result::Result<&AttributeValue, DecodeError> {
        self.get(name).ok_or(DecodeError::MissingAttribute(name))
    }

    /// Encode into `dst`, using `scratch` to assemble the body first.
    ///
    /// The attribute count and attributes go into `scratch`; once the total
    /// length is known the size and type id are written to `dst` followed by
    /// the body. `scratch` is left empty on success.
    pub fn encode_with(
        &self,
        scratch: &mut BytesMut,
        dst: &mut BytesMut,
        max_packet_size: usize,
    ) -> std::result::Result<(), EncodeError> {
        scratch.clear();

        if self.attributes.len() > u8::MAX as usize {
            return Err(EncodeError::TooManyAttributes(self.attributes.len()));
        }
        scratch.put_u8(self.attributes.len() as u8);
        for attr in &self.attributes {
            attr.encode(scratch)?;
        }

        let total = scratch.len() + 4;
        let limit = max_packet_size.min(u16::MAX as usize);
        if total > limit {
            scratch.clear();
            return Err(EncodeError::PacketTooLarge { size: total, limit });
        }

        dst.reserve(total);
        dst.put_u16_le(total as u16);
        dst.put_u16_le(self.type_id);
        dst.extend_from_slice(scratch);
        scratch.clear();
        Ok(())
    }

    /// Size of the encoded frame, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.attributes.iter().map(Attribute::wire_len).sum::<usize>()
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, EncodeError> {
        let mut scratch = BytesMut::new();
        let mut dst = BytesMut::new();
        self.encode_with(&mut scratch, &mut dst, DEFAULT_MAX_PACKET_SIZE)?;
        Ok(dst.to_vec())
    }

    /// Parse a buffer holding exactly one frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Packet> {
        match try_extract_packet(bytes, DEFAULT_MAX_PACKET_SIZE)? {
            Some((Frame::Packet(packet), consumed)) if consumed == bytes.len() => Ok(packet),
            // The caller declared the whole buffer as one frame
            Some((Frame::Packet(_), consumed)) => Err(DecodeError::LengthMismatch {
                declared: bytes.len(),
                consumed,
            }
            .into()),
            Some((Frame::Malformed { error, .. }, _)) => Err(error.into()),
            None => Err(ProtocolError::Decode(DecodeError::Truncated {
                needed: peek_declared_size(bytes).unwrap_or(HEADER_LEN),
                available: bytes.len(),
            })),
        }
    }
}

/// Read the declared frame size, if enough bytes are buffered to know it.
pub fn peek_declared_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_le_bytes([buf[0], buf[1]]) as usize)
}

/// Try to take one frame off the front of `buf`.
///
/// - `Ok(None)`: more data is needed; nothing was consumed.
/// - `Ok(Some((frame, n)))`: the first `n` bytes form one frame.
/// - `Err(_)`: the declared size cannot be honoured; the stream is unusable.
pub fn try_extract_packet(
    buf: &[u8],
    max_packet_size: usize,
) -> std::result::Result<Option<(Frame, usize)>, FramingError> {
    let declared = match peek_declared_size(buf) {
        Some(size) => size,
        None => return Ok(None),
    };

    if declared < HEADER_LEN {
        return Err(FramingError::Undersized(declared));
    }
    if declared > max_packet_size {
        return Err(FramingError::Oversized {
            declared,
            limit: max_packet_size,
        });
    }
    if buf.len() < declared {
        return Ok(None);
    }

    let type_id = u16::from_le_bytes([buf[2], buf[3]]);
    let frame = match decode_body(&buf[4..declared], declared) {
        Ok(attributes) => Frame::Packet(Packet {
            type_id,
            attributes,
        }),
        Err(error) => Frame::Malformed {
            type_id,
            size: declared,
            error,
        },
    };
    Ok(Some((frame, declared)))
}

fn decode_body(body: &[u8], declared: usize) -> std::result::Result<Vec<Attribute>, DecodeError> {
    let mut cursor = body;
    let (&count, rest) = cursor.split_first().ok_or(DecodeError::Truncated {
        needed: 1,
        available: 0,
    })?;
    cursor = rest;

    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        attributes.push(Attribute::decode_from(&mut cursor)?);
    }

    if !cursor.is_empty() {
        return Err(DecodeError::LengthMismatch {
            declared,
            consumed: declared - cursor.len(),
        });
    }
    Ok(attributes)
}
