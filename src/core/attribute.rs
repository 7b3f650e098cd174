//! # Attribute Codec
//!
//! Every packet body is a sequence of named, typed attributes:
//!
//! ```text
//! [NameLen(1)] [Name(NameLen, Latin-1)] [Tag(1)] [Value]
//! ```
//!
//! Value layouts by tag (all integers little-endian):
//!
//! | tag  | variant       | layout                                      |
//! |------|---------------|---------------------------------------------|
//! | 0x01 | Text          | `u16 len`, UTF-8 bytes                      |
//! | 0x02 | Int32         | 4 bytes                                     |
//! | 0x03 | SessionId     | 16 raw bytes                                |
//! | 0x04 | GenericId     | 16 raw bytes                                |
//! | 0x05 | List          | `u8 item_tag`, `u16 count`, items           |
//! | 0x06 | TextKeyedMap  | `u8 value_tag`, `u8 count`, (Text key, value)* |
//! | 0x07 | IntKeyedMap   | `u8 value_tag`, `u8 count`, (`u8` key, value)* |
//!
//! Collections are homogeneous: the item tag is written once and items carry
//! no tag of their own. Nesting is bounded to [`MAX_NESTING_DEPTH`] on both
//! encode and decode.

use bytes::{Buf, BufMut};
use std::fmt;

use crate::error::{DecodeError, EncodeError};

/// Maximum number of nested List/map levels accepted in either direction.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Longest attribute name the one-byte length prefix can describe.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Longest Text value the two-byte length prefix can describe.
pub const MAX_TEXT_LEN: usize = u16::MAX as usize;

/// Wire type tag of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    Text = 0x01,
    Int32 = 0x02,
    SessionId = 0x03,
    GenericId = 0x04,
    List = 0x05,
    TextKeyedMap = 0x06,
    IntKeyedMap = 0x07,
}

impl ValueTag {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ValueTag::Text),
            0x02 => Some(ValueTag::Int32),
            0x03 => Some(ValueTag::SessionId),
            0x04 => Some(ValueTag::GenericId),
            0x05 => Some(ValueTag::List),
            0x06 => Some(ValueTag::TextKeyedMap),
            0x07 => Some(ValueTag::IntKeyedMap),
            _ => None,
        }
    }
}

/// 16-byte opaque identifier assigned to a live login session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// 16-byte value with no known semantics, relayed byte-for-byte.
///
/// The `did` field seen in low-frequency packets is carried this way.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueId(pub [u8; 16]);

impl OpaqueId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for OpaqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueId({})", hex::encode(self.0))
    }
}

/// A typed attribute value. The variant alone decides the wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    Int32(u32),
    SessionId(SessionId),
    GenericId(OpaqueId),
    List {
        item_tag: ValueTag,
        items: Vec<AttributeValue>,
    },
    TextKeyedMap {
        value_tag: ValueTag,
        entries: Vec<(String, AttributeValue)>,
    },
    IntKeyedMap {
        value_tag: ValueTag,
        entries: Vec<(u8, AttributeValue)>,
    },
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        AttributeValue::Text(value.into())
    }

    pub fn tag(&self) -> ValueTag {
        match self {
            AttributeValue::Text(_) => ValueTag::Text,
            AttributeValue::Int32(_) => ValueTag::Int32,
            AttributeValue::SessionId(_) => ValueTag::SessionId,
            AttributeValue::GenericId(_) => ValueTag::GenericId,
            AttributeValue::List { .. } => ValueTag::List,
            AttributeValue::TextKeyedMap { .. } => ValueTag::TextKeyedMap,
            AttributeValue::IntKeyedMap { .. } => ValueTag::IntKeyedMap,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u32> {
        match self {
            AttributeValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_session_id(&self) -> Option<SessionId> {
        match self {
            AttributeValue::SessionId(sid) => Some(*sid),
            _ => None,
        }
    }

    pub fn as_generic_id(&self) -> Option<OpaqueId> {
        match self {
            AttributeValue::GenericId(id) => Some(*id),
            _ => None,
        }
    }

    /// Size of the value body on the wire, tag excluded.
    pub fn body_len(&self) -> usize {
        match self {
            AttributeValue::Text(s) => 2 + s.len(),
            AttributeValue::Int32(_) => 4,
            AttributeValue::SessionId(_) | AttributeValue::GenericId(_) => 16,
            AttributeValue::List { items, .. } => {
                3 + items.iter().map(AttributeValue::body_len).sum::<usize>()
            }
            AttributeValue::TextKeyedMap { entries, .. } => {
                2 + entries
                    .iter()
                    .map(|(key, value)| 2 + key.len() + value.body_len())
                    .sum::<usize>()
            }
            AttributeValue::IntKeyedMap { entries, .. } => {
                2 + entries
                    .iter()
                    .map(|(_, value)| 1 + value.body_len())
                    .sum::<usize>()
            }
        }
    }

    /// Write the value body (no tag) at the given nesting depth.
    fn encode_body<B: BufMut>(&self, dst: &mut B, depth: usize) -> Result<(), EncodeError> {
        match self {
            AttributeValue::Text(s) => put_text(dst, s),
            AttributeValue::Int32(v) => {
                dst.put_u32_le(*v);
                Ok(())
            }
            AttributeValue::SessionId(sid) => {
                dst.put_slice(&sid.0);
                Ok(())
            }
            AttributeValue::GenericId(id) => {
                dst.put_slice(&id.0);
                Ok(())
            }
            AttributeValue::List { item_tag, items } => {
                check_depth_for_encode(depth)?;
                if items.len() > u16::MAX as usize {
                    return Err(EncodeError::TooManyItems {
                        len: items.len(),
                        max: u16::MAX as usize,
                    });
                }
                dst.put_u8(item_tag.as_byte());
                dst.put_u16_le(items.len() as u16);
                for item in items {
                    check_item_tag(*item_tag, item)?;
                    item.encode_body(dst, depth + 1)?;
                }
                Ok(())
            }
            AttributeValue::TextKeyedMap { value_tag, entries } => {
                check_depth_for_encode(depth)?;
                check_map_len(entries.len())?;
                dst.put_u8(value_tag.as_byte());
                dst.put_u8(entries.len() as u8);
                for (key, value) in entries {
                    check_item_tag(*value_tag, value)?;
                    put_text(dst, key)?;
                    value.encode_body(dst, depth + 1)?;
                }
                Ok(())
            }
            AttributeValue::IntKeyedMap { value_tag, entries } => {
                check_depth_for_encode(depth)?;
                check_map_len(entries.len())?;
                dst.put_u8(value_tag.as_byte());
                dst.put_u8(entries.len() as u8);
                for (key, value) in entries {
                    check_item_tag(*value_tag, value)?;
                    dst.put_u8(*key);
                    value.encode_body(dst, depth + 1)?;
                }
                Ok(())
            }
        }
    }

    /// Read a value body of the given tag at the given nesting depth.
    fn decode_body(tag: ValueTag, src: &mut &[u8], depth: usize) -> Result<Self, DecodeError> {
        match tag {
            ValueTag::Text => Ok(AttributeValue::Text(take_text(src)?)),
            ValueTag::Int32 => {
                need(src, 4)?;
                Ok(AttributeValue::Int32(src.get_u32_le()))
            }
            ValueTag::SessionId => Ok(AttributeValue::SessionId(SessionId(take_id(src)?))),
            ValueTag::GenericId => Ok(AttributeValue::GenericId(OpaqueId(take_id(src)?))),
            ValueTag::List => {
                check_depth_for_decode(depth)?;
                let item_tag = take_tag(src)?;
                need(src, 2)?;
                let count = src.get_u16_le() as usize;
                // Every item is at least one byte, so the remaining input bounds the allocation.
                let mut items = Vec::with_capacity(count.min(src.len()));
                for _ in 0..count {
                    items.push(Self::decode_body(item_tag, src, depth + 1)?);
                }
                Ok(AttributeValue::List { item_tag, items })
            }
            ValueTag::TextKeyedMap => {
                check_depth_for_decode(depth)?;
                let value_tag = take_tag(src)?;
                need(src, 1)?;
                let count = src.get_u8() as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = take_text(src)?;
                    let value = Self::decode_body(value_tag, src, depth + 1)?;
                    entries.push((key, value));
                }
                Ok(AttributeValue::TextKeyedMap { value_tag, entries })
            }
            ValueTag::IntKeyedMap => {
                check_depth_for_decode(depth)?;
                let value_tag = take_tag(src)?;
                need(src, 1)?;
                let count = src.get_u8() as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    need(src, 1)?;
                    let key = src.get_u8();
                    let value = Self::decode_body(value_tag, src, depth + 1)?;
                    entries.push((key, value));
                }
                Ok(AttributeValue::IntKeyedMap { value_tag, entries })
            }
        }
    }
}

/// A named attribute, the unit a packet body is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Append the wire form of this attribute to `dst`.
    ///
    /// On error `dst` may hold a partial attribute; callers encode into a
    /// scratch buffer and discard it on failure.
    pub fn encode<B: BufMut>(&self, dst: &mut B) -> Result<(), EncodeError> {
        let name = latin1_bytes(&self.name)?;
        dst.put_u8(name.len() as u8);
        dst.put_slice(&name);
        dst.put_u8(self.value.tag().as_byte());
        self.value.encode_body(dst, 0)
    }

    /// Size on the wire, assuming the attribute is encodable.
    pub fn wire_len(&self) -> usize {
        2 + self.name.chars().count() + self.value.body_len()
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode one attribute from the front of `src`.
    ///
    /// Returns the attribute and the number of bytes it occupied. Never reads
    /// past `src`.
    pub fn decode(src: &[u8]) -> Result<(Attribute, usize), DecodeError> {
        let mut cursor = src;
        let attribute = Self::decode_from(&mut cursor)?;
        Ok((attribute, src.len() - cursor.len()))
    }

    pub(crate) fn decode_from(src: &mut &[u8]) -> Result<Attribute, DecodeError> {
        need(src, 1)?;
        let name_len = src.get_u8() as usize;
        let name = latin1_string(take_slice(src, name_len)?);
        let tag = take_tag(src)?;
        let value = AttributeValue::decode_body(tag, src, 0)?;
        Ok(Attribute { name, value })
    }
}

fn check_depth_for_encode(depth: usize) -> Result<(), EncodeError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(EncodeError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    Ok(())
}

fn check_depth_for_decode(depth: usize) -> Result<(), DecodeError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(DecodeError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    Ok(())
}

fn check_item_tag(expected: ValueTag, item: &AttributeValue) -> Result<(), EncodeError> {
    if item.tag() != expected {
        return Err(EncodeError::ItemTagMismatch {
            expected: expected.as_byte(),
        });
    }
    Ok(())
}

fn check_map_len(len: usize) -> Result<(), EncodeError> {
    if len > u8::MAX as usize {
        return Err(EncodeError::TooManyItems {
            len,
            max: u8::MAX as usize,
        });
    }
    Ok(())
}

fn put_text<B: BufMut>(dst: &mut B, text: &str) -> Result<(), EncodeError> {
    if text.len() > MAX_TEXT_LEN {
        return Err(EncodeError::TextTooLong(text.len()));
    }
    dst.put_u16_le(text.len() as u16);
    dst.put_slice(text.as_bytes());
    Ok(())
}

fn latin1_bytes(name: &str) -> Result<Vec<u8>, EncodeError> {
    let bytes = name
        .chars()
        .map(|c| u8::try_from(c).map_err(|_| EncodeError::NameNotLatin1))
        .collect::<Result<Vec<u8>, _>>()?;
    if bytes.len() > MAX_NAME_LEN {
        return Err(EncodeError::NameTooLong(bytes.len()));
    }
    Ok(bytes)
}

fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

#[inline]
fn need(src: &[u8], needed: usize) -> Result<(), DecodeError> {
    if src.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: src.len(),
        });
    }
    Ok(())
}

fn take_slice<'a>(src: &mut &'a [u8], len: usize) -> Result<&'a [u8], DecodeError> {
    need(src, len)?;
    let (head, tail) = src.split_at(len);
    *src = tail;
    Ok(head)
}

fn take_tag(src: &mut &[u8]) -> Result<ValueTag, DecodeError> {
    need(src, 1)?;
    let byte = src.get_u8();
    ValueTag::from_byte(byte).ok_or(DecodeError::UnknownTag(byte))
}

fn take_id(src: &mut &[u8]) -> Result<[u8; 16], DecodeError> {
    let mut id = [0u8; 16];
    id.copy_from_slice(take_slice(src, 16)?);
    Ok(id)
}

fn take_text(src: &mut &[u8]) -> Result<String, DecodeError> {
    need(src, 2)?;
    let len = src.get_u16_le() as usize;
    let bytes = take_slice(src, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}
