//! # Core Wire Format
//!
//! Attribute values, packet framing and the tokio codec that ties them to a
//! byte stream.
//!
//! ## Components
//! - **Attribute**: named, tagged values that make up every packet body
//! - **Packet**: fixed header plus attribute sequence, frame extraction
//! - **Codec**: Tokio codec for framing over the reliable stream
//!
//! ## Wire Format
//! ```text
//! [TotalSize(2)] [TypeId(2)] [AttrCount(1)] [Attribute * AttrCount]
//! Attribute: [NameLen(1)] [Name] [Tag(1)] [Value]
//! ```
//!
//! ## Security
//! - Maximum packet size: 64KB, checked from the header before buffering
//! - Nesting depth of collections bounded at 16 on encode and decode
//! - Unknown tags fail the packet; they are never skipped

pub mod attribute;
pub mod codec;
pub mod packet;
