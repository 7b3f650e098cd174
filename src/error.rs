//! # Error Types
//!
//! Error handling for the arena protocol core.
//!
//! The taxonomy follows how far an error is allowed to travel:
//! - **Decode errors**: one attribute or packet body is unreadable. The
//!   containing packet is dropped and the stream continues.
//! - **Framing errors**: the frame boundary itself cannot be trusted. The
//!   reliable connection is torn down.
//! - **Encode errors**: an outgoing value cannot be represented on the wire.
//! - **Session errors**: authentication failures, lost transports, and
//!   unreachable or failing peer channels, surfaced to the owner as events.
//!
//! ## Example Usage
//! ```rust
//! use arena_protocol::core::packet::Packet;
//! use arena_protocol::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn parse(bytes: &[u8]) -> Result<Packet> {
//!     Packet::from_bytes(bytes)
//! }
//!
//! match parse(&[0x05, 0x00, 0x10, 0x00, 0x00]) {
//!     Ok(packet) => info!(type_id = packet.type_id, "parsed"),
//!     Err(ProtocolError::Decode(e)) => error!(error = %e, "dropping packet"),
//!     Err(e) => error!(error = %e, "closing connection"),
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::protocol::handshake::AuthFailureReason;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Session errors
    pub const ERR_KEEPALIVE_EXPIRED: &str = "No inbound traffic within the keepalive window";
    pub const ERR_STREAM_ENDED: &str = "Server closed the connection";
    pub const ERR_OUTBOUND_QUEUE_CLOSED: &str = "Outbound queue closed";
    pub const ERR_SESSION_CLOSED: &str = "Session already closed";

    /// Handshake-specific errors
    pub const ERR_HANDSHAKE_OUT_OF_SEQUENCE: &str = "Packet received out of login sequence";
    pub const ERR_BAD_SALT_LENGTH: &str = "Login challenge salt must be 40 bytes";
    pub const ERR_AUTH_TERMINAL: &str = "Login state machine already finished";

    /// NAT traversal errors
    pub const ERR_MEDIATOR_TIMEOUT: &str = "NAT mediator did not answer";
    pub const ERR_PUNCH_EXHAUSTED: &str = "No authenticated pong within the retry budget";
    pub const ERR_IPV6_UNSUPPORTED: &str = "Legacy wire format only carries IPv4 endpoints";
    pub const ERR_ENGINE_STOPPED: &str = "NAT engine receive loop has stopped";
    pub const ERR_CHANNEL_NOT_ESTABLISHED: &str = "Peer channel is not established yet";
}

/// Failure to read an attribute or packet body.
///
/// Always local to one packet: the packet is dropped, the connection survives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated value: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown attribute type tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("Text value is not valid UTF-8")]
    InvalidUtf8,

    #[error("Attribute nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    #[error("Declared packet size {declared} but attributes used {consumed} bytes")]
    LengthMismatch { declared: usize, consumed: usize },

    #[error("Missing attribute '{0}'")]
    MissingAttribute(&'static str),

    #[error("Attribute '{0}' has an unexpected type")]
    WrongType(&'static str),

    #[error("Attribute '{name}' has an invalid value: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Failure to locate a frame boundary. Fatal for the reliable connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Packet too large: {declared} bytes (limit {limit})")]
    Oversized { declared: usize, limit: usize },

    #[error("Declared packet size {0} is smaller than the header")]
    Undersized(usize),
}

/// A value that cannot be represented on the legacy wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Attribute name is {0} bytes (max 255)")]
    NameTooLong(usize),

    #[error("Attribute name contains a character outside Latin-1")]
    NameNotLatin1,

    #[error("Text value is {0} bytes (max 65535)")]
    TextTooLong(usize),

    #[error("Collection has {len} items (max {max})")]
    TooManyItems { len: usize, max: usize },

    #[error("Collection item does not match declared tag 0x{expected:02x}")]
    ItemTagMismatch { expected: u8 },

    #[error("Attribute nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    #[error("Packet has {0} attributes (max 255)")]
    TooManyAttributes(usize),

    #[error("Encoded packet is {size} bytes (limit {limit})")]
    PacketTooLarge { size: usize, limit: usize },
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Authentication failed: {0}")]
    AuthFailure(AuthFailureReason),

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Peer channel degraded")]
    ChannelDegraded,

    #[error("Peer channel lost")]
    ChannelLost,

    #[error("Peer channel closed")]
    ChannelClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected message type {0:#06x}")]
    UnexpectedMessage(u16),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the error only affects a single inbound packet.
    pub fn is_packet_local(&self) -> bool {
        matches!(self, ProtocolError::Decode(_))
    }

    /// Whether a reconnect attempt is a reasonable reaction.
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::TransportLost(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::Timeout
                | ProtocolError::Framing(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
