//! What flows between the client core and the application around it.

use crate::core::attribute::SessionId;
use crate::error::DecodeError;
use crate::protocol::handshake::{AuthFailureReason, Credentials, Session};
use crate::transport::nat::PeerChannel;

/// Requests from the application. Sent through [`super::ClientHandle`].
#[derive(Debug)]
pub enum Command {
    Login(Credentials),
    SendMessage { target: u32, body: String },
    OpenPeerChannel(SessionId),
    CloseSession,
}

/// Everything the client reports upward, in the order it happened.
#[derive(Debug)]
pub enum Event {
    LoggedIn(Session),
    /// Terminal for this attempt; retrying is the application's call
    LoginFailed(AuthFailureReason),
    MessageReceived {
        from: u32,
        body: String,
    },
    PresenceChanged {
        user_id: u32,
        status: u32,
        text: Option<String>,
    },
    PeerChannelEstablished(PeerChannel),
    /// Direct traffic is impossible; fall back to server relay
    PeerChannelUnavailable {
        peer: SessionId,
        reason: String,
    },
    PeerChannelDegraded {
        peer: SessionId,
    },
    PeerChannelRecovered {
        peer: SessionId,
    },
    PeerChannelLost {
        peer: SessionId,
    },
    /// The server connection died; reconnecting is reasonable
    TransportLost {
        reason: String,
    },
    /// Logged in elsewhere; the server ended this session
    SessionInvalidated,
    /// A packet was dropped because its body did not decode
    ProtocolAnomaly {
        type_id: u16,
        error: DecodeError,
    },
    Closed,
}

impl Event {
    /// Whether the application should consider reconnecting.
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(self, Event::TransportLost { .. })
    }
}
