//! Login handshake state machine.
//!
//! The sequence is fixed by the legacy service:
//!
//! 1. On connect the client writes the raw 4-byte token, then `ClientInfo`
//!    and `ClientVersion`.
//! 2. The server answers with `LoginChallenge` carrying a 40-byte salt.
//! 3. The client sends `LoginRequest` with the salted double hash.
//! 4. The server ends the exchange with `LoginSuccess` or `LoginFailure`.
//!
//! [`ClientAuth`] is sans-IO: it consumes packets and yields what to send.
//! The state is per connection and owns the credentials only until the
//! challenge has been answered.

use std::fmt;

use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core::attribute::{OpaqueId, SessionId};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{packet_type, Message};
use crate::utils::logging::{Redacted, RedactedBytes};

#[allow(unused_imports)]
use tracing::{debug, instrument, warn};

/// Raw bytes written before the first packet.
pub const HANDSHAKE_TOKEN: [u8; 4] = *b"UAP1";

/// Constant mixed into the inner login hash. Shared with the legacy
/// service, not a secret.
pub const VENDOR_CONSTANT: &str = "UltimateArena";

/// Challenge salt length in bytes.
pub const SALT_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    AwaitingHandshakeAck,
    AwaitingChallenge,
    AwaitingLoginResult,
    Authenticated,
    Failed,
}

impl AuthState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Failed)
    }
}

/// Why a login did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailureReason {
    BadCredentials,
    /// The account is logged in elsewhere
    DuplicateLogin,
    VersionRejected,
    /// The server broke the login sequence
    ProtocolViolation(String),
    TimedOut,
    /// Reason code outside the known set
    Unknown(u32),
}

impl AuthFailureReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 | 2 => AuthFailureReason::BadCredentials,
            3 => AuthFailureReason::DuplicateLogin,
            4 => AuthFailureReason::VersionRejected,
            other => AuthFailureReason::Unknown(other),
        }
    }
}

impl fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailureReason::BadCredentials => f.write_str("bad credentials"),
            AuthFailureReason::DuplicateLogin => f.write_str("logged in elsewhere"),
            AuthFailureReason::VersionRejected => f.write_str("client version rejected"),
            AuthFailureReason::ProtocolViolation(detail) => {
                write!(f, "protocol violation: {detail}")
            }
            AuthFailureReason::TimedOut => f.write_str("timed out waiting for the server"),
            AuthFailureReason::Unknown(code) => write!(f, "unknown reason code {code}"),
        }
    }
}

/// Username and password. Wiped from memory on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &Redacted(&self.password))
            .finish()
    }
}

/// What the client announces about itself after the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub skin: String,
    pub version_label: String,
    pub version: u32,
    pub build: String,
    pub did: Option<OpaqueId>,
}

/// An authenticated login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: u32,
    pub display_name: String,
    pub protocol_version: u32,
}

/// Outcome of feeding one packet to [`ClientAuth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this packet and keep waiting
    Send(Packet),
    Authenticated(Session),
    Failed(AuthFailureReason),
}

/// `hex(SHA1(username ‖ password ‖ vendor))`, the salt-independent half.
fn inner_hash(username: &str, password: &str) -> Zeroizing<String> {
    let mut hasher = Sha1::new();
    hasher.update(username.as_bytes());
    hasher.update(password.as_bytes());
    hasher.update(VENDOR_CONSTANT.as_bytes());
    let digest = hasher.finalize();
    Zeroizing::new(hex::encode(digest))
}

/// Salted login proof: `SHA1(hex(SHA1(username ‖ password ‖ vendor)) ‖ salt)`.
pub fn compute_login_hash(username: &str, password: &str, salt: &[u8]) -> [u8; 20] {
    let inner = inner_hash(username, password);
    let mut hasher = Sha1::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    hasher.finalize().into()
}

/// Per-connection client login state.
#[derive(Debug)]
pub struct ClientAuth {
    state: AuthState,
    identity: ClientIdentity,
    credentials: Option<Credentials>,
}

impl ClientAuth {
    pub fn new(identity: ClientIdentity, credentials: Credentials) -> Self {
        Self {
            state: AuthState::Disconnected,
            identity,
            credentials: Some(credentials),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// The transport is up. Returns the raw token to write first.
    #[instrument(skip(self))]
    pub fn on_connected(&mut self) -> Result<[u8; 4]> {
        self.expect_state(AuthState::Disconnected)?;
        self.state = AuthState::AwaitingHandshakeAck;
        debug!("Transport connected, sending handshake token");
        Ok(HANDSHAKE_TOKEN)
    }

    /// The token has been written. Returns the two announcement packets.
    #[instrument(skip(self))]
    pub fn on_token_sent(&mut self) -> Result<[Packet; 2]> {
        self.expect_state(AuthState::AwaitingHandshakeAck)?;
        self.state = AuthState::AwaitingChallenge;

        let info = Message::ClientInfo {
            skin: self.identity.skin.clone(),
            version: self.identity.version_label.clone(),
            did: self.identity.did,
        };
        let version = Message::ClientVersion {
            version: self.identity.version,
            build: self.identity.build.clone(),
        };
        Ok([info.to_packet(), version.to_packet()])
    }

    /// Feed one inbound packet.
    ///
    /// # Errors
    /// `HandshakeError` once the exchange has finished. Protocol problems,
    /// including a packet arriving before the token went out, are reported
    /// as [`AuthStep::Failed`].
    #[instrument(skip(self, packet), fields(type_id = packet.type_id, state = ?self.state))]
    pub fn on_packet(&mut self, packet: &Packet) -> Result<AuthStep> {
        match self.state {
            AuthState::AwaitingChallenge => Ok(self.on_challenge(packet)),
            AuthState::AwaitingLoginResult => Ok(self.on_login_result(packet)),
            AuthState::Authenticated | AuthState::Failed => Err(ProtocolError::HandshakeError(
                constants::ERR_AUTH_TERMINAL.into(),
            )),
            AuthState::Disconnected | AuthState::AwaitingHandshakeAck => {
                Ok(self.fail(AuthFailureReason::ProtocolViolation(
                    constants::ERR_HANDSHAKE_OUT_OF_SEQUENCE.into(),
                )))
            }
        }
    }

    /// Force the terminal failure state, e.g. on timeout or framing error.
    pub fn fail(&mut self, reason: AuthFailureReason) -> AuthStep {
        warn!(%reason, state = ?self.state, "Login failed");
        self.state = AuthState::Failed;
        self.credentials = None;
        AuthStep::Failed(reason)
    }

    fn on_challenge(&mut self, packet: &Packet) -> AuthStep {
        if packet.type_id != packet_type::LOGIN_CHALLENGE {
            return self.out_of_sequence(packet.type_id);
        }
        let salt = match Message::from_packet(packet) {
            Ok(Message::LoginChallenge { salt }) => salt,
            Ok(_) => return self.out_of_sequence(packet.type_id),
            Err(e) => return self.fail(AuthFailureReason::ProtocolViolation(e.to_string())),
        };
        if salt.len() != SALT_LEN {
            warn!(salt = %RedactedBytes(salt.as_bytes()), "Rejecting login challenge");
            return self.fail(AuthFailureReason::ProtocolViolation(
                constants::ERR_BAD_SALT_LENGTH.into(),
            ));
        }

        let credentials = match self.credentials.take() {
            Some(credentials) => credentials,
            None => {
                return self.fail(AuthFailureReason::ProtocolViolation(
                    constants::ERR_AUTH_TERMINAL.into(),
                ))
            }
        };

        let proof = compute_login_hash(
            credentials.username(),
            &credentials.password,
            salt.as_bytes(),
        );
        let request = Message::LoginRequest {
            username: credentials.username().to_owned(),
            password_hash: hex::encode(proof),
        };

        self.state = AuthState::AwaitingLoginResult;
        debug!(salt = %RedactedBytes(salt.as_bytes()), "Answered login challenge");
        AuthStep::Send(request.to_packet())
    }

    fn on_login_result(&mut self, packet: &Packet) -> AuthStep {
        match Message::from_packet(packet) {
            Ok(Message::LoginSuccess {
                user_id,
                session_id,
                display_name,
                protocol_version,
            }) => {
                self.state = AuthState::Authenticated;
                debug!(user_id, %session_id, "Login accepted");
                AuthStep::Authenticated(Session {
                    session_id,
                    user_id,
                    display_name,
                    protocol_version,
                })
            }
            Ok(Message::LoginFailure { reason }) => {
                self.fail(AuthFailureReason::from_code(reason))
            }
            Ok(_) => self.out_of_sequence(packet.type_id),
            Err(e) => self.fail(AuthFailureReason::ProtocolViolation(e.to_string())),
        }
    }

    fn out_of_sequence(&mut self, type_id: u16) -> AuthStep {
        self.fail(AuthFailureReason::ProtocolViolation(format!(
            "{} (type {type_id:#06x})",
            constants::ERR_HANDSHAKE_OUT_OF_SEQUENCE
        )))
    }

    fn expect_state(&self, expected: AuthState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::HandshakeError(format!(
                "{}: expected {expected:?}, in {:?}",
                constants::ERR_HANDSHAKE_OUT_OF_SEQUENCE,
                self.state
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_mapping() {
        assert_eq!(AuthFailureReason::from_code(1), AuthFailureReason::BadCredentials);
        assert_eq!(AuthFailureReason::from_code(2), AuthFailureReason::BadCredentials);
        assert_eq!(AuthFailureReason::from_code(3), AuthFailureReason::DuplicateLogin);
        assert_eq!(AuthFailureReason::from_code(4), AuthFailureReason::VersionRejected);
        assert_eq!(AuthFailureReason::from_code(99), AuthFailureReason::Unknown(99));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("alice", "hunter2");
        let printed = format!("{creds:?}");
        assert!(printed.contains("alice"));
        assert!(printed.contains("[REDACTED]"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_inner_hash_form() {
        let inner = inner_hash("alice", "secret");
        assert_eq!(inner.as_str(), "c0be5bf13e4605a1291330abaf84b2f9bec1d9bd");
    }

    #[test]
    fn test_hash_depends_on_salt() {
        let a = compute_login_hash("alice", "secret", &[b'a'; SALT_LEN]);
        let b = compute_login_hash("alice", "secret", &[b'b'; SALT_LEN]);
        assert_ne!(a, b);
    }
}
