//! Timeout defaults and an async wrapper mapping elapsed deadlines to
//! `ProtocolError::Timeout`.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// TCP connect to the legacy server.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// From first byte written until `LoginSuccess`/`LoginFailure`.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Server keepalive period; the connection is dead after a few silent ones.
pub const SERVER_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Peer channel keepalive period.
pub const PEER_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// One round of pings to every candidate endpoint.
pub const PUNCH_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// One mediator request before it is retried.
pub const MEDIATOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Waiting for the remote side to accept a peer connect request.
pub const PEER_SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Flushing queued packets after a local close.
pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Await `future`, failing with `ProtocolError::Timeout` after `duration`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
