//! Client side of the NAT mediation server.
//!
//! Requests are single-packet UDP datagrams sent from the engine socket and
//! answered by the mediator with a reply carrying the same `rid`. The engine
//! receive loop hands mediator datagrams to [`Mediator::handle_datagram`],
//! which completes the matching pending request.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

use crate::config::NatConfig;
use crate::core::attribute::SessionId;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::transport::nat::assessment::{classify, NatAssessment};

#[derive(Debug, Clone)]
pub struct MediatorReply {
    /// Address the reply came from; the alternate-port probe checks it
    pub from: SocketAddr,
    pub message: Message,
}

/// What the mediator knows about the peer we want to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub public: SocketAddrV4,
    pub local: Option<SocketAddrV4>,
    pub predicted_port: Option<u16>,
    pub port_delta: Option<i32>,
}

#[derive(Debug)]
pub struct Mediator {
    primary: SocketAddr,
    alternate: Option<SocketAddr>,
    next_rid: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<MediatorReply>>>,
}

/// Removes the pending entry when the request finishes or is cancelled.
struct PendingRequest<'a> {
    mediator: &'a Mediator,
    rid: u32,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.mediator.pending.lock() {
            pending.remove(&self.rid);
        }
    }
}

impl Mediator {
    pub fn new(primary: SocketAddr, alternate: Option<SocketAddr>) -> Self {
        Self {
            primary,
            alternate,
            next_rid: AtomicU32::new(rand::random()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn primary(&self) -> SocketAddr {
        self.primary
    }

    pub fn is_mediator(&self, addr: &SocketAddr) -> bool {
        *addr == self.primary || self.alternate.as_ref() == Some(addr)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Route one datagram from a mediator address. Returns false when it
    /// matched no outstanding request.
    pub fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) -> bool {
        let message = match Packet::from_bytes(bytes)
            .and_then(|packet| Message::from_packet(&packet).map_err(ProtocolError::from))
        {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, error = %e, "unreadable mediator datagram");
                return false;
            }
        };

        let rid = match &message {
            Message::MediationProbeReply { request_id, .. }
            | Message::MediationLookupReply { request_id, .. } => *request_id,
            other => {
                debug!(%from, type_id = other.type_id(), "unexpected mediator message");
                return false;
            }
        };

        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&rid),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => tx.send(MediatorReply { from, message }).is_ok(),
            None => {
                trace!(%from, rid, "stale mediator reply");
                false
            }
        }
    }

    /// Send a request built by `make` and wait for its reply, resending with
    /// a fresh `rid` up to `retries` more times.
    pub async fn request<F>(
        &self,
        socket: &UdpSocket,
        destination: SocketAddr,
        make: F,
        timeout: Duration,
        retries: u32,
    ) -> Result<MediatorReply>
    where
        F: Fn(u32) -> Message,
    {
        for attempt in 0..=retries {
            let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_ENGINE_STOPPED.into()))?
                .insert(rid, tx);
            let _guard = PendingRequest { mediator: self, rid };

            let bytes = make(rid).to_packet().to_bytes()?;
            socket.send_to(&bytes, destination).await?;

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => {
                    return Err(ProtocolError::TransportLost(
                        constants::ERR_ENGINE_STOPPED.into(),
                    ))
                }
                Err(_) => trace!(%destination, rid, attempt, "mediator request timed out"),
            }
        }

        warn!(%destination, "{}", constants::ERR_MEDIATOR_TIMEOUT);
        Err(ProtocolError::Timeout)
    }

    /// Probe the mediator and classify our mapping.
    #[instrument(skip(self, socket, config), fields(mediator = %self.primary))]
    pub async fn assess(
        &self,
        socket: &UdpSocket,
        local_port: u16,
        config: &NatConfig,
    ) -> NatAssessment {
        let mut observed = Vec::new();
        for probe in 0..config.assessment_probes {
            // Alternate destinations expose per-destination mappings
            let destination = match self.alternate {
                Some(alt) if probe % 2 == 1 => alt,
                _ => self.primary,
            };
            let reply = self
                .request(
                    socket,
                    destination,
                    |request_id| Message::MediationProbe {
                        request_id,
                        alternate: false,
                    },
                    config.mediator_timeout,
                    config.mediator_retries,
                )
                .await;
            match reply {
                Ok(MediatorReply {
                    message: Message::MediationProbeReply { observed: addr, .. },
                    ..
                }) => observed.push(addr),
                Ok(other) => debug!(type_id = other.message.type_id(), "probe got wrong reply"),
                Err(e) => debug!(%destination, error = %e, "probe failed"),
            }
        }

        let mut assessment = classify(local_port, &observed, config.max_port_delta);

        if self.alternate.is_some() && !observed.is_empty() {
            let reply = self
                .request(
                    socket,
                    self.primary,
                    |request_id| Message::MediationProbe {
                        request_id,
                        alternate: true,
                    },
                    config.mediator_timeout,
                    0,
                )
                .await;
            if let Ok(reply) = reply {
                assessment.inbound_filtered = reply.from == self.primary;
            }
        }

        debug!(
            level = ?assessment.level,
            inbound_filtered = assessment.inbound_filtered,
            public = ?assessment.public,
            "NAT assessment complete"
        );
        assessment
    }

    /// Ask where `peer` can be reached for the channel named by `token`.
    #[instrument(skip(self, socket, config))]
    pub async fn lookup(
        &self,
        socket: &UdpSocket,
        own: SessionId,
        peer: SessionId,
        token: u32,
        config: &NatConfig,
    ) -> Result<LookupResult> {
        let reply = self
            .request(
                socket,
                self.primary,
                |request_id| Message::MediationLookup {
                    request_id,
                    own,
                    peer,
                    token,
                },
                config.mediator_timeout,
                config.mediator_retries,
            )
            .await?;

        match reply.message {
            Message::MediationLookupReply {
                public,
                local,
                predicted_port,
                port_delta,
                ..
            } => Ok(LookupResult {
                public,
                local,
                predicted_port,
                port_delta,
            }),
            other => Err(ProtocolError::UnexpectedMessage(other.type_id())),
        }
    }
}

/// Endpoints to ping, in order, without duplicates.
///
/// Predicted ports step by `delta` (1 when unknown) from `predicted`,
/// `window` of them at most; ports that leave the u16 range are skipped.
pub fn candidate_endpoints(
    public: Option<SocketAddrV4>,
    local: Option<SocketAddrV4>,
    predicted: Option<u16>,
    delta: Option<i32>,
    window: u16,
) -> Vec<SocketAddr> {
    let mut candidates: Vec<SocketAddr> = Vec::new();
    let mut push = |addr: SocketAddrV4| {
        let addr = SocketAddr::V4(addr);
        if !candidates.contains(&addr) {
            candidates.push(addr);
        }
    };

    if let Some(public) = public {
        push(public);
    }
    if let Some(local) = local {
        push(local);
    }
    if let (Some(public), Some(predicted)) = (public, predicted) {
        let step = match delta {
            Some(d) if d != 0 => d,
            _ => 1,
        };
        for i in 0..i32::from(window) {
            let port = i32::from(predicted) + i * step;
            if let Ok(port) = u16::try_from(port) {
                if port != 0 {
                    push(SocketAddrV4::new(*public.ip(), port));
                }
            }
        }
    }
    candidates
}
