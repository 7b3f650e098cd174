//! UDP side of NAT traversal.
//!
//! One engine owns one socket. A receive loop demultiplexes everything that
//! arrives on it: mediator replies by source address, peer datagrams by
//! channel token. Each channel runs in its own task around a
//! [`PeerSession`], so channels never share mutable state beyond the
//! assessment cache.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::NatConfig;
use crate::core::attribute::{OpaqueId, SessionId};
use crate::error::{constants, EncodeError, ProtocolError, Result};
use crate::protocol::message::PeerOffer;
use crate::transport::nat::assessment::{AssessmentCache, NatAssessment};
use crate::transport::nat::datagram::{PeerDatagram, MAX_PAYLOAD_SIZE};
use crate::transport::nat::mediator::{candidate_endpoints, Mediator};
use crate::transport::nat::peer::{
    ChannelState, CloseReason, NatRole, PeerEvent, PeerSession,
};
use crate::utils::Metrics;

/// Receive buffer; anything longer than a peer datagram is truncated and
/// then rejected by the decoder.
pub const RECV_BUFFER_SIZE: usize = 2048;

type Inbound = (SocketAddr, PeerDatagram);

/// Channel state as last published by the channel task.
type ChannelStatus = (ChannelState, Option<CloseReason>);

/// Everything needed to punch one channel.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub peer: SessionId,
    pub own: SessionId,
    pub token: u32,
    pub salt: OpaqueId,
    pub public: Option<SocketAddrV4>,
    pub local: Option<SocketAddrV4>,
    pub role: NatRole,
}

impl ChannelRequest {
    /// Build a request from the offer the other side sent through the server.
    pub fn from_offer(own: SessionId, offer: &PeerOffer, role: NatRole) -> Self {
        Self {
            peer: offer.session_id,
            own,
            token: offer.token,
            salt: offer.salt,
            public: offer.public,
            local: offer.local,
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelNoticeKind {
    Degraded,
    Recovered,
    Lost,
    Closed,
}

/// Health changes of established channels, for the session owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelNotice {
    pub peer: SessionId,
    pub token: u32,
    pub kind: ChannelNoticeKind,
}

struct Router {
    mediator: Mediator,
    channels: Mutex<HashMap<u32, mpsc::Sender<Inbound>>>,
    metrics: Arc<Metrics>,
}

impl Router {
    fn route(&self, from: SocketAddr, bytes: &[u8]) {
        if self.mediator.is_mediator(&from) {
            if !self.mediator.handle_datagram(from, bytes) {
                self.metrics.datagram_dropped();
            }
            return;
        }

        let datagram = match PeerDatagram::decode(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                trace!(%from, error = %e, "dropping unreadable datagram");
                self.metrics.datagram_dropped();
                return;
            }
        };

        let channel = self
            .channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(&datagram.token).cloned());
        match channel {
            Some(tx) => {
                if tx.try_send((from, datagram)).is_err() {
                    self.metrics.datagram_dropped();
                }
            }
            None => {
                trace!(%from, token = datagram.token, "datagram for unknown channel");
                self.metrics.datagram_dropped();
            }
        }
    }

    fn register(&self, token: u32, tx: mpsc::Sender<Inbound>) -> Result<()> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_ENGINE_STOPPED.into()))?;
        if channels.contains_key(&token) {
            return Err(ProtocolError::HandshakeError(format!(
                "channel token {token:#010x} already in use"
            )));
        }
        channels.insert(token, tx);
        Ok(())
    }

    fn unregister(&self, token: u32) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&token);
        }
    }

    fn close_all(&self) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.clear();
        }
    }
}

/// Keeps a token routed to its channel until dropped.
struct Registration {
    router: Arc<Router>,
    token: u32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.router.unregister(self.token);
    }
}

struct EngineInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: NatConfig,
    router: Arc<Router>,
    cache: AssessmentCache,
    assess_lock: tokio::sync::Mutex<()>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
    metrics: Arc<Metrics>,
    receive_task: JoinHandle<()>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.receive_task.abort();
        // Channel tasks see their inbound queue close and stop
        self.router.close_all();
    }
}

#[derive(Clone)]
pub struct NatEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for NatEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatEngine")
            .field("local_addr", &self.inner.local_addr)
            .field("mediator", &self.inner.router.mediator.primary())
            .finish()
    }
}

impl NatEngine {
    /// Bind the engine socket and start the receive loop.
    #[instrument(skip(config, metrics), fields(bind = %config.bind_address))]
    pub async fn bind(
        config: NatConfig,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelNotice>)> {
        config.validate_strict()?;
        let bind: SocketAddr = parse_addr("bind_address", &config.bind_address)?;
        if bind.is_ipv6() {
            return Err(ProtocolError::ConfigError(
                constants::ERR_IPV6_UNSUPPORTED.into(),
            ));
        }
        let primary = parse_addr("mediator_address", &config.mediator_address)?;
        let alternate = config
            .mediator_alt_address
            .as_deref()
            .map(|addr| parse_addr("mediator_alt_address", addr))
            .transpose()?;

        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let local_addr = socket.local_addr()?;
        let router = Arc::new(Router {
            mediator: Mediator::new(primary, alternate),
            channels: Mutex::new(HashMap::new()),
            metrics: Arc::clone(&metrics),
        });
        let receive_task = tokio::spawn(receive_loop(Arc::clone(&socket), Arc::clone(&router)));
        let (notices, notice_rx) = mpsc::unbounded_channel();

        info!(%local_addr, mediator = %primary, "NAT engine bound");
        let engine = Self {
            inner: Arc::new(EngineInner {
                socket,
                local_addr,
                config,
                router,
                cache: AssessmentCache::new(),
                assess_lock: tokio::sync::Mutex::new(()),
                notices,
                metrics,
                receive_task,
            }),
        };
        Ok((engine, notice_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &NatConfig {
        &self.inner.config
    }

    /// Cached assessment, measuring through the mediator on a miss.
    pub async fn assessment(&self) -> NatAssessment {
        if let Some(assessment) = self.inner.cache.get() {
            return assessment;
        }
        let _serialized = self.inner.assess_lock.lock().await;
        if let Some(assessment) = self.inner.cache.get() {
            return assessment;
        }
        let assessment = self
            .inner
            .router
            .mediator
            .assess(&self.inner.socket, self.inner.local_addr.port(), &self.inner.config)
            .await;
        self.inner.cache.set(assessment.clone());
        assessment
    }

    /// Install an assessment obtained elsewhere.
    pub fn prime_assessment(&self, assessment: NatAssessment) {
        self.inner.cache.set(assessment);
    }

    /// Forget the assessment; the next request measures again.
    pub fn network_changed(&self) {
        debug!("network change, NAT assessment invalidated");
        self.inner.cache.invalidate();
    }

    /// Endpoints worth telling a peer about: our public mapping when the
    /// NAT keeps it stable, and the socket address when it is concrete.
    pub async fn local_hints(&self) -> (Option<SocketAddrV4>, Option<SocketAddrV4>) {
        let assessment = self.assessment().await;
        let public = assessment
            .public
            .filter(|_| assessment.level.allows_direct_punch());
        let local = match self.inner.local_addr {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(addr),
            _ => None,
        };
        (public, local)
    }

    /// Fresh token, salt and hints for a channel to `target`.
    pub async fn create_offer(&self, target: SessionId) -> PeerOffer {
        let (public, local) = self.local_hints().await;
        PeerOffer {
            session_id: target,
            token: rand::random(),
            salt: OpaqueId(rand::random()),
            public,
            local,
        }
    }

    /// Punch a channel and resolve once it is established, or fail with
    /// `PeerUnreachable` after the punch budget is spent.
    #[instrument(skip(self, request), fields(peer = %request.peer, token = request.token, role = ?request.role))]
    pub async fn request_peer_channel(&self, request: ChannelRequest) -> Result<PeerChannel> {
        let inner = &self.inner;
        let config = &inner.config;
        inner.metrics.peer_channel_requested();

        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_buffer.max(1));
        inner.router.register(request.token, inbound_tx)?;
        let registration = Registration {
            router: Arc::clone(&inner.router),
            token: request.token,
        };

        let mut session = PeerSession::new(request.token, request.salt, config);
        let assessment = self.assessment().await;

        let mut candidates = Vec::new();
        if !(assessment.level.allows_direct_punch() && request.public.is_some()) {
            session.await_mediator();
            match inner
                .router
                .mediator
                .lookup(&inner.socket, request.own, request.peer, request.token, config)
                .await
            {
                Ok(found) => {
                    candidates = candidate_endpoints(
                        Some(found.public),
                        found.local,
                        found.predicted_port,
                        found.port_delta,
                        config.prediction_window,
                    );
                }
                Err(e) => debug!(error = %e, "mediator lookup failed, using offered hints"),
            }
        }
        for hint in candidate_endpoints(request.public, request.local, None, None, 0) {
            if !candidates.contains(&hint) {
                candidates.push(hint);
            }
        }

        let (established_tx, established_rx) = oneshot::channel();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.channel_buffer.max(1));
        let (incoming_tx, incoming_rx) = mpsc::channel(config.channel_buffer.max(1));
        let (close_tx, close_rx) = watch::channel(false);

        session.start_handshake(request.role, candidates, Instant::now());
        let (state_tx, state_rx) = watch::channel((session.state(), None));

        tokio::spawn(run_channel(ChannelTask {
            session,
            peer: request.peer,
            socket: Arc::clone(&inner.socket),
            inbound: inbound_rx,
            outgoing: outgoing_rx,
            incoming: incoming_tx,
            close: close_rx,
            state: state_tx,
            established: Some(established_tx),
            notices: inner.notices.clone(),
            metrics: Arc::clone(&inner.metrics),
            _registration: registration,
        }));

        match established_rx.await {
            Ok(Ok(endpoint)) => {
                inner.metrics.peer_channel_established();
                Ok(PeerChannel {
                    peer: request.peer,
                    token: request.token,
                    endpoint,
                    outgoing: outgoing_tx,
                    incoming: incoming_rx,
                    state: state_rx,
                    close: close_tx,
                })
            }
            Ok(Err(e)) => {
                inner.metrics.peer_channel_unreachable();
                Err(e)
            }
            Err(_) => {
                inner.metrics.peer_channel_unreachable();
                Err(ProtocolError::PeerUnreachable(
                    constants::ERR_ENGINE_STOPPED.into(),
                ))
            }
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| ProtocolError::ConfigError(format!("nat.{field} '{value}': {e}")))
}

async fn receive_loop(socket: Arc<UdpSocket>, router: Arc<Router>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => router.route(from, &buf[..len]),
            // ICMP unreachable from an earlier punch surfaces here on some platforms
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!(error = %e, "{}", constants::ERR_ENGINE_STOPPED);
                break;
            }
        }
    }
    router.close_all();
}

struct ChannelTask {
    session: PeerSession,
    peer: SessionId,
    socket: Arc<UdpSocket>,
    inbound: mpsc::Receiver<Inbound>,
    outgoing: mpsc::Receiver<Bytes>,
    incoming: mpsc::Sender<Bytes>,
    close: watch::Receiver<bool>,
    state: watch::Sender<ChannelStatus>,
    established: Option<oneshot::Sender<Result<SocketAddr>>>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
    metrics: Arc<Metrics>,
    _registration: Registration,
}

impl ChannelTask {
    async fn flush(&mut self) {
        while let Some(transmit) = self.session.poll_transmit() {
            if let Err(e) = self.socket.send_to(&transmit.payload, transmit.destination).await {
                trace!(destination = %transmit.destination, error = %e, "send failed");
            }
        }
    }

    fn notify(&self, kind: ChannelNoticeKind) {
        let _ = self.notices.send(ChannelNotice {
            peer: self.peer,
            token: self.session.token(),
            kind,
        });
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.session.poll_event() {
            match event {
                PeerEvent::Established { endpoint, rtt } => {
                    info!(peer = %self.peer, %endpoint, rtt_ms = rtt.as_millis() as u64, "peer channel established");
                    let delivered = self
                        .established
                        .take()
                        .map(|tx| tx.send(Ok(endpoint)).is_ok())
                        .unwrap_or(false);
                    if !delivered {
                        // The requester went away while we were punching
                        self.session.close();
                    }
                }
                PeerEvent::Degraded => {
                    warn!(peer = %self.peer, "peer channel degraded");
                    self.notify(ChannelNoticeKind::Degraded);
                }
                PeerEvent::Recovered => {
                    info!(peer = %self.peer, "peer channel recovered");
                    self.notify(ChannelNoticeKind::Recovered);
                }
                PeerEvent::EndpointChanged { from, to } => {
                    info!(peer = %self.peer, %from, %to, "peer endpoint moved after re-handshake");
                    self.metrics.rehandshake();
                }
                PeerEvent::Data(payload) => {
                    if self.incoming.try_send(payload).is_err() {
                        self.metrics.datagram_dropped();
                    }
                }
                PeerEvent::Closed(reason) => {
                    debug!(peer = %self.peer, ?reason, "peer channel closed");
                    if let Some(tx) = self.established.take() {
                        let error = match reason {
                            CloseReason::Unreachable => ProtocolError::PeerUnreachable(
                                constants::ERR_PUNCH_EXHAUSTED.into(),
                            ),
                            CloseReason::EngineStopped => ProtocolError::PeerUnreachable(
                                constants::ERR_ENGINE_STOPPED.into(),
                            ),
                            _ => ProtocolError::ChannelClosed,
                        };
                        let _ = tx.send(Err(error));
                    } else if reason == CloseReason::Lost {
                        self.metrics.peer_channel_lost();
                        self.notify(ChannelNoticeKind::Lost);
                    } else {
                        self.notify(ChannelNoticeKind::Closed);
                    }
                }
            }
        }
    }
}

async fn run_channel(mut task: ChannelTask) {
    loop {
        task.flush().await;
        task.drain_events();
        task.flush().await;
        task.state
            .send_replace((task.session.state(), task.session.close_reason()));

        if task.session.state() == ChannelState::Closed {
            break;
        }

        let deadline = task.session.poll_timeout();
        let open = task.session.state().is_open();
        tokio::select! {
            inbound = task.inbound.recv() => match inbound {
                Some((from, datagram)) => {
                    if !task.session.handle_datagram(from, datagram, Instant::now()) {
                        task.metrics.datagram_dropped();
                    }
                }
                None => task.session.abort(CloseReason::EngineStopped),
            },
            payload = task.outgoing.recv(), if open => match payload {
                Some(payload) => {
                    if let Err(e) = task.session.send_data(payload) {
                        debug!(error = %e, "dropping outbound payload");
                    }
                }
                None => task.session.close(),
            },
            _ = task.close.changed() => task.session.close(),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                task.session.handle_timeout(Instant::now());
            }
        }
    }
    trace!(peer = %task.peer, token = task.session.token(), "channel task finished");
}

/// Handle to an established peer channel.
///
/// Dropping the handle closes the channel.
pub struct PeerChannel {
    peer: SessionId,
    token: u32,
    endpoint: SocketAddr,
    outgoing: mpsc::Sender<Bytes>,
    incoming: mpsc::Receiver<Bytes>,
    state: watch::Receiver<ChannelStatus>,
    close: watch::Sender<bool>,
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel")
            .field("peer", &self.peer)
            .field("token", &self.token)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerChannel {
    pub fn peer(&self) -> SessionId {
        self.peer
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// Endpoint the channel was established on.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().0
    }

    /// Why the channel closed; `None` while it is open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.borrow().1
    }

    /// `Ok` while the channel is healthy, otherwise the error describing
    /// what happened to it.
    pub fn health(&self) -> Result<()> {
        match *self.state.borrow() {
            (ChannelState::Degraded, _) => Err(ProtocolError::ChannelDegraded),
            (ChannelState::Closed, Some(CloseReason::Lost)) => Err(ProtocolError::ChannelLost),
            (ChannelState::Closed, _) => Err(ProtocolError::ChannelClosed),
            _ => Ok(()),
        }
    }

    /// Queue one payload; it travels as a single datagram.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EncodeError::PacketTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        if *self.close.borrow() {
            return Err(ProtocolError::ChannelClosed);
        }
        // Degraded channels keep sending
        match self.health() {
            Err(ProtocolError::ChannelDegraded) | Ok(()) => {}
            Err(e) => return Err(e),
        }
        self.outgoing
            .send(payload)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Next payload from the peer; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }

    /// Close the channel. Closing twice does nothing.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    /// Wait until the channel task has shut the channel down.
    pub async fn closed(&mut self) {
        let _ = self
            .state
            .wait_for(|(state, _)| *state == ChannelState::Closed)
            .await;
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        self.close.send_replace(true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::nat::datagram::DatagramBody;
    use std::time::Duration;

    fn config() -> NatConfig {
        NatConfig {
            bind_address: "127.0.0.1:0".into(),
            ..NatConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_ipv6_bind() {
        let config = NatConfig {
            bind_address: "[::1]:0".into(),
            ..NatConfig::default()
        };
        let result = NatEngine::bind(config, Arc::new(Metrics::new())).await;
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_rejects_config_validate_flags() {
        let inverted = NatConfig {
            min_rto: Duration::from_secs(20),
            ..config()
        };
        match NatEngine::bind(inverted, Arc::new(Metrics::new())).await {
            Err(ProtocolError::ConfigError(message)) => {
                assert!(message.contains("min_rto cannot exceed max_rto"), "{message}")
            }
            other => panic!("expected ConfigError, got {other:?}"),
        }

        let unbuffered = NatConfig {
            channel_buffer: 0,
            ..config()
        };
        let result = NatEngine::bind(unbuffered, Arc::new(Metrics::new())).await;
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_unknown_datagrams_are_counted() {
        let metrics = Arc::new(Metrics::new());
        let (engine, _notices) = NatEngine::bind(config(), Arc::clone(&metrics)).await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stray = PeerDatagram::new(0xDEAD, DatagramBody::Close).to_bytes();
        sender.send_to(&stray, engine.local_addr()).await.unwrap();
        sender.send_to(b"not a datagram", engine.local_addr()).await.unwrap();

        for _ in 0..100 {
            if metrics.snapshot().datagrams_dropped >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(metrics.snapshot().datagrams_dropped, 2);
    }

    #[tokio::test]
    async fn test_offer_carries_concrete_local_hint() {
        let (engine, _notices) = NatEngine::bind(config(), Arc::new(Metrics::new())).await.unwrap();
        engine.prime_assessment(NatAssessment::unworkable());

        let offer = engine.create_offer(SessionId([1; 16])).await;
        assert_eq!(offer.public, None);
        assert_eq!(offer.local.map(SocketAddr::V4), Some(engine.local_addr()));
        assert_eq!(offer.session_id, SessionId([1; 16]));
    }
}
