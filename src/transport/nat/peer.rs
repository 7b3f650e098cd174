//! Per-channel NAT traversal state machine.
//!
//! `PeerSession` performs no I/O. The owning task feeds it datagrams and
//! timer expiries and drains the datagrams it wants sent and the events it
//! raised:
//!
//! ```text
//! Idle → AwaitingNatServerReply → Handshaking(role) → Established ⇄ Degraded
//!                                        │                  │          │
//!                                        └──────────────────┴──────────┴→ Closed
//! ```
//!
//! Only a Pong that answers a nonce we sent, from the endpoint we sent it
//! to, with a valid salted proof, establishes the channel or moves it to a
//! new endpoint. Once established, a Ping from anywhere but the active
//! endpoint earns a challenge Ping and no Pong; challenged endpoints are
//! capped at [`MAX_REHANDSHAKE_ENDPOINTS`] and forgotten after one RTO.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::NatConfig;
use crate::core::attribute::OpaqueId;
use crate::error::{constants, EncodeError, ProtocolError, Result};
use crate::transport::nat::datagram::{
    verify_proof, DatagramBody, PeerDatagram, ProofLabel, MAX_PAYLOAD_SIZE,
};
use crate::transport::nat::rtt::RttEstimator;

/// Unknown endpoints challenged at once on an established channel.
pub const MAX_REHANDSHAKE_ENDPOINTS: usize = 8;

/// Candidate endpoints kept per session, given or learned from pings.
pub const MAX_CANDIDATES: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatRole {
    /// Side that asked for the channel
    Originator,
    /// Side that accepted it
    Recipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    AwaitingNatServerReply,
    Handshaking(NatRole),
    Established,
    /// Keepalives are going unanswered; still retransmitting
    Degraded,
    Closed,
}

impl ChannelState {
    pub fn is_open(self) -> bool {
        matches!(self, ChannelState::Established | ChannelState::Degraded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No authenticated pong within the punch budget
    Unreachable,
    /// Keepalives unanswered past the loss threshold
    Lost,
    ClosedLocally,
    ClosedByPeer,
    EngineStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Established { endpoint: SocketAddr, rtt: Duration },
    Degraded,
    Recovered,
    EndpointChanged { from: SocketAddr, to: SocketAddr },
    Data(Bytes),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy)]
struct OutstandingPing {
    endpoint: SocketAddr,
    sent_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Rehandshake {
    pings: u32,
    last_sent: Instant,
}

#[derive(Debug, Default)]
struct Keepalive {
    seq: u32,
    sent_at: Option<Instant>,
    ack_deadline: Option<Instant>,
    next_send: Option<Instant>,
    misses: u32,
}

#[derive(Debug)]
pub struct PeerSession {
    token: u32,
    salt: OpaqueId,
    config: NatConfig,
    state: ChannelState,
    candidates: Vec<SocketAddr>,
    active: Option<SocketAddr>,
    rounds_sent: u32,
    round_deadline: Option<Instant>,
    outstanding: HashMap<u32, OutstandingPing>,
    rehandshakes: HashMap<SocketAddr, Rehandshake>,
    rtt: RttEstimator,
    keepalive: Keepalive,
    transmits: VecDeque<Transmit>,
    events: VecDeque<PeerEvent>,
    close_reason: Option<CloseReason>,
}

impl PeerSession {
    pub fn new(token: u32, salt: OpaqueId, config: &NatConfig) -> Self {
        Self {
            token,
            salt,
            config: config.clone(),
            state: ChannelState::Idle,
            candidates: Vec::new(),
            active: None,
            rounds_sent: 0,
            round_deadline: None,
            outstanding: HashMap::new(),
            rehandshakes: HashMap::new(),
            rtt: RttEstimator::new(
                config.initial_rto,
                config.min_rto,
                config.max_rto,
                config.rto_granularity,
            ),
            keepalive: Keepalive::default(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            close_reason: None,
        }
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Why the session closed; `None` while it is open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn active_endpoint(&self) -> Option<SocketAddr> {
        self.active
    }

    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.keepalive.misses
    }

    /// The mediator is being asked where the peer is.
    pub fn await_mediator(&mut self) {
        if self.state == ChannelState::Idle {
            self.state = ChannelState::AwaitingNatServerReply;
        }
    }

    /// Begin punching at `candidates`; the first round goes out immediately.
    pub fn start_handshake(&mut self, role: NatRole, candidates: Vec<SocketAddr>, now: Instant) {
        if !matches!(
            self.state,
            ChannelState::Idle | ChannelState::AwaitingNatServerReply
        ) {
            return;
        }
        for candidate in candidates {
            self.add_candidate(candidate);
        }
        debug!(token = self.token, ?role, candidates = self.candidates.len(), "punching");
        self.state = ChannelState::Handshaking(role);
        self.send_round(now);
    }

    /// Feed one datagram that arrived from `from`. Returns whether it was
    /// accepted; rejected datagrams are left for the caller to count.
    pub fn handle_datagram(&mut self, from: SocketAddr, datagram: PeerDatagram, now: Instant) -> bool {
        if datagram.token != self.token || self.state == ChannelState::Closed {
            return false;
        }

        match datagram.body {
            DatagramBody::Ping { nonce, proof } => {
                if !verify_proof(&self.salt, ProofLabel::Ping, nonce, &proof) {
                    trace!(%from, "ping with bad proof");
                    return false;
                }
                self.handle_ping(from, nonce, now);
                true
            }
            DatagramBody::Pong { nonce, proof } => {
                if !verify_proof(&self.salt, ProofLabel::Pong, nonce, &proof) {
                    trace!(%from, "pong with bad proof");
                    return false;
                }
                self.handle_pong(from, nonce, now)
            }
            body => {
                if !self.state.is_open() || self.active != Some(from) {
                    trace!(%from, state = ?self.state, "dropping datagram from inactive endpoint");
                    return false;
                }
                self.handle_channel_traffic(from, body, now);
                true
            }
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        match self.state {
            ChannelState::Handshaking(_) => {
                let Some(deadline) = self.round_deadline else { return };
                if now < deadline {
                    return;
                }
                if self.rounds_sent >= self.config.punch_attempts {
                    debug!(token = self.token, rounds = self.rounds_sent, "{}", constants::ERR_PUNCH_EXHAUSTED);
                    self.finish(CloseReason::Unreachable);
                } else {
                    self.send_round(now);
                }
            }
            ChannelState::Established | ChannelState::Degraded => {
                if let Some(deadline) = self.keepalive.ack_deadline {
                    if now >= deadline {
                        self.on_keepalive_missed(now);
                    }
                } else if let Some(next) = self.keepalive.next_send {
                    if now >= next {
                        self.send_keepalive(now);
                    }
                }
            }
            _ => {}
        }
    }

    /// Earliest instant `handle_timeout` has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.state {
            ChannelState::Handshaking(_) => self.round_deadline,
            ChannelState::Established | ChannelState::Degraded => {
                self.keepalive.ack_deadline.or(self.keepalive.next_send)
            }
            _ => None,
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    pub fn send_data(&mut self, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EncodeError::PacketTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        let Some(active) = self.active.filter(|_| self.state.is_open()) else {
            return Err(match self.state {
                ChannelState::Closed if self.close_reason == Some(CloseReason::Lost) => {
                    ProtocolError::ChannelLost
                }
                ChannelState::Closed => ProtocolError::ChannelClosed,
                _ => ProtocolError::Custom(constants::ERR_CHANNEL_NOT_ESTABLISHED.into()),
            });
        };
        self.queue(active, PeerDatagram::new(self.token, DatagramBody::Data(payload)));
        Ok(())
    }

    /// Close locally; the peer is told when an endpoint is known. Closing a
    /// closed session does nothing.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        if let Some(active) = self.active {
            self.queue(active, PeerDatagram::new(self.token, DatagramBody::Close));
        }
        self.finish(CloseReason::ClosedLocally);
    }

    /// Close for a reason decided outside the state machine.
    pub fn abort(&mut self, reason: CloseReason) {
        if self.state != ChannelState::Closed {
            self.finish(reason);
        }
    }

    fn handle_ping(&mut self, from: SocketAddr, nonce: u32, now: Instant) {
        match self.state {
            ChannelState::Idle | ChannelState::AwaitingNatServerReply => {
                self.send_pong(from, nonce);
                // Pinged again once punching starts
                self.add_candidate(from);
            }
            ChannelState::Handshaking(_) => {
                self.send_pong(from, nonce);
                if self.add_candidate(from) {
                    self.send_ping(from, now);
                }
            }
            ChannelState::Established | ChannelState::Degraded => {
                if self.active == Some(from) {
                    self.send_pong(from, nonce);
                    self.on_traffic_from_active(now);
                    return;
                }
                self.challenge(from, now);
            }
            ChannelState::Closed => {}
        }
    }

    /// Ping an endpoint that claims to be the peer. It becomes active only
    /// if the matching Pong comes back from it.
    fn challenge(&mut self, from: SocketAddr, now: Instant) {
        self.expire_challenges(now);
        if !self.rehandshakes.contains_key(&from)
            && self.rehandshakes.len() >= MAX_REHANDSHAKE_ENDPOINTS
        {
            trace!(token = self.token, %from, "too many endpoints re-handshaking, ignoring ping");
            return;
        }
        let entry = self.rehandshakes.entry(from).or_insert(Rehandshake {
            pings: 0,
            last_sent: now,
        });
        if entry.pings >= self.config.max_rehandshake_attempts {
            return;
        }
        entry.pings += 1;
        entry.last_sent = now;
        debug!(token = self.token, %from, attempt = entry.pings, "re-handshaking at new endpoint");
        self.send_ping(from, now);
    }

    /// Forget challenges older than one RTO along with their nonces.
    fn expire_challenges(&mut self, now: Instant) {
        let window = self.rtt.rto();
        self.outstanding
            .retain(|_, ping| now.saturating_duration_since(ping.sent_at) < window);
        self.rehandshakes
            .retain(|_, attempt| now.saturating_duration_since(attempt.last_sent) < window);
    }

    fn handle_pong(&mut self, from: SocketAddr, nonce: u32, now: Instant) -> bool {
        let Some(ping) = self.outstanding.get(&nonce).copied() else {
            trace!(%from, nonce, "pong for unknown nonce");
            return false;
        };
        if ping.endpoint != from {
            trace!(%from, expected = %ping.endpoint, "pong from wrong endpoint");
            return false;
        }
        self.outstanding.remove(&nonce);
        let sample = now.saturating_duration_since(ping.sent_at);

        match self.state {
            ChannelState::Handshaking(_) => {
                self.establish(from, sample, now);
                true
            }
            ChannelState::Established | ChannelState::Degraded => {
                self.rtt.update(sample);
                if let Some(previous) = self.active.filter(|active| *active != from) {
                    debug!(token = self.token, %previous, current = %from, "active endpoint moved");
                    self.active = Some(from);
                    self.rehandshakes.remove(&from);
                    self.events.push_back(PeerEvent::EndpointChanged { from: previous, to: from });
                }
                self.on_traffic_from_active(now);
                true
            }
            _ => false,
        }
    }

    fn handle_channel_traffic(&mut self, from: SocketAddr, body: DatagramBody, now: Instant) {
        match body {
            DatagramBody::KeepAlive { seq } => {
                self.queue(from, PeerDatagram::new(self.token, DatagramBody::KeepAliveAck { seq }));
                self.on_traffic_from_active(now);
            }
            DatagramBody::KeepAliveAck { seq } => {
                if self.keepalive.ack_deadline.is_some() && seq == self.keepalive.seq {
                    if let Some(sent_at) = self.keepalive.sent_at {
                        self.rtt.update(now.saturating_duration_since(sent_at));
                    }
                }
                self.on_traffic_from_active(now);
            }
            DatagramBody::Data(payload) => {
                self.on_traffic_from_active(now);
                self.events.push_back(PeerEvent::Data(payload));
            }
            DatagramBody::Close => {
                debug!(token = self.token, %from, "peer closed channel");
                self.finish(CloseReason::ClosedByPeer);
            }
            DatagramBody::Ping { .. } | DatagramBody::Pong { .. } => {}
        }
    }

    fn establish(&mut self, endpoint: SocketAddr, sample: Duration, now: Instant) {
        self.rtt.update(sample);
        self.state = ChannelState::Established;
        self.active = Some(endpoint);
        self.round_deadline = None;
        self.outstanding.clear();
        self.keepalive = Keepalive {
            next_send: Some(now + self.config.keepalive_interval),
            ..Keepalive::default()
        };
        debug!(token = self.token, %endpoint, rtt_ms = sample.as_millis() as u64, "channel established");
        self.events.push_back(PeerEvent::Established { endpoint, rtt: sample });
    }

    fn on_traffic_from_active(&mut self, now: Instant) {
        self.keepalive.misses = 0;
        self.keepalive.ack_deadline = None;
        self.keepalive.sent_at = None;
        self.keepalive.next_send = Some(now + self.config.keepalive_interval);
        if self.state == ChannelState::Degraded {
            self.state = ChannelState::Established;
            self.events.push_back(PeerEvent::Recovered);
        }
    }

    fn on_keepalive_missed(&mut self, now: Instant) {
        self.keepalive.misses += 1;
        self.rtt.on_timeout();
        let misses = self.keepalive.misses;
        trace!(token = self.token, misses, rto_ms = self.rtt.rto().as_millis() as u64, "keepalive missed");

        if misses >= self.config.lost_after {
            self.finish(CloseReason::Lost);
            return;
        }
        if misses >= self.config.degrade_after && self.state == ChannelState::Established {
            debug!(token = self.token, misses, "channel degraded");
            self.state = ChannelState::Degraded;
            self.events.push_back(PeerEvent::Degraded);
        }
        self.send_keepalive(now);
    }

    fn send_keepalive(&mut self, now: Instant) {
        let Some(active) = self.active else { return };
        self.keepalive.seq = self.keepalive.seq.wrapping_add(1);
        self.keepalive.sent_at = Some(now);
        self.keepalive.ack_deadline = Some(now + self.rtt.rto());
        let seq = self.keepalive.seq;
        self.queue(active, PeerDatagram::new(self.token, DatagramBody::KeepAlive { seq }));
    }

    fn send_round(&mut self, now: Instant) {
        self.rounds_sent += 1;
        self.round_deadline = Some(now + self.config.punch_attempt_timeout);
        let candidates = self.candidates.clone();
        for candidate in candidates {
            self.send_ping(candidate, now);
        }
    }

    fn send_ping(&mut self, endpoint: SocketAddr, now: Instant) {
        let nonce = loop {
            let nonce: u32 = rand::random();
            if !self.outstanding.contains_key(&nonce) {
                break nonce;
            }
        };
        self.outstanding.insert(nonce, OutstandingPing { endpoint, sent_at: now });
        self.queue(endpoint, PeerDatagram::ping(self.token, &self.salt, nonce));
    }

    fn add_candidate(&mut self, endpoint: SocketAddr) -> bool {
        if self.candidates.len() >= MAX_CANDIDATES || self.candidates.contains(&endpoint) {
            return false;
        }
        self.candidates.push(endpoint);
        true
    }

    fn send_pong(&mut self, to: SocketAddr, nonce: u32) {
        self.queue(to, PeerDatagram::pong(self.token, &self.salt, nonce));
    }

    fn queue(&mut self, destination: SocketAddr, datagram: PeerDatagram) {
        self.transmits.push_back(Transmit {
            destination,
            payload: datagram.to_bytes(),
        });
    }

    fn finish(&mut self, reason: CloseReason) {
        self.state = ChannelState::Closed;
        self.close_reason = Some(reason);
        self.round_deadline = None;
        self.outstanding.clear();
        self.rehandshakes.clear();
        self.keepalive = Keepalive::default();
        self.events.push_back(PeerEvent::Closed(reason));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TOKEN: u32 = 0xA11CE;
    const SALT: OpaqueId = OpaqueId([7; 16]);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn config() -> NatConfig {
        NatConfig::default()
    }

    /// Deliver everything `from_session` wants sent to `to_addr` into
    /// `to_session`, as if it arrived from `from_addr`.
    fn deliver(
        from_session: &mut PeerSession,
        from_addr: SocketAddr,
        to_session: &mut PeerSession,
        to_addr: SocketAddr,
        now: Instant,
    ) -> usize {
        let mut delivered = 0;
        while let Some(transmit) = from_session.poll_transmit() {
            if transmit.destination == to_addr {
                let datagram = PeerDatagram::decode(&transmit.payload).unwrap();
                to_session.handle_datagram(from_addr, datagram, now);
                delivered += 1;
            }
        }
        delivered
    }

    fn pump(a: &mut PeerSession, a_addr: SocketAddr, b: &mut PeerSession, b_addr: SocketAddr, now: Instant) {
        loop {
            let moved = deliver(a, a_addr, b, b_addr, now) + deliver(b, b_addr, a, a_addr, now);
            if moved == 0 {
                break;
            }
        }
    }

    fn established_pair(now: Instant) -> (PeerSession, PeerSession) {
        let config = config();
        let mut a = PeerSession::new(TOKEN, SALT, &config);
        let mut b = PeerSession::new(TOKEN, SALT, &config);
        a.start_handshake(NatRole::Originator, vec![addr(2000)], now);
        b.start_handshake(NatRole::Recipient, vec![addr(1000)], now);
        pump(&mut a, addr(1000), &mut b, addr(2000), now);
        assert_eq!(a.state(), ChannelState::Established);
        assert_eq!(b.state(), ChannelState::Established);
        while a.poll_event().is_some() {}
        while b.poll_event().is_some() {}
        (a, b)
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        let now = Instant::now();
        let (a, b) = established_pair(now);
        assert_eq!(a.active_endpoint(), Some(addr(2000)));
        assert_eq!(b.active_endpoint(), Some(addr(1000)));
        assert!(a.rtt().srtt().is_some());
    }

    #[test]
    fn test_recipient_learns_unlisted_endpoint() {
        let now = Instant::now();
        let config = config();
        let mut a = PeerSession::new(TOKEN, SALT, &config);
        let mut b = PeerSession::new(TOKEN, SALT, &config);
        a.start_handshake(NatRole::Originator, vec![addr(2000)], now);
        // b has a stale hint for a
        b.start_handshake(NatRole::Recipient, vec![addr(1999)], now);
        while b.poll_transmit().is_some() {}

        pump(&mut a, addr(1000), &mut b, addr(2000), now);
        assert_eq!(b.state(), ChannelState::Established);
        assert_eq!(b.active_endpoint(), Some(addr(1000)));
        assert!(b.candidates().contains(&addr(1000)));
    }

    #[test]
    fn test_exhausted_rounds_close_unreachable() {
        let config = config();
        let start = Instant::now();
        let mut session = PeerSession::new(TOKEN, SALT, &config);
        session.await_mediator();
        assert_eq!(session.state(), ChannelState::AwaitingNatServerReply);
        session.start_handshake(NatRole::Originator, vec![addr(2000), addr(2001)], start);

        let mut pings = 0;
        while let Some(deadline) = session.poll_timeout() {
            while session.poll_transmit().is_some() {
                pings += 1;
            }
            session.handle_timeout(deadline);
        }

        assert_eq!(session.state(), ChannelState::Closed);
        assert_eq!(session.poll_event(), Some(PeerEvent::Closed(CloseReason::Unreachable)));
        assert_eq!(pings, 2 * config.punch_attempts as usize);
    }

    #[test]
    fn test_forged_or_misrouted_pong_is_rejected() {
        let now = Instant::now();
        let config = config();
        let mut session = PeerSession::new(TOKEN, SALT, &config);
        session.start_handshake(NatRole::Originator, vec![addr(2000)], now);
        let ping = PeerDatagram::decode(&session.poll_transmit().unwrap().payload).unwrap();
        let DatagramBody::Ping { nonce, .. } = ping.body else { panic!("expected ping") };

        let forged = PeerDatagram::pong(TOKEN, &OpaqueId([8; 16]), nonce);
        assert!(!session.handle_datagram(addr(2000), forged, now));

        let misrouted = PeerDatagram::pong(TOKEN, &SALT, nonce);
        assert!(!session.handle_datagram(addr(3000), misrouted, now));

        let wrong_token = PeerDatagram::pong(TOKEN + 1, &SALT, nonce);
        assert!(!session.handle_datagram(addr(2000), wrong_token, now));

        assert!(matches!(session.state(), ChannelState::Handshaking(_)));

        let genuine = PeerDatagram::pong(TOKEN, &SALT, nonce);
        assert!(session.handle_datagram(addr(2000), genuine, now));
        assert_eq!(session.state(), ChannelState::Established);
    }

    #[test]
    fn test_missed_keepalives_degrade_then_lose() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        let config = config();

        let mut keepalives = 0;
        let mut degraded_at = None;
        for _ in 0..=config.lost_after {
            let Some(deadline) = a.poll_timeout() else { break };
            a.handle_timeout(deadline);
            while a.poll_transmit().is_some() {
                keepalives += 1;
            }
            if degraded_at.is_none() && a.state() == ChannelState::Degraded {
                degraded_at = Some(a.consecutive_misses());
            }
        }

        assert_eq!(degraded_at, Some(config.degrade_after));
        assert_eq!(a.state(), ChannelState::Closed);
        assert_eq!(a.poll_event(), Some(PeerEvent::Degraded));
        assert_eq!(a.poll_event(), Some(PeerEvent::Closed(CloseReason::Lost)));
        // first keepalive plus one retransmission per miss before the loss
        assert_eq!(keepalives, config.lost_after as usize);
        assert_eq!(a.close_reason(), Some(CloseReason::Lost));
        assert!(matches!(
            a.send_data(Bytes::from_static(b"late")),
            Err(ProtocolError::ChannelLost)
        ));
    }

    #[test]
    fn test_traffic_recovers_degraded_channel() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        let mut at = now;
        while a.state() != ChannelState::Degraded {
            at = a.poll_timeout().unwrap();
            a.handle_timeout(at);
        }
        while a.poll_transmit().is_some() {}
        assert_eq!(a.poll_event(), Some(PeerEvent::Degraded));

        b.send_data(Bytes::from_static(b"still here")).unwrap();
        deliver(&mut b, addr(2000), &mut a, addr(1000), at);

        assert_eq!(a.state(), ChannelState::Established);
        assert_eq!(a.consecutive_misses(), 0);
        assert_eq!(a.poll_event(), Some(PeerEvent::Recovered));
        assert_eq!(a.poll_event(), Some(PeerEvent::Data(Bytes::from_static(b"still here"))));
    }

    #[test]
    fn test_new_endpoint_needs_rehandshake() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        let rebound = addr(2500);

        // Data from the new endpoint alone is ignored
        let data = PeerDatagram::new(TOKEN, DatagramBody::Data(Bytes::from_static(b"hijack")));
        assert!(!a.handle_datagram(rebound, data, now));
        assert_eq!(a.active_endpoint(), Some(addr(2000)));
        assert!(a.poll_event().is_none());

        // An authenticated ping triggers a challenge, not a switch
        let ping = PeerDatagram::ping(TOKEN, &SALT, 99);
        assert!(a.handle_datagram(rebound, ping, now));
        assert_eq!(a.active_endpoint(), Some(addr(2000)));

        // b answers a's challenge from the rebound port
        pump(&mut a, addr(1000), &mut b, rebound, now);
        assert_eq!(a.active_endpoint(), Some(rebound));
        assert_eq!(
            a.poll_event(),
            Some(PeerEvent::EndpointChanged {
                from: addr(2000),
                to: rebound
            })
        );
    }

    #[test]
    fn test_rehandshake_pings_are_bounded() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        let config = config();
        let stranger = addr(4000);

        let mut challenges = 0;
        for nonce in 0..10 {
            a.handle_datagram(stranger, PeerDatagram::ping(TOKEN, &SALT, nonce), now);
            while let Some(transmit) = a.poll_transmit() {
                let datagram = PeerDatagram::decode(&transmit.payload).unwrap();
                if matches!(datagram.body, DatagramBody::Ping { .. }) {
                    challenges += 1;
                }
            }
        }
        assert_eq!(challenges, config.max_rehandshake_attempts);
    }

    #[test]
    fn test_replayed_ping_from_many_sources_stays_bounded() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        let config = config();
        let captured = PeerDatagram::ping(TOKEN, &SALT, 4242);

        let mut pongs = 0;
        let mut challenges = 0;
        for port in 10_000..30_000u16 {
            a.handle_datagram(addr(port), captured.clone(), now);
            while let Some(transmit) = a.poll_transmit() {
                match PeerDatagram::decode(&transmit.payload).unwrap().body {
                    DatagramBody::Pong { .. } => pongs += 1,
                    DatagramBody::Ping { .. } => challenges += 1,
                    _ => {}
                }
            }
        }

        assert_eq!(pongs, 0);
        assert_eq!(challenges, MAX_REHANDSHAKE_ENDPOINTS);
        assert_eq!(a.rehandshakes.len(), MAX_REHANDSHAKE_ENDPOINTS);
        assert!(
            a.outstanding.len()
                <= MAX_REHANDSHAKE_ENDPOINTS * config.max_rehandshake_attempts as usize
        );
        assert_eq!(a.active_endpoint(), Some(addr(2000)));
    }

    #[test]
    fn test_stale_challenges_expire_after_rto() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        for port in 0..MAX_REHANDSHAKE_ENDPOINTS as u16 {
            a.handle_datagram(addr(5000 + port), PeerDatagram::ping(TOKEN, &SALT, 1), now);
        }
        while a.poll_transmit().is_some() {}
        assert_eq!(a.outstanding.len(), MAX_REHANDSHAKE_ENDPOINTS);

        // Table full: a fresh endpoint is ignored until the window passes
        a.handle_datagram(addr(6000), PeerDatagram::ping(TOKEN, &SALT, 2), now);
        assert!(a.poll_transmit().is_none());

        let later = now + a.rtt().rto() + Duration::from_millis(1);
        a.handle_datagram(addr(6000), PeerDatagram::ping(TOKEN, &SALT, 3), later);
        let transmit = a.poll_transmit().unwrap();
        assert_eq!(transmit.destination, addr(6000));
        assert_eq!(a.rehandshakes.len(), 1);
        assert_eq!(a.outstanding.len(), 1);
    }

    #[test]
    fn test_learned_candidates_are_capped() {
        let now = Instant::now();
        let mut session = PeerSession::new(TOKEN, SALT, &config());
        session.start_handshake(NatRole::Recipient, vec![addr(2000)], now);
        for port in 10_000..11_000u16 {
            session.handle_datagram(addr(port), PeerDatagram::ping(TOKEN, &SALT, 5), now);
        }
        assert_eq!(session.candidates().len(), MAX_CANDIDATES);
    }

    #[test]
    fn test_close_is_idempotent() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);

        a.close();
        a.close();
        assert_eq!(a.poll_event(), Some(PeerEvent::Closed(CloseReason::ClosedLocally)));
        assert!(a.poll_event().is_none());
        assert!(matches!(a.send_data(Bytes::from_static(b"x")), Err(ProtocolError::ChannelClosed)));

        deliver(&mut a, addr(1000), &mut b, addr(2000), now);
        assert_eq!(b.state(), ChannelState::Closed);
        assert_eq!(b.poll_event(), Some(PeerEvent::Closed(CloseReason::ClosedByPeer)));
    }

    #[test]
    fn test_send_before_established() {
        let mut session = PeerSession::new(TOKEN, SALT, &config());
        assert!(matches!(
            session.send_data(Bytes::from_static(b"early")),
            Err(ProtocolError::Custom(_))
        ));
        let oversized = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            session.send_data(oversized),
            Err(ProtocolError::Encode(EncodeError::PacketTooLarge { .. }))
        ));
    }
}
