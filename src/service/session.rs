//! Session/connection manager.
//!
//! One driver task per client. While logged out it waits for `Login`; once
//! logged in it owns the server connection and the pending peer offers until
//! the session ends, then goes back to waiting. The NAT engine is bound at
//! the first login and lives as long as the driver, so its assessment is
//! measured once per network rather than once per login.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, instrument, trace, warn, Instrument};

use crate::config::NetworkConfig;
use crate::core::attribute::SessionId;
use crate::core::packet::{Frame, Packet};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{
    AuthFailureReason, AuthStep, ClientAuth, Credentials, Session,
};
use crate::protocol::message::{Message, PeerOffer};
use crate::service::events::{Command, Event};
use crate::transport::nat::{
    ChannelNotice, ChannelNoticeKind, ChannelRequest, NatEngine, NatRole, PeerChannel,
};
use crate::transport::tcp::{ServerConnection, ServerFramed};
use crate::utils::timeout::{with_timeout_error, WRITER_DRAIN_TIMEOUT};
use crate::utils::Metrics;

type PendingOffers = Arc<Mutex<HashMap<u32, oneshot::Sender<PeerOffer>>>>;

/// Application side of a running client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    metrics: Arc<Metrics>,
}

impl ClientHandle {
    pub async fn login(&self, credentials: Credentials) -> Result<()> {
        self.command(Command::Login(credentials)).await
    }

    pub async fn send_message(&self, target: u32, body: impl Into<String>) -> Result<()> {
        self.command(Command::SendMessage {
            target,
            body: body.into(),
        })
        .await
    }

    pub async fn open_peer_channel(&self, peer: SessionId) -> Result<()> {
        self.command(Command::OpenPeerChannel(peer)).await
    }

    /// End the session and stop the client. Closing twice is fine.
    pub async fn close(&self) -> Result<()> {
        if self.commands.send(Command::CloseSession).await.is_err() {
            trace!("{}", constants::ERR_SESSION_CLOSED);
        }
        Ok(())
    }

    /// Resolves once the client has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Start a client. Must be called from inside a Tokio runtime.
///
/// The configuration is validated first; nothing is spawned when it fails.
pub fn spawn_client(
    config: NetworkConfig,
    dispatcher: Dispatcher,
) -> Result<(ClientHandle, mpsc::Receiver<Event>)> {
    config.validate_strict()?;
    let metrics = Arc::new(Metrics::new());
    let (command_tx, command_rx) = mpsc::channel(config.client.command_buffer.max(1));
    let (event_tx, event_rx) = mpsc::channel(config.client.event_buffer.max(1));

    let driver = Driver {
        config,
        dispatcher,
        commands: command_rx,
        events: event_tx,
        metrics: Arc::clone(&metrics),
        nat: None,
        notices: None,
    };
    tokio::spawn(driver.run());

    Ok((
        ClientHandle {
            commands: command_tx,
            metrics,
        },
        event_rx,
    ))
}

enum SessionEnd {
    Closed,
    Lost(String),
    Invalidated,
}

/// State that lives exactly as long as one logged-in session.
struct SessionContext {
    session: Session,
    outbound: mpsc::Sender<Packet>,
    nat: Option<NatEngine>,
    pending_offers: PendingOffers,
}

struct Driver {
    config: NetworkConfig,
    dispatcher: Dispatcher,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<Event>,
    metrics: Arc<Metrics>,
    /// Bound once per client and kept across reconnects
    nat: Option<NatEngine>,
    notices: Option<mpsc::UnboundedReceiver<ChannelNotice>>,
}

impl Driver {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Login(credentials) => match self.login(credentials).await {
                    Ok((session, connection)) => {
                        self.metrics.login_result(true);
                        self.emit(Event::LoggedIn(session.clone())).await;
                        match self.run_session(session, connection).await {
                            SessionEnd::Closed => break,
                            SessionEnd::Lost(reason) => {
                                warn!(%reason, "Transport lost");
                                self.emit(Event::TransportLost { reason }).await;
                            }
                            SessionEnd::Invalidated => {}
                        }
                    }
                    Err(ProtocolError::AuthFailure(reason)) => {
                        self.metrics.login_result(false);
                        self.emit(Event::LoginFailed(reason)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not reach server");
                        self.emit(Event::TransportLost {
                            reason: e.to_string(),
                        })
                        .await;
                    }
                },
                Command::CloseSession => break,
                other => warn!(command = ?other, "Not logged in, ignoring command"),
            }
        }

        self.metrics.log_metrics();
        self.emit(Event::Closed).await;
        debug!("Client stopped");
    }

    /// Bind the NAT engine on first use. A failed bind is retried at the
    /// next login; until then peer channels are unavailable.
    async fn ensure_nat(&mut self) {
        if !self.config.nat.enabled || self.nat.is_some() {
            return;
        }
        match NatEngine::bind(self.config.nat.clone(), Arc::clone(&self.metrics)).await {
            Ok((engine, notices)) => {
                self.nat = Some(engine);
                self.notices = Some(notices);
            }
            Err(e) => warn!(error = %e, "NAT engine unavailable, peer channels disabled"),
        }
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            trace!("Event receiver dropped");
        }
    }

    #[instrument(skip(self, credentials), fields(user = %credentials.username(), server = %self.config.server.address))]
    async fn login(&self, credentials: Credentials) -> Result<(Session, ServerConnection)> {
        let identity = self.config.client.identity()?;
        let mut connection = ServerConnection::connect(&self.config.server).await?;
        let mut auth = ClientAuth::new(identity, credentials);

        let outcome = with_timeout_error(
            self.authenticate(&mut connection, &mut auth),
            self.config.server.login_timeout,
        )
        .await;
        match outcome {
            Ok(session) => {
                info!(user_id = session.user_id, session_id = %session.session_id, "Logged in");
                Ok((session, connection))
            }
            Err(ProtocolError::Timeout) => {
                auth.fail(AuthFailureReason::TimedOut);
                Err(ProtocolError::AuthFailure(AuthFailureReason::TimedOut))
            }
            Err(e) => Err(e),
        }
    }

    async fn authenticate(
        &self,
        connection: &mut ServerConnection,
        auth: &mut ClientAuth,
    ) -> Result<Session> {
        let token = auth.on_connected()?;
        connection.send_raw(&token).await?;
        for packet in auth.on_token_sent()? {
            self.metrics.packet_sent(packet.wire_len() as u64);
            connection.send(packet).await?;
        }

        loop {
            let frame = match connection.recv().await {
                Ok(frame) => frame,
                Err(ProtocolError::Framing(e)) => {
                    self.metrics.framing_error();
                    let reason = AuthFailureReason::ProtocolViolation(e.to_string());
                    auth.fail(reason.clone());
                    return Err(ProtocolError::AuthFailure(reason));
                }
                Err(e) => return Err(e),
            };

            let packet = match frame {
                Frame::Packet(packet) => packet,
                Frame::Malformed { type_id, error, .. } => {
                    self.metrics.malformed_packet();
                    let reason = AuthFailureReason::ProtocolViolation(format!(
                        "{error} (type {type_id:#06x})"
                    ));
                    auth.fail(reason.clone());
                    return Err(ProtocolError::AuthFailure(reason));
                }
            };
            self.metrics.packet_received(packet.wire_len() as u64);

            match auth.on_packet(&packet)? {
                AuthStep::Send(reply) => {
                    self.metrics.packet_sent(reply.wire_len() as u64);
                    connection.send(reply).await?;
                }
                AuthStep::Authenticated(session) => return Ok(session),
                AuthStep::Failed(reason) => return Err(ProtocolError::AuthFailure(reason)),
            }
        }
    }

    #[instrument(skip_all, fields(session_id = %session.session_id))]
    async fn run_session(&mut self, session: Session, connection: ServerConnection) -> SessionEnd {
        let (mut sink, mut stream): (SplitSink<ServerFramed, Packet>, _) =
            connection.into_framed().split();
        let (outbound, mut outbound_rx) =
            mpsc::channel::<Packet>(self.config.server.outbound_queue_capacity.max(1));

        // Single writer keeps outbound packets in queue order
        let writer_metrics = Arc::clone(&self.metrics);
        let (drain_tx, mut drain_rx) = oneshot::channel::<()>();
        let mut writer: JoinHandle<Result<()>> = tokio::spawn(async move {
            let mut draining = false;
            loop {
                let packet = tokio::select! {
                    packet = outbound_rx.recv() => packet,
                    _ = &mut drain_rx, if !draining => {
                        // Refuse new packets, flush what is already queued
                        draining = true;
                        outbound_rx.close();
                        continue;
                    }
                };
                let Some(packet) = packet else { break };
                let len = packet.wire_len() as u64;
                sink.send(packet).await?;
                writer_metrics.packet_sent(len);
            }
            sink.close().await?;
            Ok(())
        });

        self.ensure_nat().await;
        let ctx = SessionContext {
            session,
            outbound,
            nat: self.nat.clone(),
            pending_offers: Arc::new(Mutex::new(HashMap::new())),
        };

        let server = &self.config.server;
        let idle_limit = server.keepalive_interval * server.keepalive_miss_threshold.max(1);
        let mut last_inbound = Instant::now();

        let end = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Packet(packet))) => {
                        last_inbound = Instant::now();
                        self.metrics.packet_received(packet.wire_len() as u64);
                        if let Some(end) = self.handle_packet(packet, &ctx).await {
                            break end;
                        }
                    }
                    Some(Ok(Frame::Malformed { type_id, size, error })) => {
                        last_inbound = Instant::now();
                        self.metrics.packet_received(size as u64);
                        self.metrics.malformed_packet();
                        warn!(type_id, size, error = %error, "Dropping malformed packet");
                        self.emit(Event::ProtocolAnomaly { type_id, error }).await;
                    }
                    Some(Err(e)) => {
                        if matches!(e, ProtocolError::Framing(_)) {
                            self.metrics.framing_error();
                        }
                        break SessionEnd::Lost(e.to_string());
                    }
                    None => break SessionEnd::Lost(constants::ERR_STREAM_ENDED.into()),
                },
                command = self.commands.recv() => match command {
                    Some(Command::SendMessage { target, body }) => {
                        let packet = Message::Chat { peer: target, body }.to_packet();
                        if ctx.outbound.send(packet).await.is_err() {
                            break SessionEnd::Lost(constants::ERR_OUTBOUND_QUEUE_CLOSED.into());
                        }
                    }
                    Some(Command::OpenPeerChannel(peer)) => self.open_peer_channel(peer, &ctx).await,
                    Some(Command::Login(_)) => warn!("Already logged in, ignoring login"),
                    Some(Command::CloseSession) | None => break SessionEnd::Closed,
                },
                Some(notice) = next_notice(&mut self.notices) => self.on_channel_notice(notice).await,
                result = &mut writer => {
                    let reason = match result {
                        Ok(Ok(())) => constants::ERR_OUTBOUND_QUEUE_CLOSED.to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    break SessionEnd::Lost(reason);
                }
                _ = sleep_until(last_inbound + idle_limit) => {
                    break SessionEnd::Lost(constants::ERR_KEEPALIVE_EXPIRED.into());
                }
            }
        };

        if matches!(end, SessionEnd::Closed) {
            let _ = drain_tx.send(());
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                debug!("Outbound queue not drained in time, dropping the rest");
            }
        }
        writer.abort();
        debug!("Session ended");
        end
    }

    async fn handle_packet(&self, packet: Packet, ctx: &SessionContext) -> Option<SessionEnd> {
        let message = match Message::from_packet(&packet) {
            Ok(message) => message,
            Err(error) => {
                self.metrics.malformed_packet();
                warn!(type_id = packet.type_id, error = %error, "Dropping undecodable packet");
                self.emit(Event::ProtocolAnomaly {
                    type_id: packet.type_id,
                    error,
                })
                .await;
                return None;
            }
        };

        match message {
            Message::KeepAlive { value } => {
                trace!(value, "Echoing keepalive");
                self.metrics.keepalive_echoed();
                let echo = Message::KeepAlive { value }.to_packet();
                if ctx.outbound.send(echo).await.is_err() {
                    return Some(SessionEnd::Lost(constants::ERR_OUTBOUND_QUEUE_CLOSED.into()));
                }
            }
            Message::DuplicateLogin => {
                warn!("Session invalidated by a login elsewhere");
                self.emit(Event::SessionInvalidated).await;
                return Some(SessionEnd::Invalidated);
            }
            Message::Chat { peer, body } => {
                self.emit(Event::MessageReceived { from: peer, body }).await;
            }
            Message::Presence {
                user_id,
                status,
                text,
            } => {
                self.emit(Event::PresenceChanged {
                    user_id,
                    status,
                    text,
                })
                .await;
            }
            Message::PeerConnectRequest(offer) => self.accept_peer_channel(offer, ctx),
            Message::PeerConnectAccept(offer) => {
                let waiter = ctx
                    .pending_offers
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&offer.token));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(offer);
                    }
                    None => debug!(token = offer.token, "Accept for unknown peer offer"),
                }
            }
            _ => match self.dispatcher.dispatch(&packet) {
                Ok(Some(reply)) => {
                    if ctx.outbound.send(reply).await.is_err() {
                        return Some(SessionEnd::Lost(
                            constants::ERR_OUTBOUND_QUEUE_CLOSED.into(),
                        ));
                    }
                }
                Ok(None) => {}
                Err(ProtocolError::UnexpectedMessage(type_id)) => {
                    trace!(type_id, "No handler registered");
                }
                Err(e) => warn!(type_id = packet.type_id, error = %e, "Handler failed"),
            },
        }
        None
    }

    async fn on_channel_notice(&self, notice: ChannelNotice) {
        let peer = notice.peer;
        match notice.kind {
            ChannelNoticeKind::Degraded => self.emit(Event::PeerChannelDegraded { peer }).await,
            ChannelNoticeKind::Recovered => self.emit(Event::PeerChannelRecovered { peer }).await,
            ChannelNoticeKind::Lost => self.emit(Event::PeerChannelLost { peer }).await,
            ChannelNoticeKind::Closed => debug!(%peer, token = notice.token, "Peer channel closed"),
        }
    }

    async fn open_peer_channel(&self, peer: SessionId, ctx: &SessionContext) {
        let Some(engine) = ctx.nat.clone() else {
            self.emit(Event::PeerChannelUnavailable {
                peer,
                reason: "NAT traversal disabled".into(),
            })
            .await;
            return;
        };

        let own = ctx.session.session_id;
        let outbound = ctx.outbound.clone();
        let pending = Arc::clone(&ctx.pending_offers);
        let events = self.events.clone();
        let signal_timeout = self.config.nat.signal_timeout;

        tokio::spawn(
            async move {
                let event =
                    match originate(engine, own, peer, outbound, pending, signal_timeout).await {
                        Ok(channel) => Event::PeerChannelEstablished(channel),
                        Err(e) => {
                            debug!(error = %e, "Peer channel unavailable");
                            Event::PeerChannelUnavailable {
                                peer,
                                reason: e.to_string(),
                            }
                        }
                    };
                let _ = events.send(event).await;
            }
            .instrument(info_span!("open_peer_channel", %peer)),
        );
    }

    fn accept_peer_channel(&self, offer: PeerOffer, ctx: &SessionContext) {
        let Some(engine) = ctx.nat.clone() else {
            debug!(peer = %offer.session_id, "NAT traversal disabled, ignoring peer request");
            return;
        };

        let own = ctx.session.session_id;
        let outbound = ctx.outbound.clone();
        let events = self.events.clone();
        let peer = offer.session_id;

        tokio::spawn(
            async move {
                let (public, local) = engine.local_hints().await;
                let accept = PeerOffer {
                    session_id: offer.session_id,
                    token: offer.token,
                    salt: offer.salt,
                    public,
                    local,
                };
                if outbound
                    .send(Message::PeerConnectAccept(accept).to_packet())
                    .await
                    .is_err()
                {
                    return;
                }

                let request = ChannelRequest::from_offer(own, &offer, NatRole::Recipient);
                let event = match engine.request_peer_channel(request).await {
                    Ok(channel) => Event::PeerChannelEstablished(channel),
                    Err(e) => Event::PeerChannelUnavailable {
                        peer,
                        reason: e.to_string(),
                    },
                };
                let _ = events.send(event).await;
            }
            .instrument(info_span!("accept_peer_channel", %peer)),
        );
    }
}

/// Removes an offer from the pending table when the originator gives up.
struct PendingOffer {
    pending: PendingOffers,
    token: u32,
}

impl Drop for PendingOffer {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.token);
        }
    }
}

async fn originate(
    engine: NatEngine,
    own: SessionId,
    peer: SessionId,
    outbound: mpsc::Sender<Packet>,
    pending: PendingOffers,
    signal_timeout: Duration,
) -> Result<PeerChannel> {
    let offer = engine.create_offer(peer).await;
    let (tx, rx) = oneshot::channel();
    pending
        .lock()
        .map_err(|_| ProtocolError::Custom(constants::ERR_SESSION_CLOSED.into()))?
        .insert(offer.token, tx);
    let _pending = PendingOffer {
        pending,
        token: offer.token,
    };

    outbound
        .send(Message::PeerConnectRequest(offer.clone()).to_packet())
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)?;

    let accept = with_timeout_error(
        async { rx.await.map_err(|_| ProtocolError::ConnectionClosed) },
        signal_timeout,
    )
    .await?;
    if accept.salt != offer.salt {
        return Err(ProtocolError::HandshakeError(
            "peer accept carries a different salt".into(),
        ));
    }

    let request = ChannelRequest::from_offer(own, &accept, NatRole::Originator);
    engine.request_peer_channel(request).await
}

async fn next_notice(
    notices: &mut Option<mpsc::UnboundedReceiver<ChannelNotice>>,
) -> Option<ChannelNotice> {
    match notices {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
