use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::config::ServerConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::{Frame, Packet};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;

pub type ServerFramed = Framed<TcpStream, PacketCodec>;

/// Reliable stream to the messaging server.
///
/// Used directly for the login exchange; the session loop then takes the
/// framed stream apart with [`ServerConnection::into_framed`].
pub struct ServerConnection {
    framed: ServerFramed,
    peer_addr: SocketAddr,
    send_timeout: Duration,
    recv_timeout: Duration,
    last_activity: Instant,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("peer_addr", &self.peer_addr)
            .field("idle", &self.last_activity.elapsed())
            .finish()
    }
}

impl ServerConnection {
    #[instrument(skip(config), fields(address = %config.address))]
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let stream = with_timeout_error(
            async { Ok(TcpStream::connect(config.address.as_str()).await?) },
            config.connect_timeout,
        )
        .await?;
        stream.set_nodelay(true)?;
        let connection = Self::from_stream(stream, config.max_packet_size)?
            .with_timeouts(config.connect_timeout, config.login_timeout);
        debug!(peer = %connection.peer_addr, "Connected to server");
        Ok(connection)
    }

    pub fn from_stream(stream: TcpStream, max_packet_size: usize) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            framed: Framed::new(stream, PacketCodec::new(max_packet_size)),
            peer_addr,
            send_timeout: crate::utils::timeout::CONNECT_TIMEOUT,
            recv_timeout: crate::utils::timeout::LOGIN_TIMEOUT,
            last_activity: Instant::now(),
        })
    }

    /// Set custom timeout durations
    pub fn with_timeouts(mut self, send_timeout: Duration, recv_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self.recv_timeout = recv_timeout;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn time_since_last_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Write bytes that bypass framing. Only valid before the first packet.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.framed.get_mut();
        with_timeout_error(
            async {
                stream.write_all(bytes).await?;
                stream.flush().await?;
                Ok(())
            },
            self.send_timeout,
        )
        .await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    #[instrument(skip(self, packet), fields(type_id = packet.type_id), level = "debug")]
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        with_timeout_error(self.framed.send(packet), self.send_timeout).await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Next frame, or `TransportLost` when the server hung up.
    pub async fn recv(&mut self) -> Result<Frame> {
        let timeout = self.recv_timeout;
        let framed = &mut self.framed;
        let next = with_timeout_error(async { Ok(framed.next().await) }, timeout).await?;
        match next {
            Some(frame) => {
                self.last_activity = Instant::now();
                frame
            }
            None => Err(ProtocolError::TransportLost(
                constants::ERR_STREAM_ENDED.into(),
            )),
        }
    }

    pub fn into_framed(self) -> ServerFramed {
        self.framed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::handshake::HANDSHAKE_TOKEN;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_token_then_framed_packet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            address: listener.local_addr().unwrap().to_string(),
            ..ServerConfig::default()
        };

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut token = [0u8; 4];
            socket.read_exact(&mut token).await.unwrap();
            let mut framed = Framed::new(socket, PacketCodec::default());
            let frame = framed.next().await.unwrap().unwrap();
            framed.send(Packet::new(0x0099)).await.unwrap();
            (token, frame)
        });

        let mut connection = ServerConnection::connect(&config).await.unwrap();
        connection.send_raw(&HANDSHAKE_TOKEN).await.unwrap();
        connection.send(Packet::new(0x0042)).await.unwrap();
        let reply = connection.recv().await.unwrap();

        let (token, frame) = server.await.unwrap();
        assert_eq!(token, HANDSHAKE_TOKEN);
        assert!(matches!(frame, Frame::Packet(p) if p.type_id == 0x0042));
        assert!(matches!(reply, Frame::Packet(p) if p.type_id == 0x0099));
    }

    #[tokio::test]
    async fn test_hangup_is_transport_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            address: listener.local_addr().unwrap().to_string(),
            ..ServerConfig::default()
        };
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut connection = ServerConnection::connect(&config).await.unwrap();
        assert!(matches!(
            connection.recv().await,
            Err(ProtocolError::TransportLost(_))
        ));
    }
}
