//! Typed view over the packet types this client understands.
//!
//! Anything not listed here decodes to [`Message::Other`] and is left for the
//! dispatcher. Endpoints travel as two Int32 attributes: the IPv4 address as
//! its numeric value and the port.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::core::attribute::{AttributeValue, OpaqueId, SessionId};
use crate::core::packet::Packet;
use crate::error::DecodeError;

/// Packet type ids.
pub mod packet_type {
    pub const CLIENT_INFO: u16 = 0x0001;
    pub const CLIENT_VERSION: u16 = 0x0002;
    pub const LOGIN_CHALLENGE: u16 = 0x0003;
    pub const LOGIN_REQUEST: u16 = 0x0004;
    pub const LOGIN_SUCCESS: u16 = 0x0005;
    pub const LOGIN_FAILURE: u16 = 0x0006;
    pub const KEEP_ALIVE: u16 = 0x0010;
    pub const DUPLICATE_LOGIN: u16 = 0x0011;
    pub const CHAT_MESSAGE: u16 = 0x0020;
    pub const PRESENCE_UPDATE: u16 = 0x0030;
    pub const FRIEND_LIST: u16 = 0x0040;
    pub const ROOM_EVENT: u16 = 0x0050;
    pub const CLAN_EVENT: u16 = 0x0060;
    pub const PEER_CONNECT_REQUEST: u16 = 0x0070;
    pub const PEER_CONNECT_ACCEPT: u16 = 0x0071;
    pub const MEDIATION_PROBE: u16 = 0x0080;
    pub const MEDIATION_PROBE_REPLY: u16 = 0x0081;
    pub const MEDIATION_LOOKUP: u16 = 0x0082;
    pub const MEDIATION_LOOKUP_REPLY: u16 = 0x0083;
}

use packet_type::*;

/// Connection details one side offers the other through the server relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOffer {
    /// Target session on send, originating session on receive
    pub session_id: SessionId,
    /// Demultiplexing token for peer datagrams on this channel
    pub token: u32,
    /// Salt both sides use to prove ping/pong authenticity
    pub salt: OpaqueId,
    pub public: Option<SocketAddrV4>,
    pub local: Option<SocketAddrV4>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ClientInfo {
        skin: String,
        version: String,
        did: Option<OpaqueId>,
    },
    ClientVersion {
        version: u32,
        build: String,
    },
    LoginChallenge {
        salt: String,
    },
    LoginRequest {
        username: String,
        password_hash: String,
    },
    LoginSuccess {
        user_id: u32,
        session_id: SessionId,
        display_name: String,
        protocol_version: u32,
    },
    LoginFailure {
        reason: u32,
    },
    KeepAlive {
        value: u32,
    },
    DuplicateLogin,
    Chat {
        peer: u32,
        body: String,
    },
    Presence {
        user_id: u32,
        status: u32,
        text: Option<String>,
    },
    PeerConnectRequest(PeerOffer),
    PeerConnectAccept(PeerOffer),
    MediationProbe {
        request_id: u32,
        alternate: bool,
    },
    MediationProbeReply {
        request_id: u32,
        observed: SocketAddrV4,
    },
    MediationLookup {
        request_id: u32,
        own: SessionId,
        peer: SessionId,
        token: u32,
    },
    MediationLookupReply {
        request_id: u32,
        public: SocketAddrV4,
        local: Option<SocketAddrV4>,
        predicted_port: Option<u16>,
        port_delta: Option<i32>,
    },
    /// Any type this module does not model; routed to the dispatcher
    Other(Packet),
}

impl Message {
    pub fn type_id(&self) -> u16 {
        match self {
            Message::ClientInfo { .. } => CLIENT_INFO,
            Message::ClientVersion { .. } => CLIENT_VERSION,
            Message::LoginChallenge { .. } => LOGIN_CHALLENGE,
            Message::LoginRequest { .. } => LOGIN_REQUEST,
            Message::LoginSuccess { .. } => LOGIN_SUCCESS,
            Message::LoginFailure { .. } => LOGIN_FAILURE,
            Message::KeepAlive { .. } => KEEP_ALIVE,
            Message::DuplicateLogin => DUPLICATE_LOGIN,
            Message::Chat { .. } => CHAT_MESSAGE,
            Message::Presence { .. } => PRESENCE_UPDATE,
            Message::PeerConnectRequest(_) => PEER_CONNECT_REQUEST,
            Message::PeerConnectAccept(_) => PEER_CONNECT_ACCEPT,
            Message::MediationProbe { .. } => MEDIATION_PROBE,
            Message::MediationProbeReply { .. } => MEDIATION_PROBE_REPLY,
            Message::MediationLookup { .. } => MEDIATION_LOOKUP,
            Message::MediationLookupReply { .. } => MEDIATION_LOOKUP_REPLY,
            Message::Other(packet) => packet.type_id,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let packet = Packet::new(self.type_id());
        match self {
            Message::ClientInfo { skin, version, did } => {
                let packet = packet
                    .with("skin", AttributeValue::text(skin.as_str()))
                    .with("version", AttributeValue::text(version.as_str()));
                match did {
                    Some(did) => packet.with("did", AttributeValue::GenericId(*did)),
                    None => packet,
                }
            }
            Message::ClientVersion { version, build } => packet
                .with("version", AttributeValue::Int32(*version))
                .with("build", AttributeValue::text(build.as_str())),
            Message::LoginChallenge { salt } => {
                packet.with("salt", AttributeValue::text(salt.as_str()))
            }
            Message::LoginRequest {
                username,
                password_hash,
            } => packet
                .with("username", AttributeValue::text(username.as_str()))
                .with("password", AttributeValue::text(password_hash.as_str())),
            Message::LoginSuccess {
                user_id,
                session_id,
                display_name,
                protocol_version,
            } => packet
                .with("uid", AttributeValue::Int32(*user_id))
                .with("sid", AttributeValue::SessionId(*session_id))
                .with("name", AttributeValue::text(display_name.as_str()))
                .with("proto", AttributeValue::Int32(*protocol_version)),
            Message::LoginFailure { reason } => {
                packet.with("reason", AttributeValue::Int32(*reason))
            }
            Message::KeepAlive { value } => packet.with("value", AttributeValue::Int32(*value)),
            Message::DuplicateLogin => packet,
            Message::Chat { peer, body } => packet
                .with("peer", AttributeValue::Int32(*peer))
                .with("body", AttributeValue::text(body.as_str())),
            Message::Presence {
                user_id,
                status,
                text,
            } => {
                let packet = packet
                    .with("uid", AttributeValue::Int32(*user_id))
                    .with("status", AttributeValue::Int32(*status));
                match text {
                    Some(text) => packet.with("text", AttributeValue::text(text.as_str())),
                    None => packet,
                }
            }
            Message::PeerConnectRequest(offer) | Message::PeerConnectAccept(offer) => {
                let mut packet = packet
                    .with("sid", AttributeValue::SessionId(offer.session_id))
                    .with("token", AttributeValue::Int32(offer.token))
                    .with("salt", AttributeValue::GenericId(offer.salt));
                if let Some(public) = offer.public {
                    put_endpoint(&mut packet, "pip", "pport", public);
                }
                if let Some(local) = offer.local {
                    put_endpoint(&mut packet, "lip", "lport", local);
                }
                packet
            }
            Message::MediationProbe {
                request_id,
                alternate,
            } => packet
                .with("rid", AttributeValue::Int32(*request_id))
                .with("alt", AttributeValue::Int32(u32::from(*alternate))),
            Message::MediationProbeReply {
                request_id,
                observed,
            } => {
                let mut packet = packet.with("rid", AttributeValue::Int32(*request_id));
                put_endpoint(&mut packet, "ip", "port", *observed);
                packet
            }
            Message::MediationLookup {
                request_id,
                own,
                peer,
                token,
            } => packet
                .with("rid", AttributeValue::Int32(*request_id))
                .with("sid", AttributeValue::SessionId(*own))
                .with("peer", AttributeValue::SessionId(*peer))
                .with("token", AttributeValue::Int32(*token)),
            Message::MediationLookupReply {
                request_id,
                public,
                local,
                predicted_port,
                port_delta,
            } => {
                let mut packet = packet.with("rid", AttributeValue::Int32(*request_id));
                put_endpoint(&mut packet, "ip", "port", *public);
                if let Some(local) = local {
                    put_endpoint(&mut packet, "lip", "lport", *local);
                }
                if let Some(next) = predicted_port {
                    packet.push("next", AttributeValue::Int32(u32::from(*next)));
                }
                if let Some(delta) = port_delta {
                    packet.push("delta", AttributeValue::Int32(*delta as u32));
                }
                packet
            }
            Message::Other(other) => other.clone(),
        }
    }

    /// Interpret a packet. Known types with missing or mistyped attributes
    /// are decode errors; unknown types become [`Message::Other`].
    pub fn from_packet(packet: &Packet) -> Result<Message, DecodeError> {
        let message = match packet.type_id {
            CLIENT_INFO => Message::ClientInfo {
                skin: packet.text("skin")?.to_owned(),
                version: packet.text("version")?.to_owned(),
                did: packet.opt_generic_id("did")?,
            },
            CLIENT_VERSION => Message::ClientVersion {
                version: packet.int("version")?,
                build: packet.text("build")?.to_owned(),
            },
            LOGIN_CHALLENGE => Message::LoginChallenge {
                salt: packet.text("salt")?.to_owned(),
            },
            LOGIN_REQUEST => Message::LoginRequest {
                username: packet.text("username")?.to_owned(),
                password_hash: packet.text("password")?.to_owned(),
            },
            LOGIN_SUCCESS => Message::LoginSuccess {
                user_id: packet.int("uid")?,
                session_id: packet.session_id("sid")?,
                display_name: packet.text("name")?.to_owned(),
                protocol_version: packet.int("proto")?,
            },
            LOGIN_FAILURE => Message::LoginFailure {
                reason: packet.int("reason")?,
            },
            KEEP_ALIVE => Message::KeepAlive {
                value: packet.int("value")?,
            },
            DUPLICATE_LOGIN => Message::DuplicateLogin,
            CHAT_MESSAGE => Message::Chat {
                peer: packet.int("peer")?,
                body: packet.text("body")?.to_owned(),
            },
            PRESENCE_UPDATE => Message::Presence {
                user_id: packet.int("uid")?,
                status: packet.int("status")?,
                text: packet.opt_text("text")?.map(str::to_owned),
            },
            PEER_CONNECT_REQUEST => Message::PeerConnectRequest(peer_offer(packet)?),
            PEER_CONNECT_ACCEPT => Message::PeerConnectAccept(peer_offer(packet)?),
            MEDIATION_PROBE => Message::MediationProbe {
                request_id: packet.int("rid")?,
                alternate: packet.int("alt")? != 0,
            },
            MEDIATION_PROBE_REPLY => Message::MediationProbeReply {
                request_id: packet.int("rid")?,
                observed: endpoint(packet, "ip", "port")?
                    .ok_or(DecodeError::MissingAttribute("ip"))?,
            },
            MEDIATION_LOOKUP => Message::MediationLookup {
                request_id: packet.int("rid")?,
                own: packet.session_id("sid")?,
                peer: packet.session_id("peer")?,
                token: packet.int("token")?,
            },
            MEDIATION_LOOKUP_REPLY => Message::MediationLookupReply {
                request_id: packet.int("rid")?,
                public: endpoint(packet, "ip", "port")?
                    .ok_or(DecodeError::MissingAttribute("ip"))?,
                local: endpoint(packet, "lip", "lport")?,
                predicted_port: packet
                    .opt_int("next")?
                    .map(|port| to_port("next", port))
                    .transpose()?,
                port_delta: packet.opt_int("delta")?.map(|delta| delta as i32),
            },
            _ => Message::Other(packet.clone()),
        };
        Ok(message)
    }
}

fn peer_offer(packet: &Packet) -> Result<PeerOffer, DecodeError> {
    Ok(PeerOffer {
        session_id: packet.session_id("sid")?,
        token: packet.int("token")?,
        salt: packet.generic_id("salt")?,
        public: endpoint(packet, "pip", "pport")?,
        local: endpoint(packet, "lip", "lport")?,
    })
}

fn put_endpoint(packet: &mut Packet, ip: &str, port: &str, addr: SocketAddrV4) {
    packet.push(ip, AttributeValue::Int32(u32::from(*addr.ip())));
    packet.push(port, AttributeValue::Int32(u32::from(addr.port())));
}

/// Both halves present gives an endpoint, neither gives `None`; one without
/// the other is malformed.
fn endpoint(
    packet: &Packet,
    ip: &'static str,
    port: &'static str,
) -> Result<Option<SocketAddrV4>, DecodeError> {
    match (packet.opt_int(ip)?, packet.opt_int(port)?) {
        (Some(ip_value), Some(port_value)) => Ok(Some(SocketAddrV4::new(
            Ipv4Addr::from(ip_value),
            to_port(port, port_value)?,
        ))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(DecodeError::MissingAttribute(port)),
        (None, Some(_)) => Err(DecodeError::MissingAttribute(ip)),
    }
}

fn to_port(name: &'static str, value: u32) -> Result<u16, DecodeError> {
    u16::try_from(value).map_err(|_| DecodeError::InvalidValue {
        name,
        reason: format!("{value} is not a port number"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn offer() -> PeerOffer {
        PeerOffer {
            session_id: SessionId([7; 16]),
            token: 0xDEAD_BEEF,
            salt: OpaqueId([3; 16]),
            public: Some(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 40000)),
            local: None,
        }
    }

    #[test]
    fn test_messages_survive_packet_form() {
        let messages = vec![
            Message::ClientInfo {
                skin: "classic".into(),
                version: "2.1".into(),
                did: Some(OpaqueId([0xAB; 16])),
            },
            Message::LoginSuccess {
                user_id: 501,
                session_id: SessionId([1; 16]),
                display_name: "Alice".into(),
                protocol_version: 3,
            },
            Message::Presence {
                user_id: 2,
                status: 1,
                text: None,
            },
            Message::PeerConnectRequest(offer()),
            Message::MediationLookupReply {
                request_id: 4,
                public: SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 5000),
                local: Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000)),
                predicted_port: Some(5002),
                port_delta: Some(-2),
            },
        ];

        for message in messages {
            let bytes = message.to_packet().to_bytes().unwrap();
            let packet = Packet::from_bytes(&bytes).unwrap();
            assert_eq!(Message::from_packet(&packet).unwrap(), message);
        }
    }

    #[test]
    fn test_endpoint_wire_form() {
        let packet = Message::PeerConnectRequest(offer()).to_packet();
        assert_eq!(packet.int("pip").unwrap(), 0xCB00_7109);
        assert_eq!(packet.int("pport").unwrap(), 40000);
        assert!(packet.get("lip").is_none());
    }

    #[test]
    fn test_half_endpoint_is_malformed() {
        let packet = Message::PeerConnectRequest(offer())
            .to_packet()
            .with("lip", AttributeValue::Int32(1));
        assert_eq!(
            Message::from_packet(&packet),
            Err(DecodeError::MissingAttribute("lport"))
        );
    }

    #[test]
    fn test_port_out_of_range() {
        let packet = Packet::new(MEDIATION_PROBE_REPLY)
            .with("rid", AttributeValue::Int32(1))
            .with("ip", AttributeValue::Int32(1))
            .with("port", AttributeValue::Int32(70_000));
        assert!(matches!(
            Message::from_packet(&packet),
            Err(DecodeError::InvalidValue { name: "port", .. })
        ));
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let packet = Packet::new(0x0999).with("x", AttributeValue::Int32(1));
        assert_eq!(
            Message::from_packet(&packet).unwrap(),
            Message::Other(packet.clone())
        );
        assert_eq!(Message::Other(packet.clone()).to_packet(), packet);
    }
}
