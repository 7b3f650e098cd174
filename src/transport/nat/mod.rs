//! # NAT Traversal
//!
//! Direct UDP channels between two clients behind address translators.
//!
//! ## Components
//! - **Datagram**: peer datagram format and salted ping/pong proofs
//! - **Assessment**: classification of our own NAT from mediator probes
//! - **Mediator**: request/reply client for the NAT mediation server
//! - **RTT**: smoothed round-trip estimate and retransmission timeout
//! - **Peer**: sans-IO per-channel state machine
//! - **Engine**: socket owner, demultiplexer and per-channel tasks
//!
//! ## Establishing a Channel
//! ```text
//! Originator                 Server / Mediator                 Recipient
//!   |-- PeerConnectRequest ------>|------------------------------->|
//!   |<----------------------------|<------- PeerConnectAccept -----|
//!   |-- MediationLookup --------->|<-------- MediationLookup ------|
//!   |<===== Ping / Pong over UDP, every candidate, each round ====>|
//! ```

pub mod assessment;
pub mod datagram;
pub mod engine;
pub mod mediator;
pub mod peer;
pub mod rtt;

pub use assessment::{NatAssessment, NatLevel};
pub use engine::{ChannelNotice, ChannelNoticeKind, ChannelRequest, NatEngine, PeerChannel};
pub use peer::{ChannelState, CloseReason, NatRole};
