//! # Transports
//!
//! - **TCP**: the reliable, framed connection to the messaging server
//! - **NAT**: direct peer-to-peer UDP channels

pub mod nat;
pub mod tcp;
