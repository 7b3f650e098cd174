//! # Protocol Layer
//!
//! Typed messages over the packet format, the login handshake and routing
//! of everything else to registered handlers.
//!
//! ## Components
//! - **Message**: typed view of the known packet types
//! - **Handshake**: token, announcement, salted double-hash login
//! - **Dispatcher**: type id to handler routing for collaborator packets
//!
//! ## Login Flow
//! ```text
//! Client                                   Server
//!   |-- "UAP1" --------------------------->|
//!   |-- ClientInfo, ClientVersion -------->|
//!   |<-------------------- LoginChallenge -|
//!   |-- LoginRequest(user, proof) -------->|
//!   |<------- LoginSuccess / LoginFailure -|
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod message;
