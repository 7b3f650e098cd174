//! # Arena Protocol
//!
//! Client core for the Ultimate Arena messaging service: the attribute and
//! packet codec, the salted login handshake, a session manager that owns
//! the server connection, and UDP NAT traversal for direct peer channels.
//!
//! ```no_run
//! use arena_protocol::config::NetworkConfig;
//! use arena_protocol::protocol::dispatcher::Dispatcher;
//! use arena_protocol::protocol::handshake::Credentials;
//! use arena_protocol::service::{spawn_client, Event};
//!
//! # async fn run() -> arena_protocol::error::Result<()> {
//! let config = NetworkConfig::from_file("arena.toml")?;
//! let (client, mut events) = spawn_client(config, Dispatcher::new())?;
//! client.login(Credentials::new("alice", "secret")).await?;
//! while let Some(event) = events.recv().await {
//!     if let Event::LoggedIn(session) = event {
//!         println!("logged in as {}", session.display_name);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use service::{spawn_client, ClientHandle, Command, Event};
