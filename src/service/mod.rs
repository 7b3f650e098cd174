//! # Client Service
//!
//! The session/connection manager: one task per client that logs in, keeps
//! the server connection alive and hands peer channels to the application.
//!
//! ## Components
//! - **Events**: commands in, events out
//! - **Session**: the driver task and the [`ClientHandle`] that talks to it
//!
//! ## Lifecycle
//! ```text
//! Idle --Login--> Connecting --auth ok--> LoggedIn --+--> TransportLost --> Idle
//!                     |                              +--> SessionInvalidated --> Idle
//!                     +--> LoginFailed --> Idle      +--> CloseSession --> Closed
//! ```

pub mod events;
pub mod session;

pub use events::{Command, Event};
pub use session::{spawn_client, ClientHandle};
