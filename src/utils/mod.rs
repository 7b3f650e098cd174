//! # Utility Modules
//!
//! Supporting utilities for logging, observability and timing.
//!
//! ## Components
//! - **Logging**: Subscriber setup and redaction wrappers
//! - **Metrics**: Per-client atomic counters
//! - **Timeout**: Default deadlines and an async timeout wrapper

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
