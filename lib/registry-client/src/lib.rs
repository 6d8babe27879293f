//! Client side of the discovery API
//!
//! [`DiscoveryClient`] issues the four registry calls over HTTP.
//! [`HeartbeatAgent`] keeps one instance registered for the lifetime of a
//! process: register at startup, renew on an interval, deregister on exit.

pub mod client;
pub mod error;
pub mod heartbeat;

#[cfg(test)]
mod testing;

pub use client::DiscoveryClient;
pub use error::{ClientError, Result};
pub use heartbeat::HeartbeatAgent;
