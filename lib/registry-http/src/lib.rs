//! HTTP transport for the service registry
//!
//! Exposes register, renew, deregister and lookup (plus diagnostics) as a
//! JSON API, with `/healthz` and Prometheus `/metrics` endpoints.

pub mod error;
pub mod handler;
pub mod metrics;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use handler::{handle_request, ApiState};
pub use metrics::MetricsCollector;
pub use routes::Route;
pub use server::DiscoveryServer;
