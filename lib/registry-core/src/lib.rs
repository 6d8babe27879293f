//! Service registry and discovery core
//!
//! This library provides:
//! - The live table of service instances and their leases
//! - Register, renew, deregister and lookup with per-service locking
//! - A background eviction sweep for expired leases
//! - Change events for observers such as metrics

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod registry;
pub mod sweep;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RegistryConfig, SelfPreservation};
pub use error::{RegistryError, Result};
pub use event::RegistryEvent;
pub use instance::{InstanceAddress, InstanceStatus, Registration, ServiceInstance};
pub use registry::{Registry, RegistryStats, ServiceRegistry, ServiceSummary};
pub use sweep::EvictionSweeper;
