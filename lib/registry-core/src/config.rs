//! Lease and sweep parameters

use crate::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_LEASE_SECONDS: u64 = 90;
pub const MAX_LEASE_SECONDS: u64 = 3600;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Registry tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Lease applied when a registration asks for 0 seconds
    pub default_lease_seconds: u64,
    /// Upper bound for requested leases
    pub max_lease_seconds: u64,
    /// Sweep period; derived from the default lease when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction_interval_seconds: Option<u64>,
    /// Suspend evictions when too many leases expire at once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_preservation: Option<SelfPreservation>,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_lease_seconds: DEFAULT_LEASE_SECONDS,
            max_lease_seconds: MAX_LEASE_SECONDS,
            eviction_interval_seconds: None,
            self_preservation: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfPreservation {
    /// Largest share of live instances a single sweep may evict, in (0, 1]
    pub threshold: f64,
    /// Below this many live instances the guard is inactive
    #[serde(default = "default_min_instances")]
    pub min_instances: usize,
}

fn default_min_instances() -> usize {
    5
}

impl RegistryConfig {
    /// Sweep period: the configured value, else a third of the default
    /// lease. Never below one second.
    pub fn eviction_interval(&self) -> Duration {
        let seconds = self
            .eviction_interval_seconds
            .unwrap_or(self.default_lease_seconds / 3);
        Duration::from_secs(seconds.max(1))
    }

    /// Lease actually granted for a requested duration
    pub fn effective_lease_seconds(&self, requested: u64) -> u64 {
        if requested == 0 {
            self.default_lease_seconds
        } else {
            requested.min(self.max_lease_seconds)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_lease_seconds == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "defaultLeaseSeconds must be greater than zero".to_string(),
            ));
        }
        if self.max_lease_seconds < self.default_lease_seconds {
            return Err(RegistryError::InvalidConfiguration(format!(
                "maxLeaseSeconds ({}) is below defaultLeaseSeconds ({})",
                self.max_lease_seconds, self.default_lease_seconds
            )));
        }
        // Keeps lease arithmetic well inside chrono's range
        if self.max_lease_seconds > 365 * 24 * 3600 {
            return Err(RegistryError::InvalidConfiguration(
                "maxLeaseSeconds must not exceed one year".to_string(),
            ));
        }
        if self.eviction_interval_seconds == Some(0) {
            return Err(RegistryError::InvalidConfiguration(
                "evictionIntervalSeconds must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(RegistryError::InvalidConfiguration(
                "eventCapacity must be greater than zero".to_string(),
            ));
        }
        if let Some(guard) = &self.self_preservation {
            if !(guard.threshold > 0.0 && guard.threshold <= 1.0) {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "selfPreservation.threshold must be in (0, 1], got {}",
                    guard.threshold
                )));
            }
        }
        Ok(())
    }
}
