//! Service registry: the live table of instances and their leases

use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::event::RegistryEvent;
use crate::instance::{
    normalize_instance_id, normalize_service_name, InstanceAddress, InstanceStatus, Registration,
    ServiceInstance,
};
use crate::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Operations a discovery transport needs from a registry.
///
/// [`ServiceRegistry`] is the in-process implementation; a registry backed
/// by an external system can be put behind the same interface.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Insert or replace an instance. New instances start in STARTING; a live
    /// instance registered again keeps its status.
    async fn register(&self, registration: Registration) -> Result<ServiceInstance>;

    /// Refresh an instance lease, promoting STARTING to UP
    async fn renew(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance>;

    /// Remove an instance. Returns whether anything was removed; absent
    /// instances are not an error.
    async fn deregister(&self, service_name: &str, instance_id: &str) -> bool;

    /// UP instances of a service in registration order
    async fn lookup(&self, service_name: &str) -> Vec<ServiceInstance>;

    /// Every instance of a service in registration order, whatever its status
    async fn lookup_all(&self, service_name: &str) -> Vec<ServiceInstance>;

    /// Explicit status change (UP, DOWN or OUT_OF_SERVICE)
    async fn set_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<ServiceInstance>;

    /// A single instance
    async fn get(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance>;

    /// Known service names with instance counts
    async fn services(&self) -> Vec<ServiceSummary>;

    /// Table sizes and operation counters
    async fn stats(&self) -> RegistryStats;
}

/// Per-service instance counts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub service_name: String,
    pub total: usize,
    pub up: usize,
}

/// Registry-wide counts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub services: usize,
    pub instances: usize,
    pub up: usize,
    pub registrations: u64,
    pub renewals: u64,
    pub deregistrations: u64,
    pub evictions: u64,
}

struct InstanceEntry {
    /// Registration order within the service
    seq: u64,
    instance: ServiceInstance,
}

/// All instances of one service name, locked as a unit
#[derive(Default)]
struct ServiceGroup {
    next_seq: u64,
    entries: HashMap<String, InstanceEntry>,
    /// Set once the group has been unlinked from the table; writers that
    /// raced with the unlink must look the group up again.
    retired: bool,
}

impl ServiceGroup {
    fn ordered<F>(&self, keep: F) -> Vec<ServiceInstance>
    where
        F: Fn(&ServiceInstance) -> bool,
    {
        let mut entries: Vec<&InstanceEntry> = self
            .entries
            .values()
            .filter(|entry| keep(&entry.instance))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| entry.instance.clone())
            .collect()
    }
}

type GroupRef = Arc<Mutex<ServiceGroup>>;

#[derive(Default)]
struct Counters {
    registrations: AtomicU64,
    renewals: AtomicU64,
    deregistrations: AtomicU64,
    evictions: AtomicU64,
}

/// In-memory service registry.
///
/// The table maps a normalized service name to a group of instances. The
/// outer map is only write-locked to add or unlink a group; every
/// instance-level operation serializes on its group's mutex, so work on one
/// service never waits for another.
pub struct ServiceRegistry {
    groups: RwLock<HashMap<String, GroupRef>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<RegistryEvent>,
    counters: Counters,
}

impl ServiceRegistry {
    /// Create a registry with default settings and the system clock
    pub fn new() -> Self {
        Self::with_clock(RegistryConfig::default(), Arc::new(SystemClock))
    }

    /// Create a registry with the given settings and the system clock
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            groups: RwLock::new(HashMap::new()),
            config,
            clock,
            events,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Receive every subsequent change. A receiver that falls behind loses
    /// the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Remove every instance whose lease has expired.
    ///
    /// Evicted instances are returned with status DOWN. Groups are locked one
    /// at a time. With self-preservation configured, a sweep that would evict
    /// too large a share of the table evicts nothing.
    pub async fn evict_expired(&self) -> Vec<ServiceInstance> {
        let groups = self.group_snapshot().await;
        let now = self.clock.now();

        if let Some(guard) = &self.config.self_preservation {
            let mut live = 0usize;
            let mut expired = 0usize;
            for (_, group) in &groups {
                let group = group.lock().await;
                live += group.entries.len();
                expired += group
                    .entries
                    .values()
                    .filter(|entry| entry.instance.is_expired_at(now))
                    .count();
            }
            if live >= guard.min_instances && expired as f64 > guard.threshold * live as f64 {
                warn!(
                    expired,
                    live,
                    threshold = guard.threshold,
                    "Self-preservation engaged, skipping eviction"
                );
                return Vec::new();
            }
        }

        let mut evicted = Vec::new();
        let mut emptied = Vec::new();

        for (service_name, group) in groups {
            let mut group = group.lock().await;
            if group.retired {
                continue;
            }

            let expired_ids: Vec<String> = group
                .entries
                .iter()
                .filter(|(_, entry)| entry.instance.is_expired_at(now))
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired_entries = Vec::with_capacity(expired_ids.len());
            for instance_id in expired_ids {
                // Already gone is fine: the sweep's goal is met
                if let Some(entry) = group.entries.remove(&instance_id) {
                    expired_entries.push(entry);
                }
            }
            expired_entries.sort_by_key(|entry| entry.seq);

            for entry in expired_entries {
                let mut instance = entry.instance;
                instance.status = InstanceStatus::Down;
                info!(
                    service = %instance.service_name,
                    instance = %instance.instance_id,
                    lease_expiry = %instance.lease_expiry,
                    "Evicted instance with expired lease"
                );
                evicted.push(instance);
            }

            if group.entries.is_empty() {
                emptied.push(service_name);
            }
        }

        for service_name in emptied {
            self.prune_if_empty(&service_name).await;
        }

        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            for instance in &evicted {
                self.publish(RegistryEvent::Evicted {
                    instance: instance.clone(),
                });
            }
        }

        evicted
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// `from + lease_seconds`, saturating at the latest representable time
    fn lease_end(&self, from: DateTime<Utc>, lease_seconds: u64) -> DateTime<Utc> {
        i64::try_from(lease_seconds)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|lease| from.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn group(&self, service_name: &str) -> Option<GroupRef> {
        self.groups.read().await.get(service_name).cloned()
    }

    async fn group_or_insert(&self, service_name: &str) -> GroupRef {
        if let Some(group) = self.group(service_name).await {
            return group;
        }
        let mut groups = self.groups.write().await;
        groups
            .entry(service_name.to_string())
            .or_default()
            .clone()
    }

    async fn group_snapshot(&self) -> Vec<(String, GroupRef)> {
        self.groups
            .read()
            .await
            .iter()
            .map(|(name, group)| (name.clone(), group.clone()))
            .collect()
    }

    /// Unlink a group that has no instances left.
    ///
    /// Lock order is always table then group, and the group is only
    /// try-locked while the table is write-locked. A group that is busy is
    /// left in place; the next sweep prunes it if it is still empty.
    async fn prune_if_empty(&self, service_name: &str) {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get(service_name) else {
            return;
        };
        let pruned = match group.try_lock() {
            Ok(mut group) if group.entries.is_empty() => {
                group.retired = true;
                true
            }
            Ok(_) => false,
            Err(_) => {
                debug!(service = %service_name, "Service group busy, deferring prune");
                false
            }
        };
        if pruned {
            groups.remove(service_name);
            debug!(service = %service_name, "Removed empty service group");
        }
    }

    fn normalize_key(service_name: &str, instance_id: &str) -> Option<(String, String)> {
        let service_name = normalize_service_name(service_name).ok()?;
        let instance_id = normalize_instance_id(instance_id).ok()?;
        Some((service_name, instance_id))
    }

    async fn lookup_filtered<F>(&self, service_name: &str, keep: F) -> Vec<ServiceInstance>
    where
        F: Fn(&ServiceInstance) -> bool,
    {
        let Ok(service_name) = normalize_service_name(service_name) else {
            return Vec::new();
        };
        let Some(group) = self.group(&service_name).await else {
            return Vec::new();
        };
        let group = group.lock().await;
        group.ordered(keep)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Registry for ServiceRegistry {
    async fn register(&self, registration: Registration) -> Result<ServiceInstance> {
        let service_name = normalize_service_name(&registration.service_name)?;
        let instance_id = normalize_instance_id(&registration.instance_id)?;
        let address: InstanceAddress = registration.address.parse()?;
        let lease_seconds = self
            .config
            .effective_lease_seconds(registration.lease_duration_seconds);

        loop {
            let group = self.group_or_insert(&service_name).await;
            let mut group = group.lock().await;
            if group.retired {
                continue;
            }

            let now = self.clock.now();
            // A live entry keeps its position, first registration time and
            // status; only a new or expired one starts over in STARTING.
            let previous = group
                .entries
                .get(&instance_id)
                .filter(|entry| !entry.instance.is_expired_at(now))
                .map(|entry| {
                    (
                        entry.seq,
                        entry.instance.registered_at,
                        entry.instance.status,
                    )
                });
            let replaced = previous.is_some();
            let (seq, registered_at, status) = match previous {
                Some(kept) => kept,
                None => {
                    let seq = group.next_seq;
                    group.next_seq += 1;
                    (seq, now, InstanceStatus::Starting)
                }
            };

            let instance = ServiceInstance {
                service_name: service_name.clone(),
                instance_id: instance_id.clone(),
                address: address.clone(),
                status,
                metadata: registration.metadata.clone(),
                lease_duration_seconds: lease_seconds,
                registered_at,
                last_renewed_at: now,
                lease_expiry: self.lease_end(now, lease_seconds),
            };
            group.entries.insert(
                instance_id.clone(),
                InstanceEntry {
                    seq,
                    instance: instance.clone(),
                },
            );
            drop(group);

            self.counters.registrations.fetch_add(1, Ordering::Relaxed);
            info!(
                service = %service_name,
                instance = %instance_id,
                address = %address,
                lease_seconds,
                replaced,
                status = %status,
                "Registered instance"
            );
            self.publish(RegistryEvent::Registered {
                instance: instance.clone(),
                replaced,
            });

            return Ok(instance);
        }
    }

    async fn renew(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance> {
        let Some((service_name, instance_id)) = Self::normalize_key(service_name, instance_id)
        else {
            return Err(RegistryError::not_found(service_name, instance_id));
        };
        let Some(group) = self.group(&service_name).await else {
            warn!(service = %service_name, instance = %instance_id, "Renewal for unknown instance");
            return Err(RegistryError::not_found(&service_name, &instance_id));
        };

        let mut group = group.lock().await;
        let now = self.clock.now();
        // An expired entry the sweep has not reached yet is already dead
        let Some(entry) = group
            .entries
            .get_mut(&instance_id)
            .filter(|entry| !entry.instance.is_expired_at(now))
        else {
            warn!(service = %service_name, instance = %instance_id, "Renewal for unknown instance");
            return Err(RegistryError::not_found(&service_name, &instance_id));
        };

        let instance = &mut entry.instance;
        instance.last_renewed_at = now;
        let extended = self.lease_end(now, instance.lease_duration_seconds);
        if extended > instance.lease_expiry {
            instance.lease_expiry = extended;
        }
        let promoted = instance.status == InstanceStatus::Starting;
        if promoted {
            instance.status = InstanceStatus::Up;
        }
        let snapshot = instance.clone();
        drop(group);

        self.counters.renewals.fetch_add(1, Ordering::Relaxed);
        if promoted {
            info!(service = %service_name, instance = %instance_id, "Instance is UP");
        } else {
            debug!(service = %service_name, instance = %instance_id, "Renewed lease");
        }
        self.publish(RegistryEvent::Renewed {
            service_name,
            instance_id,
            promoted,
        });

        Ok(snapshot)
    }

    async fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let Some((service_name, instance_id)) = Self::normalize_key(service_name, instance_id)
        else {
            return false;
        };
        let Some(group) = self.group(&service_name).await else {
            debug!(service = %service_name, instance = %instance_id, "Deregister for unknown instance");
            return false;
        };

        let (removed, now_empty) = {
            let mut group = group.lock().await;
            let removed = group.entries.remove(&instance_id).is_some();
            (removed, group.entries.is_empty())
        };

        if now_empty {
            self.prune_if_empty(&service_name).await;
        }

        if removed {
            self.counters.deregistrations.fetch_add(1, Ordering::Relaxed);
            info!(service = %service_name, instance = %instance_id, "Deregistered instance");
            self.publish(RegistryEvent::Deregistered {
                service_name,
                instance_id,
            });
        } else {
            debug!(service = %service_name, instance = %instance_id, "Deregister for unknown instance");
        }

        removed
    }

    async fn lookup(&self, service_name: &str) -> Vec<ServiceInstance> {
        let now = self.clock.now();
        self.lookup_filtered(service_name, |instance| {
            instance.is_up() && !instance.is_expired_at(now)
        })
        .await
    }

    async fn lookup_all(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.lookup_filtered(service_name, |_| true).await
    }

    async fn set_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<ServiceInstance> {
        let Some((service_name, instance_id)) = Self::normalize_key(service_name, instance_id)
        else {
            return Err(RegistryError::not_found(service_name, instance_id));
        };
        let group = self
            .group(&service_name)
            .await
            .ok_or_else(|| RegistryError::not_found(&service_name, &instance_id))?;

        let mut group = group.lock().await;
        let now = self.clock.now();
        let entry = group
            .entries
            .get_mut(&instance_id)
            .filter(|entry| !entry.instance.is_expired_at(now))
            .ok_or_else(|| RegistryError::not_found(&service_name, &instance_id))?;

        let from = entry.instance.status;
        if status == InstanceStatus::Starting {
            return Err(RegistryError::InvalidStatusTransition { from, to: status });
        }
        entry.instance.status = status;
        let snapshot = entry.instance.clone();
        drop(group);

        if from != status {
            info!(
                service = %service_name,
                instance = %instance_id,
                from = %from,
                to = %status,
                "Instance status changed"
            );
            self.publish(RegistryEvent::StatusChanged {
                service_name,
                instance_id,
                from,
                to: status,
            });
        }

        Ok(snapshot)
    }

    async fn get(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance> {
        let Some((service_name, instance_id)) = Self::normalize_key(service_name, instance_id)
        else {
            return Err(RegistryError::not_found(service_name, instance_id));
        };
        let group = self
            .group(&service_name)
            .await
            .ok_or_else(|| RegistryError::not_found(&service_name, &instance_id))?;
        let group = group.lock().await;
        let now = self.clock.now();
        group
            .entries
            .get(&instance_id)
            .filter(|entry| !entry.instance.is_expired_at(now))
            .map(|entry| entry.instance.clone())
            .ok_or_else(|| RegistryError::not_found(&service_name, &instance_id))
    }

    async fn services(&self) -> Vec<ServiceSummary> {
        let mut summaries = Vec::new();
        for (service_name, group) in self.group_snapshot().await {
            let group = group.lock().await;
            if group.retired || group.entries.is_empty() {
                continue;
            }
            summaries.push(ServiceSummary {
                service_name,
                total: group.entries.len(),
                up: group
                    .entries
                    .values()
                    .filter(|entry| entry.instance.is_up())
                    .count(),
            });
        }
        summaries.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        summaries
    }

    async fn stats(&self) -> RegistryStats {
        let summaries = self.services().await;
        RegistryStats {
            services: summaries.len(),
            instances: summaries.iter().map(|s| s.total).sum(),
            up: summaries.iter().map(|s| s.up).sum(),
            registrations: self.counters.registrations.load(Ordering::Relaxed),
            renewals: self.counters.renewals.load(Ordering::Relaxed),
            deregistrations: self.counters.deregistrations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}
