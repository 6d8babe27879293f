//! Background eviction sweep

use crate::registry::ServiceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Repeating task that evicts expired leases from a registry.
///
/// The task stops when [`EvictionSweeper::shutdown`] is called or the handle
/// is dropped, so it never outlives its owner.
pub struct EvictionSweeper {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl EvictionSweeper {
    /// Start sweeping `registry` every `interval`
    pub fn spawn(registry: Arc<ServiceRegistry>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.evict_expired().await;
                        if evicted.is_empty() {
                            debug!("Eviction sweep found no expired leases");
                        } else {
                            info!(evicted = evicted.len(), "Eviction sweep completed");
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Eviction sweep stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "Eviction sweep started");

        Self {
            stop,
            handle: Some(handle),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the sweep and wait for the task to finish
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Eviction sweep task failed: {}", e);
            }
        }
    }
}

impl Drop for EvictionSweeper {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

impl ServiceRegistry {
    /// Start the eviction sweep at the configured interval
    pub fn spawn_sweeper(self: &Arc<Self>) -> EvictionSweeper {
        EvictionSweeper::spawn(self.clone(), self.config().eviction_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RegistryConfig;
    use crate::instance::Registration;
    use crate::registry::Registry;

    async fn registered_up(registry: &ServiceRegistry, id: &str) {
        registry
            .register(Registration::new("orders", id, "10.0.0.5:8080").with_lease_seconds(30))
            .await
            .unwrap();
        registry.renew("orders", id).await.unwrap();
    }

    async fn wait_until_empty(registry: &ServiceRegistry) -> bool {
        for _ in 0..100 {
            if registry.lookup_all("orders").await.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_sweeper_evicts_expired_leases() {
        let clock = ManualClock::default();
        let registry = Arc::new(ServiceRegistry::with_clock(
            RegistryConfig::default(),
            Arc::new(clock.clone()),
        ));
        registered_up(&registry, "orders-1").await;

        let sweeper = EvictionSweeper::spawn(registry.clone(), Duration::from_millis(10));
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.lookup("orders").await.len(), 1);

        clock.advance(Duration::from_secs(31));
        assert!(wait_until_empty(&registry).await);

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeping() {
        let clock = ManualClock::default();
        let registry = Arc::new(ServiceRegistry::with_clock(
            RegistryConfig::default(),
            Arc::new(clock.clone()),
        ));
        let sweeper = EvictionSweeper::spawn(registry.clone(), Duration::from_millis(10));
        sweeper.shutdown().await;

        registered_up(&registry, "orders-1").await;
        clock.advance(Duration::from_secs(31));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.lookup_all("orders").await.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_stops_sweeping() {
        let registry = Arc::new(ServiceRegistry::new());
        let sweeper = EvictionSweeper::spawn(registry.clone(), Duration::from_millis(10));
        drop(sweeper);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Only the test holds the registry once the task has exited
        assert_eq!(Arc::strong_count(&registry), 1);
    }

    #[tokio::test]
    async fn test_spawn_sweeper_uses_configured_interval() {
        let config = RegistryConfig {
            eviction_interval_seconds: Some(7),
            ..Default::default()
        };
        let registry = Arc::new(ServiceRegistry::with_config(config));
        let sweeper = registry.spawn_sweeper();
        assert_eq!(sweeper.interval(), Duration::from_secs(7));
        sweeper.shutdown().await;
    }
}
