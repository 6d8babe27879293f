//! Background registration keeper for a single instance

use crate::client::DiscoveryClient;
use crate::error::ClientError;
use registry_core::Registration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Registers an instance, renews it every `renew_interval`, and
/// deregisters it on [`HeartbeatAgent::shutdown`].
///
/// A renewal answered with not-found (lease lapsed, evicted or removed by
/// an operator) triggers a fresh registration on the same tick.
pub struct HeartbeatAgent {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    registered: watch::Receiver<bool>,
}

impl HeartbeatAgent {
    pub fn start(
        client: Arc<DiscoveryClient>,
        registration: Registration,
        renew_interval: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let (registered_tx, registered) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(renew_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let was_registered = *registered_tx.borrow();
                        let ok = if was_registered {
                            renew_or_register(&client, &registration).await
                        } else {
                            register(&client, &registration).await
                        };
                        registered_tx.send_replace(ok);
                    }
                    _ = stopped.changed() => break,
                }
            }

            let was_registered = *registered_tx.borrow();
            if was_registered {
                match client
                    .deregister(&registration.service_name, &registration.instance_id)
                    .await
                {
                    Ok(_) => info!(
                        service = %registration.service_name,
                        instance = %registration.instance_id,
                        "Deregistered instance"
                    ),
                    Err(e) => warn!(
                        service = %registration.service_name,
                        instance = %registration.instance_id,
                        "Failed to deregister instance: {}", e
                    ),
                }
            }
            registered_tx.send_replace(false);
        });

        Self {
            stop,
            handle: Some(handle),
            registered,
        }
    }

    /// Whether the last register or renew call succeeded
    pub fn is_registered(&self) -> bool {
        *self.registered.borrow()
    }

    /// Wait until the registered flag equals `state`
    pub async fn wait_registered(&mut self, state: bool) {
        let _ = self.registered.wait_for(|registered| *registered == state).await;
    }

    /// Stop renewing and deregister the instance
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Heartbeat task failed: {}", e);
            }
        }
    }
}

impl Drop for HeartbeatAgent {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

async fn register(client: &DiscoveryClient, registration: &Registration) -> bool {
    match client.register(registration).await {
        Ok(instance) => {
            info!(
                service = %instance.service_name,
                instance = %instance.instance_id,
                address = %instance.address,
                "Registered with {}", client.base_url()
            );
            true
        }
        Err(e) => {
            warn!(
                service = %registration.service_name,
                instance = %registration.instance_id,
                "Registration failed: {}", e
            );
            false
        }
    }
}

async fn renew_or_register(client: &DiscoveryClient, registration: &Registration) -> bool {
    match client
        .renew(&registration.service_name, &registration.instance_id)
        .await
    {
        Ok(instance) => {
            debug!(
                service = %instance.service_name,
                instance = %instance.instance_id,
                "Renewed lease until {}", instance.lease_expiry
            );
            true
        }
        Err(ClientError::NotFound { .. }) => {
            info!(
                service = %registration.service_name,
                instance = %registration.instance_id,
                "Registry no longer holds instance, registering again"
            );
            register(client, registration).await
        }
        Err(e) => {
            // Keep the registered flag so the next tick renews instead of
            // replacing the entry.
            warn!(
                service = %registration.service_name,
                instance = %registration.instance_id,
                "Renewal failed: {}", e
            );
            true
        }
    }
}
