use anyhow::{Context, Result};
use registry_core::ServiceRegistry;
use registry_http::{DiscoveryServer, MetricsCollector};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;

use config::{DiscoverConfig, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DiscoverConfig::load().context("Failed to load configuration")?;
    init_tracing(config.log.format);

    info!("Starting discover-server...");
    info!("  - Bind address: {}", config.bind);
    info!("  - Default lease: {}s", config.registry.default_lease_seconds);
    info!("  - Max lease: {}s", config.registry.max_lease_seconds);
    info!("  - Eviction interval: {:?}", config.registry.eviction_interval());
    if let Some(guard) = &config.registry.self_preservation {
        info!(
            "  - Self-preservation: threshold {}, min instances {}",
            guard.threshold, guard.min_instances
        );
    }

    let registry = Arc::new(ServiceRegistry::with_config(config.registry.clone()));
    info!("Service registry initialized");

    let sweeper = registry.spawn_sweeper();
    info!("Eviction sweeper started");

    let metrics = Arc::new(MetricsCollector::new().context("Failed to create metrics collector")?);
    let recorder = metrics.spawn_event_recorder(registry.subscribe());
    info!("Metrics collector initialized");

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    let server = DiscoveryServer::new(registry.clone(), metrics);
    server.serve(listener, shutdown_signal()).await?;

    sweeper.shutdown().await;
    recorder.abort();
    info!("discover-server stopped");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
