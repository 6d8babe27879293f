//! Prometheus metrics for the registry API and table

use anyhow::Result;
use prometheus::{
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, Opts, Registry as PrometheusRegistry,
    TextEncoder,
};
use registry_core::{RegistryEvent, RegistryStats};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Prometheus metrics collector for API requests and registry activity
#[derive(Clone)]
pub struct MetricsCollector {
    /// Total HTTP requests received
    pub http_requests_total: CounterVec,
    /// HTTP request duration in seconds
    pub http_request_duration_seconds: HistogramVec,
    /// HTTP responses by status code
    pub http_responses_total: CounterVec,
    pub registrations_total: IntCounter,
    pub renewals_total: IntCounter,
    pub deregistrations_total: IntCounter,
    pub evictions_total: IntCounter,
    pub status_changes_total: IntCounter,
    /// Refreshed from the registry at scrape time
    pub services: IntGauge,
    pub instances: IntGauge,
    pub instances_up: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<PrometheusRegistry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(PrometheusRegistry::new());

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "route"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            Opts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .into(),
            &["method", "route"],
        )?;

        let http_responses_total = CounterVec::new(
            Opts::new("http_responses_total", "Total HTTP responses by status"),
            &["status"],
        )?;

        let registrations_total = IntCounter::new(
            "registry_registrations_total",
            "Instance registrations, including replacements",
        )?;
        let renewals_total =
            IntCounter::new("registry_renewals_total", "Successful lease renewals")?;
        let deregistrations_total = IntCounter::new(
            "registry_deregistrations_total",
            "Instances removed by explicit deregistration",
        )?;
        let evictions_total = IntCounter::new(
            "registry_evictions_total",
            "Instances removed because their lease expired",
        )?;
        let status_changes_total = IntCounter::new(
            "registry_status_changes_total",
            "Explicit instance status changes",
        )?;

        let services = IntGauge::new("registry_services", "Service names with instances")?;
        let instances = IntGauge::new("registry_instances", "Registered instances")?;
        let instances_up = IntGauge::new("registry_instances_up", "Instances with status UP")?;

        // Register metrics
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_responses_total.clone()))?;
        registry.register(Box::new(registrations_total.clone()))?;
        registry.register(Box::new(renewals_total.clone()))?;
        registry.register(Box::new(deregistrations_total.clone()))?;
        registry.register(Box::new(evictions_total.clone()))?;
        registry.register(Box::new(status_changes_total.clone()))?;
        registry.register(Box::new(services.clone()))?;
        registry.register(Box::new(instances.clone()))?;
        registry.register(Box::new(instances_up.clone()))?;

        Ok(Self {
            http_requests_total,
            http_request_duration_seconds,
            http_responses_total,
            registrations_total,
            renewals_total,
            deregistrations_total,
            evictions_total,
            status_changes_total,
            services,
            instances,
            instances_up,
            registry,
        })
    }

    /// Count one registry change
    pub fn record_event(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::Registered { .. } => self.registrations_total.inc(),
            RegistryEvent::Renewed { .. } => self.renewals_total.inc(),
            RegistryEvent::StatusChanged { .. } => self.status_changes_total.inc(),
            RegistryEvent::Deregistered { .. } => self.deregistrations_total.inc(),
            RegistryEvent::Evicted { .. } => self.evictions_total.inc(),
        }
    }

    /// Copy table sizes into the gauges
    pub fn update_table_gauges(&self, stats: &RegistryStats) {
        self.services.set(stats.services as i64);
        self.instances.set(stats.instances as i64);
        self.instances_up.set(stats.up as i64);
    }

    /// Count registry events until the channel closes
    pub fn spawn_event_recorder(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<RegistryEvent>,
    ) -> JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => collector.record_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Metrics recorder fell behind registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Registry event recorder stopped");
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
