//! In-process registry server for client tests

use registry_core::{ManualClock, RegistryConfig, ServiceRegistry};
use registry_http::{DiscoveryServer, MetricsCollector};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub(crate) struct TestServer {
    pub registry: Arc<ServiceRegistry>,
    pub clock: ManualClock,
    pub base_url: String,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub(crate) async fn start_server() -> TestServer {
    let clock = ManualClock::default();
    let registry = Arc::new(ServiceRegistry::with_clock(
        RegistryConfig::default(),
        Arc::new(clock.clone()),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let server = DiscoveryServer::new(registry.clone(), Arc::new(MetricsCollector::new().unwrap()));
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.serve(listener, async {
        let _ = stopped.await;
    }));

    TestServer {
        registry,
        clock,
        base_url,
        stop: Some(stop),
    }
}
