//! HTTP/1 accept loop for the registry API

use crate::handler::{handle_request, ApiState};
use crate::metrics::MetricsCollector;
use anyhow::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use registry_core::Registry;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Serves the registry API on a TCP listener
pub struct DiscoveryServer {
    state: Arc<ApiState>,
}

impl DiscoveryServer {
    pub fn new(registry: Arc<dyn Registry>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            state: Arc::new(ApiState::new(registry, metrics)),
        }
    }

    pub fn state(&self) -> Arc<ApiState> {
        self.state.clone()
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// accepted run to completion on their own tasks.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        info!("Registry API listening on {}", local_addr);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Error accepting connection: {}", e);
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let state = self.state.clone();

                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| handle_request(req, state.clone()));

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, service)
                            .await
                        {
                            debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Registry API on {} stopped accepting connections", local_addr);
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::ServiceRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    async fn raw_request(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = DiscoveryServer::new(
            Arc::new(ServiceRegistry::new()),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(listener, async {
            let _ = stopped.await;
        }));

        let response = raw_request(
            addr,
            "GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("OK\n"));

        let body = r#"{"instanceId":"orders-1","address":"10.0.0.5:8080"}"#;
        let response = raw_request(
            addr,
            &format!(
                "POST /v1/services/orders/instances HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            ),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 201 Created"));

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
