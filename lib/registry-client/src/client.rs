//! HTTP client for the registry API

use crate::error::{ClientError, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use registry_core::{Registration, ServiceInstance};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    instance_id: &'a str,
    address: &'a str,
    metadata: &'a BTreeMap<String, String>,
    lease_duration_seconds: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct DeregisterReply {
    removed: bool,
}

/// Registry API client with connection pooling and a per-request timeout
#[derive(Clone)]
pub struct DiscoveryClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl DiscoveryClient {
    /// Create a client for the registry at `base_url` (e.g. `http://localhost:8761`)
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let uri: Uri = base_url
            .parse()
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if uri.scheme_str() != Some("http") || uri.host().is_none() {
            return Err(ClientError::InvalidUrl(format!(
                "{}: expected http://host[:port]",
                base_url
            )));
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register an instance; it stays STARTING until the first renewal
    pub async fn register(&self, registration: &Registration) -> Result<ServiceInstance> {
        let body = serde_json::to_vec(&RegisterBody {
            instance_id: &registration.instance_id,
            address: &registration.address,
            metadata: &registration.metadata,
            lease_duration_seconds: registration.lease_duration_seconds,
        })?;
        let path = format!(
            "/v1/services/{}/instances",
            encode_segment(&registration.service_name)
        );
        let (status, bytes) = self.send(Method::POST, &path, Some(body)).await?;
        match status {
            StatusCode::CREATED | StatusCode::OK => Ok(serde_json::from_slice(&bytes)?),
            _ => Err(self.error_for(status, &bytes, &registration.service_name, &registration.instance_id)),
        }
    }

    /// Refresh an instance lease
    pub async fn renew(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance> {
        let path = format!(
            "/v1/services/{}/instances/{}/heartbeat",
            encode_segment(service_name),
            encode_segment(instance_id)
        );
        let (status, bytes) = self.send(Method::PUT, &path, None).await?;
        match status {
            StatusCode::OK => Ok(serde_json::from_slice(&bytes)?),
            _ => Err(self.error_for(status, &bytes, service_name, instance_id)),
        }
    }

    /// Remove an instance. Returns whether the registry still held it.
    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<bool> {
        let path = format!(
            "/v1/services/{}/instances/{}",
            encode_segment(service_name),
            encode_segment(instance_id)
        );
        let (status, bytes) = self.send(Method::DELETE, &path, None).await?;
        match status {
            StatusCode::OK => Ok(serde_json::from_slice::<DeregisterReply>(&bytes)?.removed),
            _ => Err(self.error_for(status, &bytes, service_name, instance_id)),
        }
    }

    /// UP instances of a service, in registration order
    pub async fn lookup(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let path = format!("/v1/services/{}/instances", encode_segment(service_name));
        self.get_json(&path, service_name).await
    }

    /// Every instance of a service regardless of status
    pub async fn lookup_all(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let path = format!(
            "/v1/services/{}/instances?all=true",
            encode_segment(service_name)
        );
        self.get_json(&path, service_name).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, service_name: &str) -> Result<T> {
        let (status, bytes) = self.send(Method::GET, path, None).await?;
        match status {
            StatusCode::OK => Ok(serde_json::from_slice(&bytes)?),
            _ => Err(self.error_for(status, &bytes, service_name, "")),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes)> {
        let url = format!("{}{}", self.base_url, path);
        let uri: Uri = url
            .parse()
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", url, e)))?;

        let has_body = body.is_some();
        let mut request = Request::new(Full::new(Bytes::from(body.unwrap_or_default())));
        *request.method_mut() = method.clone();
        *request.uri_mut() = uri;
        if has_body {
            request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        debug!("{} {}", method, url);

        // The deadline covers the body as well as the response head
        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = response.into_body().collect().await?.to_bytes();
            Ok::<_, ClientError>((status, bytes))
        };
        let (status, bytes) = tokio_timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        debug!("{} {} -> {}", method, url, status);

        Ok((status, bytes))
    }

    fn error_for(
        &self,
        status: StatusCode,
        bytes: &Bytes,
        service_name: &str,
        instance_id: &str,
    ) -> ClientError {
        let message = serde_json::from_slice::<ErrorBody>(bytes)
            .map(|body| body.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned());

        match status {
            StatusCode::BAD_REQUEST => ClientError::InvalidInstance(message),
            StatusCode::NOT_FOUND => ClientError::NotFound {
                service: service_name.to_string(),
                instance: instance_id.to_string(),
            },
            _ => ClientError::UnexpectedStatus {
                status: status.as_u16(),
                body: message,
            },
        }
    }
}

/// Percent-encode a path segment, leaving RFC 3986 unreserved characters
fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{start_server, TestServer};
    use registry_core::InstanceStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn client(server: &TestServer) -> DiscoveryClient {
        DiscoveryClient::new(&server.base_url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("orders-1"), "orders-1");
        assert_eq!(encode_segment("10.0.0.5:8080"), "10.0.0.5%3A8080");
        assert_eq!(encode_segment("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(DiscoveryClient::new("not a url", Duration::from_secs(1)).is_err());
        assert!(DiscoveryClient::new("https://registry:8761", Duration::from_secs(1)).is_err());
        let client = DiscoveryClient::new("http://registry:8761/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://registry:8761");
    }

    #[tokio::test]
    async fn test_register_renew_lookup() {
        let server = start_server().await;
        let client = client(&server);

        let registration =
            Registration::new("orders", "orders-1", "10.0.0.5:8080").with_lease_seconds(30);
        let registered = client.register(&registration).await.unwrap();
        assert_eq!(registered.status, InstanceStatus::Starting);
        assert!(client.lookup("orders").await.unwrap().is_empty());

        let renewed = client.renew("orders", "orders-1").await.unwrap();
        assert_eq!(renewed.status, InstanceStatus::Up);

        let instances = client.lookup("orders").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].address.as_str(), "10.0.0.5:8080");
    }

    #[tokio::test]
    async fn test_lease_expiry_is_not_found() {
        let server = start_server().await;
        let client = client(&server);

        let registration =
            Registration::new("orders", "orders-1", "10.0.0.5:8080").with_lease_seconds(30);
        client.register(&registration).await.unwrap();
        client.renew("orders", "orders-1").await.unwrap();

        server.clock.advance(Duration::from_secs(31));
        server.registry.evict_expired().await;

        assert!(client.lookup("orders").await.unwrap().is_empty());
        assert!(matches!(
            client.renew("orders", "orders-1").await,
            Err(ClientError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_renew_unknown() {
        let server = start_server().await;
        let client = client(&server);

        match client.renew("orders", "orders-2").await {
            Err(ClientError::NotFound { service, instance }) => {
                assert_eq!(service, "orders");
                assert_eq!(instance, "orders-2");
            }
            other => panic!("expected NotFound, got {:?}", other.map(|i| i.instance_id)),
        }
    }

    #[tokio::test]
    async fn test_register_invalid() {
        let server = start_server().await;
        let client = client(&server);

        let result = client
            .register(&Registration::new("orders", "x", "10.0.0.5"))
            .await;
        match result {
            Err(ClientError::InvalidInstance(message)) => assert!(message.contains("port")),
            other => panic!("expected InvalidInstance, got {:?}", other.map(|i| i.instance_id)),
        }
    }

    #[tokio::test]
    async fn test_deregister_twice() {
        let server = start_server().await;
        let client = client(&server);

        client
            .register(&Registration::new("orders", "10.0.0.5:8080", "10.0.0.5:8080"))
            .await
            .unwrap();
        assert!(client.deregister("orders", "10.0.0.5:8080").await.unwrap());
        assert!(!client.deregister("orders", "10.0.0.5:8080").await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_all() {
        let server = start_server().await;
        let client = client(&server);

        client
            .register(&Registration::new("orders", "orders-1", "10.0.0.5:8080"))
            .await
            .unwrap();
        let all = client.lookup_all("orders").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn test_stalled_response_body_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n[",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let timeout = Duration::from_millis(200);
        let client = DiscoveryClient::new(format!("http://{}", addr), timeout).unwrap();
        let started = std::time::Instant::now();
        let result = client.lookup("orders").await;

        assert!(matches!(result, Err(ClientError::Timeout(t)) if t == timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DiscoveryClient::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.lookup("orders").await,
            Err(ClientError::Http(_))
        ));
    }
}
