//! Request dispatch from HTTP onto registry operations

use crate::error::ApiError;
use crate::metrics::MetricsCollector;
use crate::routes::{query_param, Route};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use registry_core::{InstanceAddress, InstanceStatus, Registration, Registry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state for request handlers
pub struct ApiState {
    pub registry: Arc<dyn Registry>,
    pub metrics: Arc<MetricsCollector>,
}

impl ApiState {
    pub fn new(registry: Arc<dyn Registry>, metrics: Arc<MetricsCollector>) -> Self {
        Self { registry, metrics }
    }
}

/// Registration body; the service name comes from the path
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    /// Defaults to the `host:port` of the address when absent
    #[serde(default)]
    instance_id: Option<String>,
    address: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    lease_duration_seconds: u64,
}

#[derive(Serialize)]
struct DeregisterReply {
    removed: bool,
}

/// Handle one API request. Never fails; errors become JSON responses.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = Route::parse(&path);
    let label = route.as_ref().map(Route::label).unwrap_or("unmatched");

    state
        .metrics
        .http_requests_total
        .with_label_values(&[method.as_str(), label])
        .inc();

    let response = match route {
        Some(route) => dispatch(req, route, &state).await,
        None => Err(ApiError::RouteNotFound(path.clone())),
    }
    .unwrap_or_else(|e| {
        if e.status().is_server_error() {
            warn!("{} {} failed: {}", method, path, e);
        } else {
            debug!("{} {} rejected: {}", method, path, e);
        }
        e.into_response()
    });

    let status = response.status().as_u16();
    state
        .metrics
        .http_responses_total
        .with_label_values(&[&status.to_string()])
        .inc();
    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[method.as_str(), label])
        .observe(start.elapsed().as_secs_f64());

    debug!("{} {} -> {}", method, path, status);
    Ok(response)
}

async fn dispatch<B>(
    req: Request<B>,
    route: Route,
    state: &ApiState,
) -> Result<Response<Full<Bytes>>, ApiError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let query = req.uri().query().map(str::to_string);
    let registry = &state.registry;

    match (route, method) {
        (Route::Health, Method::GET) => Ok(text_response(StatusCode::OK, "OK\n")),

        (Route::Metrics, Method::GET) => {
            state
                .metrics
                .update_table_gauges(&registry.stats().await);
            let text = state
                .metrics
                .gather()
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let mut response = text_response(StatusCode::OK, text);
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(response)
        }

        (Route::Services, Method::GET) => json_response(StatusCode::OK, &registry.services().await),

        (Route::Instances { service }, Method::GET) => {
            let all = query_param(query.as_deref(), "all")
                .is_some_and(|value| value.is_empty() || value.eq_ignore_ascii_case("true"));
            let instances = if all {
                registry.lookup_all(&service).await
            } else {
                registry.lookup(&service).await
            };
            json_response(StatusCode::OK, &instances)
        }

        (Route::Instances { service }, Method::POST) => {
            let body = read_body(req.into_body()).await?;
            let body: RegisterBody = serde_json::from_slice(&body)
                .map_err(|e| ApiError::BadRequest(format!("invalid registration body: {}", e)))?;

            let instance_id = match body.instance_id {
                Some(id) => id,
                None => body.address.parse::<InstanceAddress>()?.authority(),
            };
            let registration = Registration {
                service_name: service,
                instance_id,
                address: body.address,
                metadata: body.metadata,
                lease_duration_seconds: body.lease_duration_seconds,
            };
            let instance = registry.register(registration).await?;
            json_response(StatusCode::CREATED, &instance)
        }

        (Route::Instance { service, instance }, Method::GET) => {
            json_response(StatusCode::OK, &registry.get(&service, &instance).await?)
        }

        (Route::Instance { service, instance }, Method::DELETE) => {
            let removed = registry.deregister(&service, &instance).await;
            json_response(StatusCode::OK, &DeregisterReply { removed })
        }

        (Route::Heartbeat { service, instance }, Method::PUT) => {
            json_response(StatusCode::OK, &registry.renew(&service, &instance).await?)
        }

        (Route::Status { service, instance }, Method::PUT) => {
            let value = query_param(query.as_deref(), "value")
                .ok_or_else(|| ApiError::BadRequest("missing 'value' parameter".to_string()))?;
            let status: InstanceStatus = value
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("unknown status '{}'", value)))?;
            json_response(
                StatusCode::OK,
                &registry.set_status(&service, &instance, status).await?,
            )
        }

        (_, method) => Err(ApiError::MethodNotAllowed(method)),
    }
}

/// Collect a request body, refusing anything over [`MAX_BODY_BYTES`]
async fn read_body<B>(body: B) -> Result<Bytes, ApiError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ApiError::PayloadTooLarge(MAX_BODY_BYTES))
        }
        Err(e) => Err(ApiError::BadRequest(format!("failed to read body: {}", e))),
    }
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Result<Response<Full<Bytes>>, ApiError> {
    let bytes = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(text.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
