use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use registry_core::RegistryError;
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced to HTTP callers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error("No route for {0}")]
    RouteNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Registry(RegistryError::InvalidInstance(_)) => StatusCode::BAD_REQUEST,
            ApiError::Registry(RegistryError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Registry(RegistryError::InvalidStatusTransition { .. }) => StatusCode::CONFLICT,
            ApiError::Registry(RegistryError::InvalidConfiguration(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error name
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Registry(RegistryError::InvalidInstance(_)) => "InvalidInstance",
            ApiError::Registry(RegistryError::NotFound { .. }) => "NotFound",
            ApiError::Registry(RegistryError::InvalidStatusTransition { .. }) => {
                "InvalidStatusTransition"
            }
            ApiError::Registry(RegistryError::InvalidConfiguration(_)) => "InvalidConfiguration",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::PayloadTooLarge(_) => "PayloadTooLarge",
            ApiError::MethodNotAllowed(_) => "MethodNotAllowed",
            ApiError::RouteNotFound(_) => "RouteNotFound",
            ApiError::Internal(_) => "Internal",
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        // Serializing two strings cannot fail
        let bytes = serde_json::to_vec(&body).unwrap_or_default();

        let mut response = Response::new(Full::new(Bytes::from(bytes)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let ApiError::MethodNotAllowed(_) = self {
            response.headers_mut().insert(
                hyper::header::ALLOW,
                HeaderValue::from_static("GET, POST, PUT, DELETE"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_registry_error_statuses() {
        assert_eq!(
            ApiError::from(RegistryError::InvalidInstance("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RegistryError::NotFound {
                service: "orders".into(),
                instance: "orders-2".into()
            })
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RegistryError::InvalidStatusTransition {
                from: registry_core::InstanceStatus::Up,
                to: registry_core::InstanceStatus::Starting,
            })
            .status(),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = ApiError::BadRequest("missing address".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "BadRequest");
        assert_eq!(json["message"], "Bad request: missing address");
    }
}
