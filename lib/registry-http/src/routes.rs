//! Path matching for the registry API

/// A recognised API path. Method checks happen in the handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// `/healthz`
    Health,
    /// `/metrics`
    Metrics,
    /// `/v1/services`
    Services,
    /// `/v1/services/{service}/instances`
    Instances { service: String },
    /// `/v1/services/{service}/instances/{instance}`
    Instance { service: String, instance: String },
    /// `/v1/services/{service}/instances/{instance}/heartbeat`
    Heartbeat { service: String, instance: String },
    /// `/v1/services/{service}/instances/{instance}/status`
    Status { service: String, instance: String },
}

impl Route {
    /// Match a request path; `None` when nothing matches
    pub fn parse(path: &str) -> Option<Route> {
        let trimmed = path.trim_matches('/');
        let segments: Vec<String> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed
                .split('/')
                .map(percent_decode)
                .collect::<Option<Vec<_>>>()?
        };
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        match segments.as_slice() {
            ["healthz"] => Some(Route::Health),
            ["metrics"] => Some(Route::Metrics),
            ["v1", "services"] => Some(Route::Services),
            ["v1", "services", service, "instances"] if !service.is_empty() => {
                Some(Route::Instances {
                    service: service.to_string(),
                })
            }
            ["v1", "services", service, "instances", instance]
                if !service.is_empty() && !instance.is_empty() =>
            {
                Some(Route::Instance {
                    service: service.to_string(),
                    instance: instance.to_string(),
                })
            }
            ["v1", "services", service, "instances", instance, "heartbeat"]
                if !service.is_empty() && !instance.is_empty() =>
            {
                Some(Route::Heartbeat {
                    service: service.to_string(),
                    instance: instance.to_string(),
                })
            }
            ["v1", "services", service, "instances", instance, "status"]
                if !service.is_empty() && !instance.is_empty() =>
            {
                Some(Route::Status {
                    service: service.to_string(),
                    instance: instance.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Low-cardinality label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Route::Health => "/healthz",
            Route::Metrics => "/metrics",
            Route::Services => "/v1/services",
            Route::Instances { .. } => "/v1/services/{service}/instances",
            Route::Instance { .. } => "/v1/services/{service}/instances/{instance}",
            Route::Heartbeat { .. } => "/v1/services/{service}/instances/{instance}/heartbeat",
            Route::Status { .. } => "/v1/services/{service}/instances/{instance}/status",
        }
    }
}

/// Look up a query parameter, percent-decoding its value
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| percent_decode(&value.replace('+', " ")))
        })
        .next()
        .flatten()
}

/// Decode `%XX` escapes. Returns `None` for truncated or non-UTF-8 input.
fn percent_decode(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_routes() {
        assert_eq!(Route::parse("/healthz"), Some(Route::Health));
        assert_eq!(Route::parse("/metrics"), Some(Route::Metrics));
        assert_eq!(Route::parse("/v1/services"), Some(Route::Services));
        assert_eq!(Route::parse("/v1/services/"), Some(Route::Services));
        assert_eq!(Route::parse("/"), None);
        assert_eq!(Route::parse("/v2/services"), None);
    }

    #[test]
    fn test_instance_routes() {
        assert_eq!(
            Route::parse("/v1/services/orders/instances"),
            Some(Route::Instances {
                service: "orders".to_string()
            })
        );
        assert_eq!(
            Route::parse("/v1/services/orders/instances/orders-1"),
            Some(Route::Instance {
                service: "orders".to_string(),
                instance: "orders-1".to_string()
            })
        );
        assert_eq!(
            Route::parse("/v1/services/orders/instances/orders-1/heartbeat"),
            Some(Route::Heartbeat {
                service: "orders".to_string(),
                instance: "orders-1".to_string()
            })
        );
        assert_eq!(
            Route::parse("/v1/services/orders/instances/orders-1/status"),
            Some(Route::Status {
                service: "orders".to_string(),
                instance: "orders-1".to_string()
            })
        );
        assert_eq!(Route::parse("/v1/services/orders/instances/orders-1/other"), None);
        assert_eq!(Route::parse("/v1/services//instances"), None);
    }

    #[test]
    fn test_percent_decoded_segments() {
        assert_eq!(
            Route::parse("/v1/services/orders/instances/10.0.0.5%3A8080"),
            Some(Route::Instance {
                service: "orders".to_string(),
                instance: "10.0.0.5:8080".to_string()
            })
        );
        assert_eq!(Route::parse("/v1/services/orders/instances/bad%2"), None);
        assert_eq!(Route::parse("/v1/services/orders/instances/bad%zz"), None);
    }

    #[test]
    fn test_route_labels() {
        let route = Route::parse("/v1/services/orders/instances/orders-1/heartbeat").unwrap();
        assert_eq!(
            route.label(),
            "/v1/services/{service}/instances/{instance}/heartbeat"
        );
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("all=true"), "all"), Some("true".to_string()));
        assert_eq!(
            query_param(Some("x=1&value=OUT_OF_SERVICE"), "value"),
            Some("OUT_OF_SERVICE".to_string())
        );
        assert_eq!(query_param(Some("all"), "all"), Some(String::new()));
        assert_eq!(query_param(Some("x=1"), "all"), None);
        assert_eq!(query_param(None, "all"), None);
    }
}
