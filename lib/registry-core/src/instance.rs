//! Service instance records, statuses and address parsing

use crate::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

/// Lifecycle status of a registered instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Registered but not yet confirmed by a renewal
    Starting,
    /// Confirmed alive and advertised to consumers
    Up,
    /// Failed or expired
    Down,
    /// Alive but administratively withdrawn from lookups
    OutOfService,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STARTING" => Ok(InstanceStatus::Starting),
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            other => Err(RegistryError::InvalidInstance(format!(
                "unknown status: {}",
                other
            ))),
        }
    }
}

/// Network location of an instance.
///
/// Accepts `host:port`, `[ipv6]:port` and `scheme://host[:port][/path]`. The
/// text as given is kept and is what gets serialized back to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceAddress {
    raw: String,
    scheme: Option<String>,
    host: String,
    port: u16,
}

impl InstanceAddress {
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `host:port`, bracketing IPv6 hosts
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for InstanceAddress {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(invalid_address(raw, "address is empty"));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid_address(raw, "address contains whitespace"));
        }

        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => {
                let valid_scheme = scheme
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic())
                    && scheme
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
                if !valid_scheme {
                    return Err(invalid_address(raw, "invalid scheme"));
                }
                (Some(scheme.to_ascii_lowercase()), rest)
            }
            None => (None, raw),
        };

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        if scheme.is_none() && authority_end != rest.len() {
            return Err(invalid_address(raw, "a path requires a scheme"));
        }
        let authority = &rest[..authority_end];
        if authority.contains('@') {
            return Err(invalid_address(raw, "credentials are not allowed"));
        }

        let (host, port) = split_host_port(raw, authority)?;
        let port = match (port, scheme.as_deref()) {
            (Some(port), _) => port,
            (None, Some("http")) => 80,
            (None, Some("https")) => 443,
            (None, _) => return Err(invalid_address(raw, "missing port")),
        };
        if port == 0 {
            return Err(invalid_address(raw, "port must be non-zero"));
        }

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for InstanceAddress {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<InstanceAddress> for String {
    fn from(address: InstanceAddress) -> Self {
        address.raw
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_host_port<'a>(raw: &str, authority: &'a str) -> Result<(&'a str, Option<u16>)> {
    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| invalid_address(raw, "unterminated IPv6 literal"))?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(invalid_address(raw, "invalid IPv6 literal"));
        }
        let port = match after {
            "" => None,
            _ => {
                let port = after
                    .strip_prefix(':')
                    .ok_or_else(|| invalid_address(raw, "unexpected text after IPv6 literal"))?;
                Some(parse_port(raw, port)?)
            }
        };
        return Ok((host, port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(parse_port(raw, port)?)),
        None => (authority, None),
    };

    if host.is_empty() {
        return Err(invalid_address(raw, "missing host"));
    }
    if host.len() > 253 {
        return Err(invalid_address(raw, "host is too long"));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
    {
        return Err(invalid_address(raw, "invalid host"));
    }

    Ok((host, port))
}

fn parse_port(raw: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| invalid_address(raw, "invalid port"))
}

fn invalid_address(raw: &str, reason: &str) -> RegistryError {
    RegistryError::InvalidInstance(format!("malformed address '{}': {}", raw, reason))
}

/// Trim and lowercase a service name
pub fn normalize_service_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RegistryError::InvalidInstance(
            "service name must not be empty".to_string(),
        ));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(RegistryError::InvalidInstance(
            "service name contains control characters".to_string(),
        ));
    }
    Ok(name.to_ascii_lowercase())
}

/// Trim an instance id. Ids stay case-sensitive.
pub fn normalize_instance_id(id: &str) -> Result<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(RegistryError::InvalidInstance(
            "instance id must not be empty".to_string(),
        ));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(RegistryError::InvalidInstance(
            "instance id contains control characters".to_string(),
        ));
    }
    Ok(id.to_string())
}

/// Input to a registration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Requested lease in seconds; 0 selects the registry default
    #[serde(default)]
    pub lease_duration_seconds: u64,
}

impl Registration {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
            lease_duration_seconds: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_lease_seconds(mut self, seconds: u64) -> Self {
        self.lease_duration_seconds = seconds;
        self
    }
}

/// Snapshot of one registered instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub address: InstanceAddress,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub lease_duration_seconds: u64,
    pub registered_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
    /// Always `last_renewed_at + lease_duration_seconds`, never client-supplied
    pub lease_expiry: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry < now
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let address: InstanceAddress = "10.0.0.5:8080".parse().unwrap();
        assert_eq!(address.host(), "10.0.0.5");
        assert_eq!(address.port(), 8080);
        assert_eq!(address.scheme(), None);
        assert_eq!(address.to_string(), "10.0.0.5:8080");
    }

    #[test]
    fn test_parse_hostname() {
        let address: InstanceAddress = "product-service.internal:8082".parse().unwrap();
        assert_eq!(address.host(), "product-service.internal");
        assert_eq!(address.authority(), "product-service.internal:8082");
    }

    #[test]
    fn test_parse_ipv6() {
        let address: InstanceAddress = "[::1]:9000".parse().unwrap();
        assert_eq!(address.host(), "::1");
        assert_eq!(address.port(), 9000);
        assert_eq!(address.authority(), "[::1]:9000");
    }

    #[test]
    fn test_parse_uri_with_default_ports() {
        let http: InstanceAddress = "http://orders.local/api".parse().unwrap();
        assert_eq!(http.scheme(), Some("http"));
        assert_eq!(http.port(), 80);
        assert_eq!(http.as_str(), "http://orders.local/api");

        let https: InstanceAddress = "HTTPS://orders.local".parse().unwrap();
        assert_eq!(https.scheme(), Some("https"));
        assert_eq!(https.port(), 443);
    }

    #[test]
    fn test_parse_uri_with_explicit_port() {
        let address: InstanceAddress = "grpc://10.1.2.3:50051".parse().unwrap();
        assert_eq!(address.scheme(), Some("grpc"));
        assert_eq!(address.port(), 50051);
    }

    #[test]
    fn test_malformed_addresses() {
        for bad in [
            "",
            "   ",
            "10.0.0.5",
            "10.0.0.5:",
            "10.0.0.5:0",
            "10.0.0.5:70000",
            ":8080",
            "host name:80",
            "grpc://10.0.0.5",
            "10.0.0.5:8080/path",
            "[::1",
            "[zz::1]:80",
            "::1:80",
            "http://user@host:80",
            "1http://host:80",
        ] {
            let result = bad.parse::<InstanceAddress>();
            assert!(
                matches!(result, Err(RegistryError::InvalidInstance(_))),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_status_round_trip_text() {
        for status in [
            InstanceStatus::Starting,
            InstanceStatus::Up,
            InstanceStatus::Down,
            InstanceStatus::OutOfService,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert_eq!("out_of_service".parse::<InstanceStatus>().unwrap(), InstanceStatus::OutOfService);
        assert!("UNKNOWN".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&InstanceStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUT_OF_SERVICE\"");
    }

    #[test]
    fn test_normalize_service_name() {
        assert_eq!(normalize_service_name("  Orders ").unwrap(), "orders");
        assert!(normalize_service_name("").is_err());
        assert!(normalize_service_name("   ").is_err());
    }

    #[test]
    fn test_normalize_instance_id_keeps_case() {
        assert_eq!(normalize_instance_id(" Orders-1 ").unwrap(), "Orders-1");
        assert!(normalize_instance_id("").is_err());
    }

    #[test]
    fn test_registration_deserializes_with_defaults() {
        let registration: Registration = serde_json::from_str(
            r#"{"serviceName":"orders","instanceId":"orders-1","address":"10.0.0.5:8080"}"#,
        )
        .unwrap();
        assert!(registration.metadata.is_empty());
        assert_eq!(registration.lease_duration_seconds, 0);
    }
}
