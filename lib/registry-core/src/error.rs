use crate::instance::InstanceStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    /// Never registered, deregistered, or lease expired. The three are
    /// indistinguishable to callers.
    #[error("Instance not found: {service}/{instance}")]
    NotFound { service: String, instance: String },

    #[error("Invalid registry configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

impl RegistryError {
    pub(crate) fn not_found(service: &str, instance: &str) -> Self {
        RegistryError::NotFound {
            service: service.to_string(),
            instance: instance.to_string(),
        }
    }
}
