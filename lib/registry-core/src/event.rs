//! Registry change notifications

use crate::instance::{InstanceStatus, ServiceInstance};

/// A change applied to the registry table
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryEvent {
    Registered {
        instance: ServiceInstance,
        /// A live entry with the same key was replaced
        replaced: bool,
    },
    Renewed {
        service_name: String,
        instance_id: String,
        /// The renewal moved the instance from STARTING to UP
        promoted: bool,
    },
    StatusChanged {
        service_name: String,
        instance_id: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    Deregistered {
        service_name: String,
        instance_id: String,
    },
    Evicted {
        instance: ServiceInstance,
    },
}

impl RegistryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::Registered { .. } => "registered",
            RegistryEvent::Renewed { .. } => "renewed",
            RegistryEvent::StatusChanged { .. } => "status_changed",
            RegistryEvent::Deregistered { .. } => "deregistered",
            RegistryEvent::Evicted { .. } => "evicted",
        }
    }
}
