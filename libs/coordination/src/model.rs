//! Records stored in coordination nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convoy_id::{HostId, InstanceId, PoolId, ServiceId, SnapshotRequestId};
use serde::{Deserialize, Serialize};

pub use convoy_reconcile::{DesiredState, Lifecycle};

/// Operator-declared desired state of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: ServiceId,

    #[serde(default)]
    pub name: String,

    /// Desired number of instances.
    pub instances: u32,

    /// Resource pool whose hosts may run this service.
    pub pool_id: PoolId,

    pub desired_state: DesiredState,

    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One desired instance slot, bound to a host by the leader.
///
/// Lives at `/hosts/{host_id}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Instance ID. Also the container name.
    pub id: InstanceId,
    pub service_id: ServiceId,
    pub host_id: HostId,
    pub instance_index: u32,

    /// `Stop` asks the host to terminate the instance without the leader
    /// deleting the slot itself.
    pub desired_state: DesiredState,
}

impl Assignment {
    pub fn new(service_id: ServiceId, host_id: HostId, instance_index: u32) -> Self {
        Self {
            id: InstanceId::new(),
            service_id,
            host_id,
            instance_index,
            desired_state: DesiredState::Run,
        }
    }
}

/// Host side of a published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// `"{proto}/{port}"` to host bindings, e.g. `"8080/tcp"`.
pub type PortMapping = BTreeMap<String, Vec<PortBinding>>;

/// Actual state of one instance.
///
/// Lives at `/services/{service_id}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: InstanceId,
    pub service_id: ServiceId,
    pub host_id: HostId,
    pub instance_index: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_id: Option<String>,

    #[serde(default)]
    pub lifecycle: Lifecycle,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    #[serde(default)]
    pub port_mapping: PortMapping,
}

impl InstanceState {
    /// Fresh, never-started state for an assignment.
    pub fn for_assignment(assignment: &Assignment) -> Self {
        Self {
            id: assignment.id,
            service_id: assignment.service_id.clone(),
            host_id: assignment.host_id.clone(),
            instance_index: assignment.instance_index,
            docker_id: None,
            lifecycle: Lifecycle::NeverStarted,
            private_ip: None,
            port_mapping: PortMapping::new(),
        }
    }
}

/// Host membership of a resource pool.
///
/// Lives at `/pools/{pool_id}/{host_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMember {
    pub host_id: HostId,
    pub registered_at: DateTime<Utc>,
}

/// Holder of an election path. Written by the election primitive only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub host_id: HostId,

    /// Assigned on acquisition; strictly increasing per election path.
    #[serde(default)]
    pub version: u64,
}

impl LeaderRecord {
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            version: 0,
        }
    }
}

/// Queued snapshot request.
///
/// Lives at `/snapshots/requests/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub id: SnapshotRequestId,
    pub service_id: ServiceId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub requested_at: DateTime<Utc>,
}

impl SnapshotRequest {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            id: SnapshotRequestId::new(),
            service_id,
            label: None,
            error: None,
            requested_at: Utc::now(),
        }
    }

    /// A request with a label or an error has already been handled.
    pub fn is_processed(&self) -> bool {
        self.label.is_some() || self.error.is_some()
    }
}
