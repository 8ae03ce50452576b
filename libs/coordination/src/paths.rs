//! Node path layout.
//!
//! ```text
//! /services/{service_id}                    ServiceDefinition
//! /services/{service_id}/{instance_id}      InstanceState
//! /hosts/{host_id}                          directory
//! /hosts/{host_id}/{instance_id}            Assignment
//! /pools/{pool_id}/{host_id}                PoolMember
//! /scheduler                                election root
//! /scheduler/leader                         LeaderRecord
//! /snapshots/requests/{request_id}          SnapshotRequest
//! ```

use convoy_id::{HostId, InstanceId, PoolId, ServiceId, SnapshotRequestId};

use crate::error::{CoordError, Result};

pub const ROOT: &str = "/";
pub const SERVICES: &str = "/services";
pub const HOSTS: &str = "/hosts";
pub const POOLS: &str = "/pools";
pub const SCHEDULER: &str = "/scheduler";
pub const SNAPSHOT_REQUESTS: &str = "/snapshots/requests";

/// Name of the leader record node under an election path.
pub const LEADER_NODE: &str = "leader";

pub fn service(id: &ServiceId) -> String {
    format!("{SERVICES}/{id}")
}

pub fn instance_state(service_id: &ServiceId, instance_id: &InstanceId) -> String {
    format!("{SERVICES}/{service_id}/{instance_id}")
}

pub fn host(id: &HostId) -> String {
    format!("{HOSTS}/{id}")
}

pub fn assignment(host_id: &HostId, instance_id: &InstanceId) -> String {
    format!("{HOSTS}/{host_id}/{instance_id}")
}

pub fn pool(id: &PoolId) -> String {
    format!("{POOLS}/{id}")
}

pub fn pool_member(pool_id: &PoolId, host_id: &HostId) -> String {
    format!("{POOLS}/{pool_id}/{host_id}")
}

pub fn snapshot_request(id: &SnapshotRequestId) -> String {
    format!("{SNAPSHOT_REQUESTS}/{id}")
}

/// Leader record path under an election path.
pub fn leader_record(election: &str) -> String {
    join(election, LEADER_NODE)
}

/// Joins a parent path and a single child segment.
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a non-root path.
pub fn parent(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) if path != ROOT => Some(ROOT),
        Some((parent, _)) if !parent.is_empty() => Some(parent),
        _ => None,
    }
}

/// Checks that `path` is absolute with no empty segments or trailing slash.
pub fn validate(path: &str) -> Result<()> {
    if path == ROOT {
        return Ok(());
    }
    let valid = path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|segment| !segment.is_empty());
    if valid {
        Ok(())
    } else {
        Err(CoordError::InvalidPath(path.to_string()))
    }
}
