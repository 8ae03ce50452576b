//! Shared fixtures for scheduler tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use convoy_coord::{
    node, paths, Assignment, Coordinator, DesiredState, InstanceState, MemoryCoordinator,
    PoolMember, ServiceDefinition,
};
use convoy_id::{HostId, PoolId, ServiceId};
use convoy_scheduler::PlacementPolicy;

pub fn host(name: &str) -> HostId {
    HostId::parse(name).unwrap()
}

pub fn pool() -> PoolId {
    PoolId::parse("default").unwrap()
}

pub fn service_def(name: &str, instances: u32) -> ServiceDefinition {
    ServiceDefinition {
        id: ServiceId::parse(name).unwrap(),
        name: name.to_string(),
        instances,
        pool_id: pool(),
        desired_state: DesiredState::Run,
        image: "nginx:1.27".to_string(),
        command: vec![],
        env: BTreeMap::new(),
    }
}

pub async fn put_service(coord: &MemoryCoordinator, svc: &ServiceDefinition) {
    node::create_record(coord, &paths::service(&svc.id), svc)
        .await
        .unwrap();
}

pub async fn seed_pool(coord: &MemoryCoordinator, hosts: &[&str]) {
    for name in hosts {
        let member = PoolMember {
            host_id: host(name),
            registered_at: Utc::now(),
        };
        node::create_record(coord, &paths::pool_member(&pool(), &member.host_id), &member)
            .await
            .unwrap();
    }
}

/// Records an instance the way the leader places one.
pub async fn place(
    coord: &MemoryCoordinator,
    svc: &ServiceDefinition,
    host_name: &str,
    index: u32,
) -> Assignment {
    let assignment = Assignment::new(svc.id.clone(), host(host_name), index);
    node::create_record(
        coord,
        &paths::instance_state(&svc.id, &assignment.id),
        &InstanceState::for_assignment(&assignment),
    )
    .await
    .unwrap();
    node::create_record(
        coord,
        &paths::assignment(&assignment.host_id, &assignment.id),
        &assignment,
    )
    .await
    .unwrap();
    assignment
}

/// Every assignment of `service_id`, across all hosts, by instance index.
pub async fn assignments_of(coord: &MemoryCoordinator, service_id: &ServiceId) -> Vec<Assignment> {
    let mut found = Vec::new();
    let hosts = coord.children(paths::HOSTS).await.unwrap_or_default();
    for h in hosts {
        let host_path = paths::join(paths::HOSTS, &h);
        for child in coord.children(&host_path).await.unwrap_or_default() {
            let path = paths::join(&host_path, &child);
            if let Ok(a) = node::load::<_, Assignment>(coord, &path).await {
                if &a.service_id == service_id {
                    found.push(a);
                }
            }
        }
    }
    found.sort_by_key(|a| a.instance_index);
    found
}

/// Polls `check` until it returns true, failing the test after 3 seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Always picks the first host, for deterministic placement.
pub struct FirstHost;

#[async_trait]
impl PlacementPolicy for FirstHost {
    async fn select_host(&self, _service: &ServiceDefinition, hosts: &[HostId]) -> Option<HostId> {
        hosts.first().cloned()
    }
}
