//! Shared fixtures for host agent tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use convoy_coord::{
    node, paths, Assignment, DesiredState, InstanceState, MemoryCoordinator, ServiceDefinition,
};
use convoy_host_agent::{InstanceWorker, MockRuntime, WorkerError, WorkerTimings};
use convoy_id::{HostId, InstanceId, PoolId, ServiceId};
use convoy_reconcile::supervision::{ChildSet, Report};

pub fn fast_timings() -> WorkerTimings {
    WorkerTimings {
        retry_delay: Duration::from_millis(20),
        attach_attempts: 3,
        attach_interval: Duration::from_millis(10),
        start_timeout: Duration::from_millis(250),
        refresh_interval: Duration::from_millis(40),
    }
}

pub fn host(name: &str) -> HostId {
    HostId::parse(name).unwrap()
}

pub fn service_def(name: &str, instances: u32) -> ServiceDefinition {
    ServiceDefinition {
        id: ServiceId::parse(name).unwrap(),
        name: name.to_string(),
        instances,
        pool_id: PoolId::parse("default").unwrap(),
        desired_state: DesiredState::Run,
        image: "nginx:1.27".to_string(),
        command: vec![],
        env: BTreeMap::from([("PORT".to_string(), "8080".to_string())]),
    }
}

pub async fn put_service(coord: &MemoryCoordinator, svc: &ServiceDefinition) {
    node::create_record(coord, &paths::service(&svc.id), svc)
        .await
        .unwrap();
}

/// Creates the instance state and the assignment, the way the leader does.
pub async fn assign(
    coord: &MemoryCoordinator,
    svc: &ServiceDefinition,
    host_id: &HostId,
    index: u32,
) -> Assignment {
    let assignment = Assignment::new(svc.id.clone(), host_id.clone(), index);
    node::create_record(
        coord,
        &paths::instance_state(&svc.id, &assignment.id),
        &InstanceState::for_assignment(&assignment),
    )
    .await
    .unwrap();
    node::create_record(
        coord,
        &paths::assignment(host_id, &assignment.id),
        &assignment,
    )
    .await
    .unwrap();
    assignment
}

pub async fn load_state(coord: &MemoryCoordinator, a: &Assignment) -> Option<InstanceState> {
    node::load(coord, &paths::instance_state(&a.service_id, &a.id))
        .await
        .ok()
}

pub async fn nodes_gone(coord: &MemoryCoordinator, a: &Assignment) -> bool {
    use convoy_coord::Coordinator;
    let state = coord
        .exists(&paths::instance_state(&a.service_id, &a.id))
        .await
        .unwrap();
    let assignment = coord
        .exists(&paths::assignment(&a.host_id, &a.id))
        .await
        .unwrap();
    !state && !assignment
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

/// Spawns a single worker owned by a fresh child set.
pub fn spawn_worker(
    coord: &MemoryCoordinator,
    runtime: &Arc<MockRuntime>,
    a: &Assignment,
) -> ChildSet<InstanceId, WorkerError> {
    let mut set = ChildSet::new();
    let ctx = set.enlist(a.id).unwrap();
    let worker = InstanceWorker::new(
        a.host_id.clone(),
        a.id,
        Arc::new(coord.clone()),
        runtime.clone(),
        fast_timings(),
    );
    tokio::spawn(worker.run(ctx));
    set
}

pub async fn next_report(
    set: &mut ChildSet<InstanceId, WorkerError>,
) -> Report<InstanceId, WorkerError> {
    tokio::time::timeout(Duration::from_secs(3), set.next_report())
        .await
        .expect("worker did not report")
}
