//! Per-service watcher and the convergence pass.
//!
//! While this process leads, one [`ServiceWatcher`] runs per service. Each
//! pass compares the desired instance count with the live instances and
//! closes the gap:
//!
//! - too few: new assignments on hosts picked by the placement policy
//! - too many: the lowest-index assignments are deleted
//! - service stopped: every live assignment is marked `Stop`
//!
//! An instance is live while its assignment exists and is not marked `Stop`.
//! Passes repeat whenever the service node or its instance list changes, and
//! after the retry delay while a running service is short of instances.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use convoy_coord::{
    node, paths, Assignment, Coordinator, CoordError, DesiredState, EventKind, InstanceState,
    ServiceDefinition, Watch,
};
use convoy_id::{HostId, InstanceId, PoolId, ServiceId};
use convoy_reconcile::supervision::{ChildContext, StopSignal};
use convoy_reconcile::{free_instance_indices, plan_scale, select_for_termination, ScaleAction};
use tracing::{debug, info, instrument, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::placement::PlacementPolicy;

/// Context handed to a service watcher by the leader.
pub type WatcherContext = ChildContext<ServiceId, SchedulerError>;

/// Outcome of one convergence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Assignments created.
    pub started: usize,

    /// Assignments deleted or marked `Stop`.
    pub stopped: usize,
}

impl PassStats {
    pub fn is_noop(&self) -> bool {
        self.started == 0 && self.stopped == 0
    }
}

/// Instances recorded for a service.
#[derive(Debug, Clone, Default)]
pub struct ServiceInstances {
    /// Assignments that exist and are not marked `Stop`, by instance index.
    pub live: Vec<Assignment>,

    /// Every instance index still recorded, live or not.
    pub used_indices: BTreeSet<u32>,
}

// =============================================================================
// Convergence
// =============================================================================

/// Lists the instances of a service.
///
/// An instance state whose assignment is gone is left over from an
/// interrupted placement and is deleted.
#[instrument(skip_all, fields(service_id = %service_id))]
pub async fn list_instances(
    coord: &dyn Coordinator,
    service_id: &ServiceId,
) -> SchedulerResult<ServiceInstances> {
    let mut instances = ServiceInstances::default();

    for child in coord.children(&paths::service(service_id)).await? {
        let Ok(id) = child.parse::<InstanceId>() else {
            debug!(node = %child, "Skipping non-instance node");
            continue;
        };

        let state_path = paths::instance_state(service_id, &id);
        let state: InstanceState = match node::load(coord, &state_path).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => continue,
            Err(e) if e.is_invalid_record() => {
                warn!(path = %state_path, error = %e, "Skipping unreadable instance state");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        instances.used_indices.insert(state.instance_index);

        let assignment_path = paths::assignment(&state.host_id, &id);
        match node::load::<_, Assignment>(coord, &assignment_path).await {
            Ok(a) if a.desired_state == DesiredState::Run => instances.live.push(a),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!(
                    instance_id = %id,
                    host_id = %state.host_id,
                    "Removing instance state without assignment"
                );
                delete_if_present(coord, &state_path).await?;
            }
            Err(e) if e.is_invalid_record() => {
                warn!(path = %assignment_path, error = %e, "Skipping unreadable assignment");
            }
            Err(e) => return Err(e.into()),
        }
    }

    instances.live.sort_by_key(|a| a.instance_index);
    Ok(instances)
}

/// Hosts registered in a pool. A pool with no node has no hosts.
pub async fn pool_hosts(coord: &dyn Coordinator, pool_id: &PoolId) -> SchedulerResult<Vec<HostId>> {
    let members = match coord.children(&paths::pool(pool_id)).await {
        Ok(members) => members,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    Ok(members
        .into_iter()
        .filter_map(|member| match member.parse::<HostId>() {
            Ok(host_id) => Some(host_id),
            Err(e) => {
                warn!(pool_id = %pool_id, node = %member, error = %e, "Skipping invalid pool member");
                None
            }
        })
        .collect())
}

/// Brings a running service's live instance count to its desired count.
///
/// New instances take the lowest free instance indices; surplus instances
/// are unassigned lowest index first. A pool without hosts skips the pass.
/// `instances` is updated to reflect what the pass did.
#[instrument(skip_all, fields(service_id = %service.id))]
pub async fn update_service_instances(
    coord: &dyn Coordinator,
    placement: &dyn PlacementPolicy,
    service: &ServiceDefinition,
    instances: &mut ServiceInstances,
) -> SchedulerResult<PassStats> {
    let mut stats = PassStats::default();

    match plan_scale(service.instances, instances.live.len()) {
        ScaleAction::Hold => {}
        ScaleAction::Start(count) => {
            let hosts = pool_hosts(coord, &service.pool_id).await?;
            if hosts.is_empty() {
                warn!(pool_id = %service.pool_id, wanted = count, "Pool has no hosts");
                return Ok(stats);
            }
            debug!(count, hosts = hosts.len(), "Starting instances");

            for index in free_instance_indices(instances.used_indices.iter().copied(), count) {
                let Some(host_id) = placement.select_host(service, &hosts).await else {
                    warn!(instance_index = index, "Placement selected no host");
                    break;
                };
                let assignment = Assignment::new(service.id.clone(), host_id, index);
                assign(coord, &assignment).await?;
                instances.used_indices.insert(index);
                instances.live.push(assignment);
                stats.started += 1;
            }
        }
        ScaleAction::Stop(count) => {
            debug!(count, live = instances.live.len(), "Stopping instances");
            for a in select_for_termination(instances.live.clone(), count, |a| a.instance_index) {
                delete_if_present(coord, &paths::assignment(&a.host_id, &a.id)).await?;
                instances.live.retain(|live| live.id != a.id);
                info!(
                    instance_id = %a.id,
                    host_id = %a.host_id,
                    instance_index = a.instance_index,
                    "Unassigned instance"
                );
                stats.stopped += 1;
            }
        }
    }

    instances.live.sort_by_key(|a| a.instance_index);
    Ok(stats)
}

/// Marks every live assignment of a stopped service `Stop`. Afterwards no
/// instance in `instances` is live.
#[instrument(skip_all)]
pub async fn stop_service_instances(
    coord: &dyn Coordinator,
    instances: &mut ServiceInstances,
) -> SchedulerResult<PassStats> {
    let mut stats = PassStats::default();
    for a in std::mem::take(&mut instances.live) {
        let path = paths::assignment(&a.host_id, &a.id);
        match node::update(coord, &path, |record: &mut Assignment| {
            record.desired_state = DesiredState::Stop
        })
        .await
        {
            Ok(_) => {
                info!(instance_id = %a.id, host_id = %a.host_id, "Marked instance for stop");
                stats.stopped += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(stats)
}

/// Writes the instance state first, then the assignment that makes a host
/// act on it.
async fn assign(coord: &dyn Coordinator, assignment: &Assignment) -> SchedulerResult<()> {
    node::create_record(
        coord,
        &paths::instance_state(&assignment.service_id, &assignment.id),
        &InstanceState::for_assignment(assignment),
    )
    .await?;
    node::create_record(
        coord,
        &paths::assignment(&assignment.host_id, &assignment.id),
        assignment,
    )
    .await?;

    info!(
        instance_id = %assignment.id,
        host_id = %assignment.host_id,
        instance_index = assignment.instance_index,
        "Assigned instance"
    );
    Ok(())
}

async fn delete_if_present(coord: &dyn Coordinator, path: &str) -> Result<(), CoordError> {
    match coord.delete(path).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

// =============================================================================
// Service Watcher
// =============================================================================

/// Watches one service and converges it on every change.
pub struct ServiceWatcher {
    service_id: ServiceId,
    coord: Arc<dyn Coordinator>,
    placement: Arc<dyn PlacementPolicy>,
    retry_delay: Duration,

    /// Live assignments seen by the last pass, unassigned if the service
    /// node is deleted.
    last_seen: Vec<Assignment>,
}

impl ServiceWatcher {
    pub fn new(
        service_id: ServiceId,
        coord: Arc<dyn Coordinator>,
        placement: Arc<dyn PlacementPolicy>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            service_id,
            coord,
            placement,
            retry_delay,
            last_seen: Vec::new(),
        }
    }

    /// Watches until stopped or the service is deleted, then reports.
    pub async fn run(mut self, ctx: WatcherContext) {
        let (id, mut stop, reporter) = ctx.into_parts();
        info!(service_id = %id, "Watching service");

        let result = self.watch(&mut stop).await;
        match &result {
            Ok(()) => debug!(service_id = %id, "Service watcher finished"),
            Err(e) => warn!(service_id = %id, error = %e, "Service watcher failed"),
        }
        reporter.report(id, result);
    }

    async fn watch(&mut self, stop: &mut StopSignal) -> SchedulerResult<()> {
        let path = paths::service(&self.service_id);

        loop {
            let (service_changed, instances_changed, short) = match self.pass(&path).await {
                Ok(Some(watches)) => watches,
                Ok(None) => {
                    info!(service_id = %self.service_id, "Service removed");
                    self.tear_down().await;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        service_id = %self.service_id,
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Service pass failed, retrying"
                    );
                    tokio::select! {
                        _ = stop.wait() => return Ok(()),
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                    }
                }
                // Deleted mid-pass; the next pass observes the deletion.
                Err(SchedulerError::Coordination(e)) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            tokio::select! {
                _ = stop.wait() => {
                    debug!(service_id = %self.service_id, "Stopping service watcher");
                    return Ok(());
                }
                event = service_changed => {
                    if event.kind == EventKind::NodeDeleted {
                        info!(service_id = %self.service_id, "Service deleted");
                        self.tear_down().await;
                        return Ok(());
                    }
                    debug!(service_id = %self.service_id, kind = ?event.kind, "Service changed");
                }
                event = instances_changed => {
                    debug!(service_id = %self.service_id, kind = ?event.kind, "Instances changed");
                }
                _ = tokio::time::sleep(self.retry_delay), if short => {
                    debug!(service_id = %self.service_id, "Retrying short service");
                }
            }
        }
    }

    /// Runs one pass and returns watches on the service node and its
    /// instance list, or `None` once the service node is gone. The flag is
    /// set when the service is left with fewer live instances than desired.
    ///
    /// An unreadable service record skips the pass until the node changes.
    async fn pass(&mut self, path: &str) -> SchedulerResult<Option<(Watch, Watch, bool)>> {
        let (data, service_changed) = match self.coord.get_w(path).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let instances_changed = match self.coord.children_w(path).await {
            Ok((_, watch)) => watch,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let short = match node::decode::<ServiceDefinition>(path, &data) {
            Ok(service) if service.id == self.service_id => self.converge(&service).await?,
            Ok(service) => {
                let err = SchedulerError::InvalidService {
                    service_id: self.service_id.clone(),
                    reason: format!("record names service {}", service.id),
                };
                warn!(error = %err, "Skipping pass until the service changes");
                false
            }
            Err(e) => {
                let err = SchedulerError::InvalidService {
                    service_id: self.service_id.clone(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Skipping pass until the service changes");
                false
            }
        };

        Ok(Some((service_changed, instances_changed, short)))
    }

    /// Returns true when a running service is still short of instances, as
    /// with an empty pool.
    async fn converge(&mut self, service: &ServiceDefinition) -> SchedulerResult<bool> {
        let coord = self.coord.as_ref();
        let mut instances = list_instances(coord, &service.id).await?;
        let before = instances.live.len();

        let stats = match service.desired_state {
            DesiredState::Run => {
                update_service_instances(coord, self.placement.as_ref(), service, &mut instances)
                    .await?
            }
            DesiredState::Stop => stop_service_instances(coord, &mut instances).await?,
        };

        if stats.is_noop() {
            debug!(
                service_id = %service.id,
                desired = service.instances,
                live = before,
                "Service converged"
            );
        } else {
            info!(
                service_id = %service.id,
                desired_state = %service.desired_state,
                desired = service.instances,
                live = before,
                started = stats.started,
                stopped = stats.stopped,
                "Service pass complete"
            );
        }

        let short = service.desired_state == DesiredState::Run
            && instances.live.len() < service.instances as usize;
        self.last_seen = instances.live;
        Ok(short)
    }

    /// Unassigns every instance seen by the last pass.
    async fn tear_down(&mut self) {
        let assignments = std::mem::take(&mut self.last_seen);
        for a in &assignments {
            let path = paths::assignment(&a.host_id, &a.id);
            if let Err(e) = delete_if_present(self.coord.as_ref(), &path).await {
                warn!(path = %path, error = %e, "Failed to unassign instance");
            }
        }
        if !assignments.is_empty() {
            info!(
                service_id = %self.service_id,
                unassigned = assignments.len(),
                "Unassigned instances of removed service"
            );
        }
    }
}
