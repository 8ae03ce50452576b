//! Cluster leader - election loop and root of the leader-side task tree.
//!
//! ```text
//! ClusterLeader(host_id)             one candidate per process
//! ├── ServiceWatcher(service_id)     one per service under /services
//! └── snapshot request drain
//! ```
//!
//! Exactly one candidate leads at a time. While leading it lists
//! `/services` with a watch and keeps one watcher per service. Losing
//! leadership abandons every watcher and the snapshot drain without waiting
//! for them; the next leader derives the same work from the coordination
//! store.

use std::future::Future;
use std::sync::Arc;

use convoy_coord::{paths, Coordinator, LeaderRecord, Watch};
use convoy_id::ServiceId;
use convoy_reconcile::supervision::{ChildSet, Report};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::LeaderConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::placement::PlacementPolicy;
use crate::service::ServiceWatcher;
use crate::snapshot::{watch_snapshot_requests, Snapshotter};

/// How a term of leadership ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    Lost,
    Shutdown,
}

enum Wake {
    Relist,
    Lost,
    Shutdown,
}

/// Leader candidate that schedules every service while it holds the lead.
pub struct ClusterLeader {
    config: LeaderConfig,
    coord: Arc<dyn Coordinator>,
    placement: Arc<dyn PlacementPolicy>,
    snapshotter: Arc<dyn Snapshotter>,
}

impl ClusterLeader {
    pub fn new(
        config: LeaderConfig,
        coord: Arc<dyn Coordinator>,
        placement: Arc<dyn PlacementPolicy>,
        snapshotter: Arc<dyn Snapshotter>,
    ) -> Self {
        Self {
            config,
            coord,
            placement,
            snapshotter,
        }
    }

    /// Runs the election loop until shutdown is signalled.
    ///
    /// Election failures and lost terms are followed by the retry delay and
    /// a new candidacy.
    #[instrument(skip_all, fields(host_id = %self.config.host_id))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(election_path = %self.config.election_path, "Starting leader candidate");
        let candidate = self.coord.new_leader(
            &self.config.election_path,
            LeaderRecord::new(self.config.host_id.clone()),
        );

        loop {
            let acquired = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                acquired = candidate.take_lead() => acquired,
            };

            match acquired {
                Ok(lost) => {
                    if self.lead(lost, &mut shutdown).await == Term::Shutdown {
                        break;
                    }
                }
                Err(e) => warn!(
                    error = %e,
                    retry_in_ms = self.config.retry_delay.as_millis() as u64,
                    "Election failed, retrying"
                ),
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }

        if let Err(e) = candidate.release_lead().await {
            warn!(error = %e, "Failed to release leadership");
        }
        info!("Leader candidate stopped");
    }

    /// Leads until leadership is lost or shutdown is signalled.
    async fn lead(&self, mut lost: Watch, shutdown: &mut watch::Receiver<bool>) -> Term {
        info!(host_id = %self.config.host_id, "Acquired leadership");

        let snapshots = tokio::spawn(watch_snapshot_requests(
            self.coord.clone(),
            self.snapshotter.clone(),
            self.config.retry_delay,
        ));
        let mut watchers = ChildSet::new();

        let term = loop {
            let wake = match self.watch_services(&mut watchers).await {
                Ok(changed) => {
                    let relist = async move {
                        let event = changed.await;
                        debug!(kind = ?event.kind, "Services changed");
                    };
                    self.wait(&mut lost, shutdown, &mut watchers, relist).await
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = self.config.retry_delay.as_millis() as u64,
                        "Failed to list services, retrying"
                    );
                    let delay = tokio::time::sleep(self.config.retry_delay);
                    self.wait(&mut lost, shutdown, &mut watchers, delay).await
                }
            };
            match wake {
                Wake::Relist => continue,
                Wake::Lost => break Term::Lost,
                Wake::Shutdown => break Term::Shutdown,
            }
        };

        snapshots.abort();
        match term {
            Term::Lost => {
                let abandoned = watchers.abandon();
                warn!(abandoned, "Lost leadership, abandoned service watchers");
            }
            Term::Shutdown => {
                let drained = watchers.shutdown_all().await;
                info!(stopped = drained.signalled, "Service watchers stopped");
            }
        }
        term
    }

    /// Lists services and spawns a watcher for each one that has none.
    async fn watch_services(
        &self,
        watchers: &mut ChildSet<ServiceId, SchedulerError>,
    ) -> SchedulerResult<Watch> {
        self.coord.create_dir(paths::SERVICES).await?;
        let (children, changed) = self.coord.children_w(paths::SERVICES).await?;
        debug!(services = children.len(), "Listed services");

        for child in children {
            let service_id = match child.parse::<ServiceId>() {
                Ok(id) => id,
                Err(e) => {
                    warn!(node = %child, error = %e, "Skipping service with invalid name");
                    continue;
                }
            };

            if let Some(ctx) = watchers.enlist(service_id.clone()) {
                let watcher = ServiceWatcher::new(
                    service_id,
                    self.coord.clone(),
                    self.placement.clone(),
                    self.config.retry_delay,
                );
                tokio::spawn(watcher.run(ctx));
            }
        }
        Ok(changed)
    }

    async fn wait<F>(
        &self,
        lost: &mut Watch,
        shutdown: &mut watch::Receiver<bool>,
        watchers: &mut ChildSet<ServiceId, SchedulerError>,
        relist: F,
    ) -> Wake
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(relist);
        loop {
            tokio::select! {
                event = &mut *lost => {
                    info!(kind = ?event.kind, "Leadership lost");
                    return Wake::Lost;
                }
                _ = shutdown_requested(shutdown) => return Wake::Shutdown,
                report = watchers.next_report() => log_report(report),
                _ = &mut relist => return Wake::Relist,
            }
        }
    }
}

fn log_report(report: Report<ServiceId, SchedulerError>) {
    match report.result {
        Ok(()) => debug!(service_id = %report.id, "Service watcher done"),
        Err(e) => warn!(service_id = %report.id, error = %e, "Service watcher reported error"),
    }
}

/// Resolves once `shutdown` holds true or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
