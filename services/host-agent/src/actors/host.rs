//! Host reconciler - root of the per-host supervision tree.
//!
//! ```text
//! HostReconciler(host_id)
//! └── InstanceWorker(instance_id)   one per assignment under /hosts/{host_id}
//! ```
//!
//! The reconciler lists the host's assignments with a watch and spawns a
//! worker for every assignment that has none. The worker map is owned by the
//! reconciler task alone; workers report back over the fan-in channel.
//!
//! Shutdown is a two-phase handshake: [`HostAgentHandle::shutdown`] sends a
//! reply channel, the reconciler stops every worker, waits for all of their
//! reports and only then answers.

use std::sync::Arc;

use chrono::Utc;
use convoy_coord::{node, paths, Coordinator, CoordError, PoolMember, Watch};
use convoy_id::InstanceId;
use convoy_reconcile::supervision::{
    close_channel, ChildSet, CloseReply, CloseRequests, Closer, Report,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::instance::InstanceWorker;
use crate::config::AgentConfig;
use crate::error::{AgentError, WorkerError};
use crate::runtime::ContainerRuntime;

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running host reconciler.
pub struct HostAgentHandle {
    closer: Closer<AgentError>,
    task: JoinHandle<()>,
}

impl HostAgentHandle {
    /// Stops every instance worker and waits for the reconciler to exit.
    ///
    /// Returns the first error reported by a worker while stopping.
    pub async fn shutdown(self) -> Result<(), AgentError> {
        let result = self.closer.close().await;
        if let Err(e) = self.task.await {
            error!(error = %e, "Host reconciler task failed");
        }
        result
    }

    /// Returns true if the reconciler task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// =============================================================================
// Host Reconciler
// =============================================================================

/// Per-host reconciliation loop.
pub struct HostReconciler<R: ContainerRuntime> {
    config: AgentConfig,
    coord: Arc<dyn Coordinator>,
    runtime: Arc<R>,
    workers: ChildSet<InstanceId, WorkerError>,
    closing: CloseRequests<AgentError>,
    registered: bool,
}

impl<R: ContainerRuntime> HostReconciler<R> {
    /// Spawns the reconciler for `config.host_id`.
    pub fn spawn(
        config: AgentConfig,
        coord: Arc<dyn Coordinator>,
        runtime: Arc<R>,
    ) -> HostAgentHandle {
        let (closer, closing) = close_channel();
        let reconciler = Self {
            config,
            coord,
            runtime,
            workers: ChildSet::new(),
            closing,
            registered: false,
        };
        let task = tokio::spawn(reconciler.run());
        HostAgentHandle { closer, task }
    }

    async fn run(mut self) {
        info!(
            host_id = %self.config.host_id,
            pool_id = ?self.config.pool_id,
            "Starting host reconciler"
        );

        loop {
            let running = match self.sync().await {
                Ok(watch) => self.wait_for_change(watch).await,
                Err(e) => {
                    warn!(
                        host_id = %self.config.host_id,
                        error = %e,
                        retry_in_ms = self.config.timings.retry_delay.as_millis() as u64,
                        "Failed to list assignments, retrying"
                    );
                    self.wait_to_retry().await
                }
            };
            if !running {
                info!(host_id = %self.config.host_id, "Host reconciler stopped");
                return;
            }
        }
    }

    /// Registers the host if needed, lists its assignments and spawns a worker
    /// for each unowned one.
    async fn sync(&mut self) -> Result<Watch, CoordError> {
        if !self.registered {
            self.register().await?;
            self.registered = true;
        }

        let host_path = paths::host(&self.config.host_id);
        let (children, watch) = match self.coord.children_w(&host_path).await {
            Ok(listed) => listed,
            Err(e) => {
                if e.is_not_found() {
                    warn!(host_id = %self.config.host_id, "Host node is gone, registering again");
                    self.registered = false;
                }
                return Err(e);
            }
        };
        debug!(host_id = %self.config.host_id, assignments = children.len(), "Listed assignments");

        for child in children {
            let id = match child.parse::<InstanceId>() {
                Ok(id) => id,
                Err(e) => {
                    warn!(node = %child, error = %e, "Removing assignment with invalid name");
                    let path = paths::join(&host_path, &child);
                    if let Err(e) = self.coord.delete(&path).await {
                        warn!(path = %path, error = %e, "Failed to remove invalid assignment");
                    }
                    continue;
                }
            };

            if let Some(ctx) = self.workers.enlist(id) {
                debug!(instance_id = %id, "Spawning instance worker");
                let worker = InstanceWorker::new(
                    self.config.host_id.clone(),
                    id,
                    self.coord.clone(),
                    self.runtime.clone(),
                    self.config.timings,
                );
                tokio::spawn(worker.run(ctx));
            }
        }
        Ok(watch)
    }

    async fn register(&self) -> Result<(), CoordError> {
        let host_id = &self.config.host_id;
        self.coord.create_dir(&paths::host(host_id)).await?;

        if let Some(pool_id) = &self.config.pool_id {
            let member = PoolMember {
                host_id: host_id.clone(),
                registered_at: Utc::now(),
            };
            match node::create_record(
                self.coord.as_ref(),
                &paths::pool_member(pool_id, host_id),
                &member,
            )
            .await
            {
                Ok(()) => info!(host_id = %host_id, pool_id = %pool_id, "Registered host in pool"),
                Err(e) if e.is_node_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Waits for the assignment list to change. Returns false once shut down.
    async fn wait_for_change(&mut self, mut watch: Watch) -> bool {
        loop {
            tokio::select! {
                Some(reply) = self.closing.recv() => {
                    self.shutdown(reply).await;
                    return false;
                }
                report = self.workers.next_report() => self.log_report(report),
                event = &mut watch => {
                    debug!(host_id = %self.config.host_id, kind = ?event.kind, "Assignments changed");
                    return true;
                }
            }
        }
    }

    /// Waits out the retry delay. Returns false once shut down.
    async fn wait_to_retry(&mut self) -> bool {
        let delay = tokio::time::sleep(self.config.timings.retry_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                Some(reply) = self.closing.recv() => {
                    self.shutdown(reply).await;
                    return false;
                }
                report = self.workers.next_report() => self.log_report(report),
                _ = &mut delay => return true,
            }
        }
    }

    fn log_report(&self, report: Report<InstanceId, WorkerError>) {
        match report.result {
            Ok(()) => debug!(instance_id = %report.id, "Instance worker done"),
            Err(e) => warn!(instance_id = %report.id, error = %e, "Instance worker reported error"),
        }
    }

    async fn shutdown(&mut self, reply: CloseReply<AgentError>) {
        info!(
            host_id = %self.config.host_id,
            workers = self.workers.len(),
            "Shutting down instance workers"
        );
        let drained = self.workers.shutdown_all().await;
        info!(
            host_id = %self.config.host_id,
            stopped = drained.signalled,
            "All instance workers stopped"
        );

        let result = match drained.first_error {
            Some(e) => Err(AgentError::Worker(e)),
            None => Ok(()),
        };
        let _ = reply.send(result);
    }
}
