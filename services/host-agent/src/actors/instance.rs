//! Instance worker - owns a single assignment on this host.
//!
//! Exactly one worker runs per assignment ID; the host reconciler enforces
//! that through its child set. The worker is the only writer of the
//! instance's actual-state node.
//!
//! ## State Machine
//!
//! ```text
//! Loading -> Deciding -> Starting  --+
//!               ^     -> Attaching --+--> Monitoring --(exit / change)--> Loading
//!               |     -> Terminating -> Done                 |
//!               +--------------------------------------------+
//!                                           (stop / delete) -> Terminating
//! ```
//!
//! Runtime errors while starting or attaching terminate the instance with
//! the error attached to the final report. Retrying is left to the next
//! assignment the leader creates. Transient coordination failures are
//! retried after the fixed delay, for reads and for state writes alike.

use std::sync::Arc;

use chrono::Utc;
use convoy_coord::{
    node, paths, Assignment, Coordinator, CoordError, EventKind, InstanceState, Lifecycle,
    ServiceDefinition, Watch,
};
use convoy_id::{HostId, InstanceId, ServiceId};
use convoy_reconcile::supervision::{ChildContext, StopSignal};
use convoy_reconcile::{decide, Decision, FixedRetry};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::WorkerTimings;
use crate::error::WorkerError;
use crate::runtime::{
    ContainerEventKind, ContainerRuntime, ContainerSpec, HostConfig, NetworkSettings,
    RemoveOptions, RuntimeError,
};

/// Environment variables injected into every instance container.
pub const ENV_SERVICE_ID: &str = "CONVOY_SERVICE_ID";
pub const ENV_INSTANCE_ID: &str = "CONVOY_INSTANCE_ID";
pub const ENV_INSTANCE_INDEX: &str = "CONVOY_INSTANCE_INDEX";

/// Labels set on every instance container.
pub const LABEL_SERVICE_ID: &str = "convoy.service_id";
pub const LABEL_INSTANCE_ID: &str = "convoy.instance_id";

/// Context handed to a worker by the host reconciler.
pub type WorkerContext = ChildContext<InstanceId, WorkerError>;

/// Builds the container spec for an assignment.
///
/// The container is named after the instance ID.
pub fn container_spec(service: &ServiceDefinition, assignment: &Assignment) -> ContainerSpec {
    let mut env = service.env.clone();
    env.insert(ENV_SERVICE_ID.to_string(), assignment.service_id.to_string());
    env.insert(ENV_INSTANCE_ID.to_string(), assignment.id.to_string());
    env.insert(
        ENV_INSTANCE_INDEX.to_string(),
        assignment.instance_index.to_string(),
    );

    let labels = [
        (LABEL_SERVICE_ID, assignment.service_id.to_string()),
        (LABEL_INSTANCE_ID, assignment.id.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    ContainerSpec {
        name: assignment.id.to_string(),
        image: service.image.clone(),
        command: service.command.clone(),
        env,
        labels,
    }
}

/// Records read in the Loading step, plus the watches registered on them.
struct Loaded {
    assignment: Assignment,
    assignment_watch: Watch,
    state: InstanceState,
    service: ServiceDefinition,
    service_watch: Watch,
}

/// A container this worker is attached to.
struct Attachment {
    container_id: String,
    exit: JoinHandle<Result<i64, RuntimeError>>,
}

/// Why Monitoring ended.
enum Wake {
    Redecide,
    Terminate,
}

// =============================================================================
// Instance Worker
// =============================================================================

/// Reconciles one assignment against the container runtime.
pub struct InstanceWorker<R: ContainerRuntime> {
    host_id: HostId,
    id: InstanceId,
    coord: Arc<dyn Coordinator>,
    runtime: Arc<R>,
    timings: WorkerTimings,

    /// Learned from the assignment on first load.
    service_id: Option<ServiceId>,

    /// Last container ID known for this instance.
    docker_id: Option<String>,

    attached: Option<Attachment>,
}

impl<R: ContainerRuntime> InstanceWorker<R> {
    pub fn new(
        host_id: HostId,
        id: InstanceId,
        coord: Arc<dyn Coordinator>,
        runtime: Arc<R>,
        timings: WorkerTimings,
    ) -> Self {
        Self {
            host_id,
            id,
            coord,
            runtime,
            timings,
            service_id: None,
            docker_id: None,
            attached: None,
        }
    }

    /// Runs the worker to completion and reports the result to its owner.
    pub async fn run(mut self, ctx: WorkerContext) {
        let (id, mut stop, reporter) = ctx.into_parts();
        debug!(host_id = %self.host_id, instance_id = %id, "Instance worker started");

        let result = self.reconcile(&mut stop).await;
        match &result {
            Ok(()) => info!(instance_id = %id, "Instance worker finished"),
            Err(e) => warn!(instance_id = %id, error = %e, "Instance worker failed"),
        }
        reporter.report(id, result);
    }

    fn assignment_path(&self) -> String {
        paths::assignment(&self.host_id, &self.id)
    }

    async fn reconcile(&mut self, stop: &mut StopSignal) -> Result<(), WorkerError> {
        loop {
            let mut loaded = match self.load(stop).await {
                Ok(Some(loaded)) => loaded,
                Ok(None) => return self.terminate(None).await,
                Err(e) => return self.terminate(Some(e)).await,
            };

            let desired = loaded
                .assignment
                .desired_state
                .and(loaded.service.desired_state);
            let decision = decide(desired, self.attached.is_some(), &loaded.state.lifecycle);
            debug!(instance_id = %self.id, %desired, ?decision, "Decided");

            match decision {
                Decision::Terminate { wait_for_exit } => {
                    info!(instance_id = %self.id, wait_for_exit, "Instance marked for stop");
                    return self.terminate_with(None, wait_for_exit).await;
                }
                Decision::KeepMonitoring => {}
                Decision::Start => {
                    if let Err(e) = self.start(stop, &mut loaded).await {
                        return self.terminate(Some(e)).await;
                    }
                }
                Decision::Attach => match self.attach(stop, &mut loaded).await {
                    Ok(true) => {}
                    Ok(false) => return self.terminate(None).await,
                    Err(e) => return self.terminate(Some(e)).await,
                },
            }

            match self.monitor(stop, loaded).await {
                Ok(Wake::Redecide) => continue,
                Ok(Wake::Terminate) => return self.terminate(None).await,
                Err(e) => return self.terminate(Some(e)).await,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Loads the records, retrying transient failures. Returns `None` if
    /// stopped while waiting to retry.
    async fn load(&mut self, stop: &mut StopSignal) -> Result<Option<Loaded>, WorkerError> {
        let retry = FixedRetry::unbounded(self.timings.retry_delay);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_load().await {
                Ok(loaded) => return Ok(Some(loaded)),
                Err(e) if e.is_transient() && retry.allows(attempts) => {
                    warn!(
                        instance_id = %self.id,
                        error = %e,
                        retry_in_ms = retry.delay.as_millis() as u64,
                        "Failed to load instance records, retrying"
                    );
                    tokio::select! {
                        _ = stop.wait() => return Ok(None),
                        _ = tokio::time::sleep(retry.delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes the instance state, retrying transient failures. Returns false
    /// if stopped while waiting to retry.
    async fn store_state(
        &self,
        stop: &mut StopSignal,
        state: &InstanceState,
    ) -> Result<bool, WorkerError> {
        let path = paths::instance_state(&state.service_id, &state.id);
        let retry = FixedRetry::unbounded(self.timings.retry_delay);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match node::store(self.coord.as_ref(), &path, state).await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() && retry.allows(attempts) => {
                    warn!(
                        instance_id = %self.id,
                        error = %e,
                        retry_in_ms = retry.delay.as_millis() as u64,
                        "Failed to write instance state, retrying"
                    );
                    tokio::select! {
                        _ = stop.wait() => return Ok(false),
                        _ = tokio::time::sleep(retry.delay) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn try_load(&mut self) -> Result<Loaded, WorkerError> {
        let id = self.id;
        let path = self.assignment_path();
        let (assignment, assignment_watch) =
            node::load_w::<_, Assignment>(self.coord.as_ref(), &path)
                .await
                .map_err(|e| {
                    classify(e, |e| WorkerError::InvalidAssignment {
                        path: path.clone(),
                        reason: e.to_string(),
                    })
                })?;

        if assignment.id != id || assignment.host_id != self.host_id {
            return Err(WorkerError::InvalidAssignment {
                path,
                reason: format!(
                    "record names {} on {}",
                    assignment.id, assignment.host_id
                ),
            });
        }
        self.service_id = Some(assignment.service_id.clone());

        let state_path = paths::instance_state(&assignment.service_id, &id);
        let state: InstanceState = node::load(self.coord.as_ref(), &state_path)
            .await
            .map_err(|e| classify(e, |_| WorkerError::InvalidInstanceState(id)))?;
        if state.docker_id.is_some() {
            self.docker_id = state.docker_id.clone();
        }

        let service_id = assignment.service_id.clone();
        let (service, service_watch) = node::load_w::<_, ServiceDefinition>(
            self.coord.as_ref(),
            &paths::service(&service_id),
        )
        .await
        .map_err(|e| classify(e, |_| WorkerError::InvalidService(service_id.clone())))?;

        Ok(Loaded {
            assignment,
            assignment_watch,
            state,
            service,
            service_watch,
        })
    }

    // -------------------------------------------------------------------------
    // Starting / Attaching
    // -------------------------------------------------------------------------

    /// Starts a fresh container. A stop seen while recording the start is
    /// left for Monitoring to act on.
    #[instrument(skip(self, stop, loaded), fields(instance_id = %self.id))]
    async fn start(&mut self, stop: &mut StopSignal, loaded: &mut Loaded) -> Result<(), WorkerError> {
        let name = self.id.to_string();
        match self
            .runtime
            .remove_container(&name, RemoveOptions { force: true })
            .await
        {
            Ok(()) => debug!("Removed stale container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let spec = container_spec(&loaded.service, &loaded.assignment);
        let container_id = self.runtime.create_container(&spec).await?;
        self.docker_id = Some(container_id.clone());

        let mut events = self.runtime.subscribe(&container_id);
        self.runtime
            .start_container(&container_id, &HostConfig::default())
            .await?;
        events
            .wait_for(ContainerEventKind::Start, self.timings.start_timeout)
            .await?;
        self.watch_exit(container_id.clone());

        let inspected = self.runtime.inspect_container(&container_id).await?;
        let state = &mut loaded.state;
        state.docker_id = Some(container_id.clone());
        state.lifecycle = Lifecycle::started(Utc::now());
        state.private_ip = non_empty(inspected.network.ip_address);
        state.port_mapping = inspected.network.ports;
        self.store_state(stop, state).await?;

        info!(
            container_id = %container_id,
            image = %spec.image,
            instance_index = state.instance_index,
            "Instance started"
        );
        Ok(())
    }

    /// Finds the container a previous worker started. Returns false if
    /// stopped while polling.
    #[instrument(skip(self, stop, loaded), fields(instance_id = %self.id))]
    async fn attach(
        &mut self,
        stop: &mut StopSignal,
        loaded: &mut Loaded,
    ) -> Result<bool, WorkerError> {
        let target = loaded
            .state
            .docker_id
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        let attempts = self.timings.attach_attempts;

        for attempt in 1..=attempts {
            match self.runtime.inspect_container(&target).await {
                Ok(container) => {
                    info!(
                        container_id = %container.id,
                        attempt,
                        running = container.running,
                        "Attached to existing container"
                    );
                    self.docker_id = Some(container.id.clone());
                    self.watch_exit(container.id);
                    let state_path = paths::instance_state(&loaded.state.service_id, &self.id);
                    if let Err(e) = self
                        .record_network(&state_path, &mut loaded.state, container.network)
                        .await
                    {
                        warn!(error = %e, "Failed to record network info");
                    }
                    return Ok(true);
                }
                Err(e) if e.is_not_found() => {
                    debug!(container = %target, attempt, "Container not found yet");
                    if attempt < attempts {
                        tokio::select! {
                            _ = stop.wait() => return Ok(false),
                            _ = tokio::time::sleep(self.timings.attach_interval) => {}
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(WorkerError::AttachFailed {
            container: target,
            attempts,
        })
    }

    fn watch_exit(&mut self, container_id: String) {
        let runtime = self.runtime.clone();
        let id = container_id.clone();
        let exit = tokio::spawn(async move { runtime.wait_container(&id).await });
        self.attached = Some(Attachment { container_id, exit });
    }

    // -------------------------------------------------------------------------
    // Monitoring
    // -------------------------------------------------------------------------

    async fn monitor(&mut self, stop: &mut StopSignal, loaded: Loaded) -> Result<Wake, WorkerError> {
        let Loaded {
            mut state,
            mut assignment_watch,
            mut service_watch,
            ..
        } = loaded;
        let state_path = paths::instance_state(&state.service_id, &state.id);
        let period = self.timings.refresh_interval;
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            let Some(attachment) = self.attached.as_mut() else {
                return Ok(Wake::Redecide);
            };
            let container_id = attachment.container_id.clone();

            tokio::select! {
                _ = stop.wait() => {
                    info!(instance_id = %self.id, "Stop requested");
                    return Ok(Wake::Terminate);
                }
                exit = &mut attachment.exit => {
                    self.attached = None;
                    let exit_code = match exit {
                        Ok(Ok(code)) => Some(code),
                        Ok(Err(e)) => {
                            warn!(container_id = %container_id, error = %e, "Lost track of container");
                            None
                        }
                        Err(e) => {
                            warn!(container_id = %container_id, error = %e, "Exit watcher failed");
                            None
                        }
                    };
                    info!(instance_id = %self.id, container_id = %container_id, ?exit_code, "Container exited");
                    state.lifecycle = state.lifecycle.exited(Utc::now());
                    if !self.store_state(stop, &state).await? {
                        return Ok(Wake::Terminate);
                    }
                    return Ok(Wake::Redecide);
                }
                event = &mut assignment_watch => {
                    if event.kind == EventKind::NodeDeleted {
                        info!(instance_id = %self.id, "Assignment deleted");
                        return Ok(Wake::Terminate);
                    }
                    debug!(instance_id = %self.id, kind = ?event.kind, "Assignment changed");
                    return Ok(Wake::Redecide);
                }
                event = &mut service_watch => {
                    debug!(instance_id = %self.id, kind = ?event.kind, "Service changed");
                    return Ok(Wake::Redecide);
                }
                _ = refresh.tick() => {
                    match self.runtime.inspect_container(&container_id).await {
                        Ok(container) => {
                            if let Err(e) = self.record_network(&state_path, &mut state, container.network).await {
                                warn!(instance_id = %self.id, error = %e, "Failed to refresh network info");
                            }
                        }
                        Err(e) => debug!(container_id = %container_id, error = %e, "Refresh inspect failed"),
                    }
                }
            }
        }
    }

    /// Writes network info if it changed. Returns true if written.
    async fn record_network(
        &self,
        state_path: &str,
        state: &mut InstanceState,
        network: NetworkSettings,
    ) -> Result<bool, WorkerError> {
        let private_ip = non_empty(network.ip_address);
        if state.private_ip == private_ip && state.port_mapping == network.ports {
            return Ok(false);
        }
        state.private_ip = private_ip;
        state.port_mapping = network.ports;
        node::store(self.coord.as_ref(), state_path, &*state).await?;
        debug!(instance_id = %self.id, private_ip = ?state.private_ip, "Recorded network info");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Terminating
    // -------------------------------------------------------------------------

    /// Terminates, waiting for the exit of an attached container.
    async fn terminate(&mut self, cause: Option<WorkerError>) -> Result<(), WorkerError> {
        let wait_for_exit = self.attached.is_some();
        self.terminate_with(cause, wait_for_exit).await
    }

    /// Stops the container and deletes both nodes. Always runs to the end;
    /// the first error seen, starting with `cause`, is returned.
    ///
    /// Without `wait_for_exit` the exit watcher is dropped and the container
    /// is removed right after the kill.
    #[instrument(skip(self, cause), fields(instance_id = %self.id))]
    async fn terminate_with(
        &mut self,
        cause: Option<WorkerError>,
        wait_for_exit: bool,
    ) -> Result<(), WorkerError> {
        let mut first_error = cause;

        let target = self
            .attached
            .as_ref()
            .map(|a| a.container_id.clone())
            .or_else(|| self.docker_id.clone())
            .unwrap_or_else(|| self.id.to_string());
        if let Err(e) = self.stop_container(&target, wait_for_exit).await {
            warn!(container = %target, error = %e, "Failed to stop container");
            first_error.get_or_insert(e);
        }

        if let Some(service_id) = &self.service_id {
            let path = paths::instance_state(service_id, &self.id);
            if let Err(e) = delete_node(self.coord.as_ref(), &path).await {
                first_error.get_or_insert(e.into());
            }
        }
        if let Err(e) = delete_node(self.coord.as_ref(), &self.assignment_path()).await {
            first_error.get_or_insert(e.into());
        }

        match first_error {
            None => {
                info!("Instance terminated");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    async fn stop_container(&mut self, target: &str, wait_for_exit: bool) -> Result<(), WorkerError> {
        match self.runtime.kill_container(target).await {
            Ok(()) => debug!(container = %target, "Killed container"),
            Err(e) if e.is_already_gone() => {}
            Err(e) => return Err(e.into()),
        }

        match self.attached.take() {
            Some(mut attachment) if wait_for_exit => {
                let waited =
                    tokio::time::timeout(self.timings.start_timeout, &mut attachment.exit).await;
                if waited.is_err() {
                    warn!(container_id = %attachment.container_id, "Container did not exit after kill");
                    attachment.exit.abort();
                }
            }
            Some(attachment) => attachment.exit.abort(),
            None => {}
        }

        match self
            .runtime
            .remove_container(target, RemoveOptions { force: true })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Transient errors stay retryable; anything else becomes `terminal(err)`.
fn classify(err: CoordError, terminal: impl FnOnce(CoordError) -> WorkerError) -> WorkerError {
    if err.is_transient() {
        WorkerError::Coordination(err)
    } else {
        terminal(err)
    }
}

async fn delete_node(coord: &dyn Coordinator, path: &str) -> Result<(), CoordError> {
    match coord.delete(path).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
