//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts container lifecycle operations:
//! - Create, start, inspect, kill and remove containers
//! - Wait for a container to exit
//! - Subscribe to lifecycle events of a single container
//!
//! Operations that take an `id` also accept the container name, the way the
//! Docker API does. A mock implementation is provided for testing and
//! development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use convoy_coord::{PortBinding, PortMapping};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

// =============================================================================
// Types
// =============================================================================

/// Container to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Start-time host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub publish_all_ports: bool,
    pub network_mode: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            publish_all_ports: true,
            network_mode: "bridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub ip_address: String,
    pub ports: PortMapping,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub network: NetworkSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerEventKind {
    Create,
    Start,
    Die,
    Kill,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub kind: ContainerEventKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove even if running.
    pub force: bool,
}

/// Runtime errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("container name already in use: {0}")]
    Conflict(String),

    #[error("container is not running: {0}")]
    NotRunning(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("container event stream closed")]
    EventStreamClosed,

    #[error("runtime failure: {0}")]
    Failed(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, RuntimeError::NotRunning(_))
    }

    /// The container is already gone or already stopped.
    pub fn is_already_gone(&self) -> bool {
        self.is_not_found() || self.is_not_running()
    }
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Create a container. Returns its ID.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str, host_config: &HostConfig)
        -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, opts: RemoveOptions) -> Result<(), RuntimeError>;

    /// Wait for the container to exit. Returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Subscribe to lifecycle events of one container.
    fn subscribe(&self, id: &str) -> EventSubscription;
}

/// Lifecycle events of a single container.
pub struct EventSubscription {
    container_id: String,
    rx: broadcast::Receiver<ContainerEvent>,
}

impl EventSubscription {
    /// Filters `rx` down to events of `container_id`.
    pub fn new(container_id: impl Into<String>, rx: broadcast::Receiver<ContainerEvent>) -> Self {
        Self {
            container_id: container_id.into(),
            rx,
        }
    }

    /// Next event for this container, or `None` once the stream closes.
    pub async fn next(&mut self) -> Option<ContainerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.container_id == self.container_id => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits up to `timeout` for an event of the given kind.
    pub async fn wait_for(
        &mut self,
        kind: ContainerEventKind,
        timeout: Duration,
    ) -> Result<ContainerEvent, RuntimeError> {
        let found = tokio::time::timeout(timeout, async {
            while let Some(event) = self.next().await {
                if event.kind == kind {
                    return Some(event);
                }
            }
            None
        })
        .await
        .map_err(|_| RuntimeError::Timeout {
            what: format!("{kind:?} event of {}", self.container_id),
            after: timeout,
        })?;
        found.ok_or(RuntimeError::EventStreamClosed)
    }
}

// =============================================================================
// Mock Runtime
// =============================================================================

struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    exit_code: Option<i64>,
    exit: watch::Sender<Option<i64>>,
    network: NetworkSettings,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    names: HashMap<String, String>,
    fail_creates: bool,
    fail_starts: bool,
    suppress_start_events: bool,
    created: usize,
}

impl MockState {
    fn resolve(&self, id: &str) -> Result<String, RuntimeError> {
        if self.containers.contains_key(id) {
            return Ok(id.to_string());
        }
        self.names
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    state: Mutex<MockState>,
    events: broadcast::Sender<ContainerEvent>,
    counter: AtomicU64,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MockState::default()),
            events,
            counter: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, container_id: &str, kind: ContainerEventKind) {
        let _ = self.events.send(ContainerEvent {
            container_id: container_id.to_string(),
            kind,
        });
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Make all creates fail.
    pub fn fail_creates(&self, fail: bool) {
        self.state().fail_creates = fail;
    }

    /// Make all starts fail.
    pub fn fail_starts(&self, fail: bool) {
        self.state().fail_starts = fail;
    }

    /// Start containers without emitting a start event.
    pub fn suppress_start_events(&self, suppress: bool) {
        self.state().suppress_start_events = suppress;
    }

    /// Simulate a container exiting on its own. Returns false if it was not
    /// running.
    pub fn crash(&self, id: &str, exit_code: i64) -> bool {
        let container_id = {
            let mut state = self.state();
            let Ok(cid) = state.resolve(id) else {
                return false;
            };
            let Some(c) = state.containers.get_mut(&cid) else {
                return false;
            };
            if !c.running {
                return false;
            }
            c.running = false;
            c.exit_code = Some(exit_code);
            c.exit.send_replace(Some(exit_code));
            cid
        };
        info!(container_id = %container_id, exit_code, "[MOCK] Container crashed");
        self.emit(&container_id, ContainerEventKind::Die);
        true
    }

    /// Register a running container that was started by an earlier agent
    /// process. Emits no events. Returns its ID.
    pub fn adopt_running(&self, spec: ContainerSpec) -> String {
        let n = self.next_id();
        let id = format!("mock-{n:012x}");
        let (exit, _) = watch::channel(None);
        let network = Self::network_for(n, &spec);
        let mut state = self.state();
        state.names.insert(spec.name.clone(), id.clone());
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec,
                running: true,
                exit_code: None,
                exit,
                network,
            },
        );
        id
    }

    /// Change the IP address reported for a container.
    pub fn set_ip_address(&self, id: &str, ip: &str) -> bool {
        let mut state = self.state();
        let Ok(cid) = state.resolve(id) else {
            return false;
        };
        match state.containers.get_mut(&cid) {
            Some(c) => {
                c.network.ip_address = ip.to_string();
                true
            }
            None => false,
        }
    }

    /// Number of containers created through `create_container`.
    pub fn created_count(&self) -> usize {
        self.state().created
    }

    /// Number of containers currently running.
    pub fn running_count(&self) -> usize {
        self.state().containers.values().filter(|c| c.running).count()
    }

    pub fn is_running(&self, id: &str) -> bool {
        let state = self.state();
        state
            .resolve(id)
            .ok()
            .and_then(|cid| state.containers.get(&cid))
            .is_some_and(|c| c.running)
    }

    /// Spec a container was created with.
    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        let state = self.state();
        let cid = state.resolve(id).ok()?;
        state.containers.get(&cid).map(|c| c.spec.clone())
    }

    fn network_for(n: u64, spec: &ContainerSpec) -> NetworkSettings {
        let mut ports = PortMapping::new();
        if let Some(port) = spec.env.get("PORT") {
            ports.insert(
                format!("{port}/tcp"),
                vec![PortBinding {
                    host_ip: "0.0.0.0".to_string(),
                    host_port: (32768 + n).to_string(),
                }],
            );
        }
        NetworkSettings {
            ip_address: format!("172.17.{}.{}", (n / 254) % 256, n % 254 + 1),
            ports,
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = {
            let mut state = self.state();
            if state.fail_creates {
                return Err(RuntimeError::Failed(
                    "mock runtime configured to fail creates".to_string(),
                ));
            }
            if state.names.contains_key(&spec.name) {
                return Err(RuntimeError::Conflict(spec.name.clone()));
            }

            let n = self.next_id();
            let id = format!("mock-{n:012x}");
            let (exit, _) = watch::channel(None);
            state.names.insert(spec.name.clone(), id.clone());
            state.containers.insert(
                id.clone(),
                MockContainer {
                    id: id.clone(),
                    spec: spec.clone(),
                    running: false,
                    exit_code: None,
                    exit,
                    network: NetworkSettings::default(),
                },
            );
            state.created += 1;
            id
        };

        info!(
            container_id = %id,
            name = %spec.name,
            image = %spec.image,
            "[MOCK] Created container"
        );
        self.emit(&id, ContainerEventKind::Create);
        Ok(id)
    }

    async fn start_container(
        &self,
        id: &str,
        host_config: &HostConfig,
    ) -> Result<(), RuntimeError> {
        let (cid, emit_start) = {
            let mut state = self.state();
            if state.fail_starts {
                return Err(RuntimeError::Failed(
                    "mock runtime configured to fail starts".to_string(),
                ));
            }
            let cid = state.resolve(id)?;
            let suppress = state.suppress_start_events;
            let n = self.next_id();
            let Some(c) = state.containers.get_mut(&cid) else {
                return Err(RuntimeError::NotFound(id.to_string()));
            };
            c.running = true;
            c.exit_code = None;
            c.exit.send_replace(None);
            c.network = Self::network_for(n, &c.spec);
            if !host_config.publish_all_ports {
                c.network.ports.clear();
            }
            (cid, !suppress)
        };

        debug!(container_id = %cid, "[MOCK] Started container");
        if emit_start {
            self.emit(&cid, ContainerEventKind::Start);
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let state = self.state();
        let cid = state.resolve(id)?;
        let c = state
            .containers
            .get(&cid)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerState {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            running: c.running,
            exit_code: c.exit_code,
            network: c.network.clone(),
        })
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let cid = {
            let mut state = self.state();
            let cid = state.resolve(id)?;
            let Some(c) = state.containers.get_mut(&cid) else {
                return Err(RuntimeError::NotFound(id.to_string()));
            };
            if !c.running {
                return Err(RuntimeError::NotRunning(id.to_string()));
            }
            c.running = false;
            c.exit_code = Some(137);
            c.exit.send_replace(Some(137));
            cid
        };

        info!(container_id = %cid, "[MOCK] Killed container");
        self.emit(&cid, ContainerEventKind::Kill);
        self.emit(&cid, ContainerEventKind::Die);
        Ok(())
    }

    async fn remove_container(&self, id: &str, opts: RemoveOptions) -> Result<(), RuntimeError> {
        let cid = {
            let mut state = self.state();
            let cid = state.resolve(id)?;
            let running = state.containers.get(&cid).is_some_and(|c| c.running);
            if running && !opts.force {
                return Err(RuntimeError::Conflict(format!(
                    "cannot remove running container {id}"
                )));
            }
            if let Some(c) = state.containers.remove(&cid) {
                state.names.remove(&c.spec.name);
                if c.running {
                    c.exit.send_replace(Some(137));
                }
            }
            cid
        };

        debug!(container_id = %cid, "[MOCK] Removed container");
        self.emit(&cid, ContainerEventKind::Destroy);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut exit = {
            let state = self.state();
            let cid = state.resolve(id)?;
            let c = state
                .containers
                .get(&cid)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            if !c.running {
                return Ok(c.exit_code.unwrap_or(0));
            }
            c.exit.subscribe()
        };

        let code = *exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| RuntimeError::NotFound(id.to_string()))?;
        Ok(code.unwrap_or(0))
    }

    fn subscribe(&self, id: &str) -> EventSubscription {
        EventSubscription::new(id, self.events.subscribe())
    }
}
