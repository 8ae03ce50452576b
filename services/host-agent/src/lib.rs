//! convoy Host Agent Library
//!
//! The host agent runs on every host and converges the containers running
//! there with the assignments the cluster leader placed on it.
//!
//! ## Architecture
//!
//! ```text
//! HostReconciler(host_id)
//! └── InstanceWorker(instance_id)   (per-assignment container lifecycle)
//! ```
//!
//! The reconciler watches `/hosts/{host_id}`; each worker watches its own
//! assignment and service definition and writes the instance's actual state
//! under `/services/{service_id}/{instance_id}`.
//!
//! ## Modules
//!
//! - `actors`: host reconciler and instance worker
//! - `runtime`: container runtime interface and mock
//! - `config`: agent configuration and worker timings

pub mod actors;
pub mod config;
pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use actors::{HostAgentHandle, HostReconciler, InstanceWorker};
pub use config::{AgentConfig, WorkerTimings};
pub use error::{AgentError, WorkerError};
pub use runtime::{ContainerRuntime, MockRuntime, RuntimeError};
