//! Host agent actors.
//!
//! - [`host`]: the per-host reconciliation loop and its shutdown handle
//! - [`instance`]: the per-assignment instance worker

pub mod host;
pub mod instance;

pub use host::{HostAgentHandle, HostReconciler};
pub use instance::{container_spec, InstanceWorker, WorkerContext};
