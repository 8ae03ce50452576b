//! Host agent errors.

use convoy_coord::CoordError;
use convoy_id::{InstanceId, ServiceId};
use convoy_reconcile::ReconcileError;
use thiserror::Error;

use crate::runtime::RuntimeError;

/// Final error of an instance worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The assignment node is missing, unparsable or inconsistent.
    #[error("invalid assignment {path}: {reason}")]
    InvalidAssignment { path: String, reason: String },

    #[error("instance state of {0} is missing or invalid")]
    InvalidInstanceState(InstanceId),

    #[error("service {0} is missing or invalid")]
    InvalidService(ServiceId),

    #[error("container {container} not found after {attempts} attempts")]
    AttachFailed { container: String, attempts: u32 },
}

impl WorkerError {
    /// Returns true if the failing call may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Coordination(e) if e.is_transient())
    }
}

/// Host agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordError),

    /// First error reported by a worker while shutting down.
    #[error("instance worker failed: {0}")]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Coordination(e) => e.is_transient(),
            AgentError::Worker(e) => e.is_transient(),
            AgentError::Reconcile(_) => false,
        }
    }
}
