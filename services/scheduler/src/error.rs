//! Scheduler error types.

use convoy_coord::CoordError;
use convoy_id::ServiceId;
use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while scheduling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordError),

    #[error("invalid service {service_id}: {reason}")]
    InvalidService {
        service_id: ServiceId,
        reason: String,
    },
}

impl SchedulerError {
    /// True if the pass should be retried after the fixed delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Coordination(e) if e.is_transient())
    }
}

/// Errors from a snapshot collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("snapshot failed: {0}")]
    Failed(String),
}

impl From<CoordError> for SnapshotError {
    fn from(e: CoordError) -> Self {
        SnapshotError::Failed(e.to_string())
    }
}
