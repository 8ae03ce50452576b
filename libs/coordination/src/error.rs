//! Coordination errors.

use thiserror::Error;

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordError>;

/// Errors returned by a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// The node does not exist.
    #[error("node does not exist: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The path is not an absolute, normalized node path.
    #[error("invalid node path: '{0}'")]
    InvalidPath(String),

    /// A node payload could not be encoded or decoded.
    #[error("invalid record at {path}: {message}")]
    Serialization { path: String, message: String },

    /// The coordination service could not be reached.
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    /// The session was closed; leadership and watches are gone.
    #[error("coordination session closed")]
    SessionClosed,
}

impl CoordError {
    /// Returns true if the node was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordError::NoNode(_))
    }

    /// Returns true if the node already existed.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordError::NodeExists(_))
    }

    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::Unavailable(_) | CoordError::SessionClosed)
    }

    /// Returns true if the stored record itself is defective.
    pub fn is_invalid_record(&self) -> bool {
        matches!(self, CoordError::Serialization { .. })
    }
}
