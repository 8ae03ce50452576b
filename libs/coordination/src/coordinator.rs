//! Coordination service capabilities.

use async_trait::async_trait;

use crate::error::Result;
use crate::event::Watch;
use crate::model::LeaderRecord;

/// Hierarchical node store with one-shot watches and leader election.
///
/// Paths are absolute (`/hosts/h1`). Payloads are opaque bytes; typed access
/// goes through the helpers in [`crate::node`].
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Creates `path` and any missing ancestors. Succeeds if it exists.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Creates a node. Fails with `NodeExists` if it is already present.
    /// Missing ancestors are created empty.
    async fn create(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Replaces the payload of an existing node.
    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Reads a node and watches it for data changes or deletion.
    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Watch)>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Deletes a node and its whole subtree.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the immediate children, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Lists children and watches the child list.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Creates an election candidate on `path`.
    fn new_leader(&self, path: &str, record: LeaderRecord) -> Box<dyn Leader>;
}

/// Candidate in a leader election.
#[async_trait]
pub trait Leader: Send + Sync {
    /// Waits until this candidate holds leadership.
    ///
    /// The returned watch fires when leadership is lost. Dropping the future
    /// before it resolves withdraws the candidacy.
    async fn take_lead(&self) -> Result<Watch>;

    /// Gives up leadership, or withdraws if not leading.
    async fn release_lead(&self) -> Result<()>;
}
