//! # convoy-coord
//!
//! The coordination service as seen by the reconciliation core: a
//! hierarchical node store with one-shot watches and a leader-election
//! primitive, plus the node layout and record types convoy stores in it.
//!
//! All cross-host state lives here. Hosts and the leader never talk to each
//! other directly; they read and write nodes and react to watches.
//!
//! ## Modules
//!
//! - [`coordinator`]: the `Coordinator` and `Leader` capabilities
//! - [`event`]: watch events and the one-shot [`Watch`] future
//! - [`paths`]: node path layout
//! - [`model`]: records stored in nodes
//! - [`node`]: typed JSON load/store helpers
//! - [`memory`]: in-memory implementation with fault injection

pub mod coordinator;
pub mod error;
pub mod event;
pub mod memory;
pub mod model;
pub mod node;
pub mod paths;

pub use coordinator::{Coordinator, Leader};
pub use error::{CoordError, Result};
pub use event::{Event, EventKind, Watch};
pub use memory::MemoryCoordinator;
pub use model::{
    Assignment, DesiredState, InstanceState, LeaderRecord, Lifecycle, PoolMember, PortBinding,
    PortMapping, ServiceDefinition, SnapshotRequest,
};
