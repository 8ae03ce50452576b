//! # convoy-scheduler
//!
//! The cluster leader: an elected process that keeps every service's
//! assignments in line with its desired instance count.
//!
//! ## Modules
//!
//! - [`leader`]: election loop and the service list watch
//! - [`service`]: per-service watcher and the convergence pass
//! - [`placement`]: host selection for new instances
//! - [`snapshot`]: snapshot request drain
//!
//! The leader never talks to hosts. It creates and deletes assignments
//! under `/hosts/{host_id}` and each host's agent acts on them.

pub mod config;
pub mod error;
pub mod leader;
pub mod placement;
pub mod service;
pub mod snapshot;

pub use config::LeaderConfig;
pub use error::{SchedulerError, SchedulerResult, SnapshotError};
pub use leader::ClusterLeader;
pub use placement::{PlacementPolicy, RandomPlacement};
pub use service::{
    list_instances, stop_service_instances, update_service_instances, PassStats,
    ServiceInstances, ServiceWatcher,
};
pub use snapshot::{
    process_snapshot_requests, snapshot_label, watch_snapshot_requests, LabelSnapshotter,
    Snapshotter,
};
