//! Snapshot request drain.
//!
//! Requests queue under `/snapshots/requests`. The leader handles each one
//! once and writes the outcome back into the request: a label on success,
//! an error otherwise. Requests that already carry either are skipped, so
//! a new leader can drain the queue again without repeating work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_coord::{node, paths, Coordinator, SnapshotRequest, Watch};
use convoy_id::ServiceId;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{SchedulerResult, SnapshotError};

/// Takes snapshots of a service's state.
#[async_trait]
pub trait Snapshotter: Send + Sync + 'static {
    /// Snapshots `service_id` and returns the snapshot label.
    async fn snapshot(&self, service_id: &ServiceId) -> Result<String, SnapshotError>;
}

/// Snapshot label: `{service_id}_{YYYYMMDD-HHMMSS}` in UTC.
pub fn snapshot_label(service_id: &ServiceId, at: DateTime<Utc>) -> String {
    format!("{}_{}", service_id, at.format("%Y%m%d-%H%M%S"))
}

/// Labels snapshots of known services without copying any data.
pub struct LabelSnapshotter {
    coord: Arc<dyn Coordinator>,
}

impl LabelSnapshotter {
    pub fn new(coord: Arc<dyn Coordinator>) -> Self {
        Self { coord }
    }
}

#[async_trait]
impl Snapshotter for LabelSnapshotter {
    async fn snapshot(&self, service_id: &ServiceId) -> Result<String, SnapshotError> {
        if !self.coord.exists(&paths::service(service_id)).await? {
            return Err(SnapshotError::UnknownService(service_id.clone()));
        }
        Ok(snapshot_label(service_id, Utc::now()))
    }
}

/// Drains the request queue until aborted, re-running on every change.
pub async fn watch_snapshot_requests(
    coord: Arc<dyn Coordinator>,
    snapshotter: Arc<dyn Snapshotter>,
    retry_delay: Duration,
) {
    info!(path = paths::SNAPSHOT_REQUESTS, "Watching snapshot requests");

    loop {
        match process_snapshot_requests(coord.as_ref(), snapshotter.as_ref()).await {
            Ok((handled, changed)) => {
                if handled > 0 {
                    info!(handled, "Processed snapshot requests");
                }
                let event = changed.await;
                debug!(kind = ?event.kind, "Snapshot requests changed");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Failed to process snapshot requests, retrying"
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Handles every unprocessed request once.
///
/// Returns how many requests were handled and a watch on the queue.
#[instrument(skip_all)]
pub async fn process_snapshot_requests(
    coord: &dyn Coordinator,
    snapshotter: &dyn Snapshotter,
) -> SchedulerResult<(usize, Watch)> {
    coord.create_dir(paths::SNAPSHOT_REQUESTS).await?;
    let (children, changed) = coord.children_w(paths::SNAPSHOT_REQUESTS).await?;

    let mut handled = 0;
    for child in children {
        let path = paths::join(paths::SNAPSHOT_REQUESTS, &child);
        let data = match coord.get(&path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        if handle_request(coord, snapshotter, &path, &data).await? {
            handled += 1;
        }
    }
    Ok((handled, changed))
}

/// Returns false if the request was already handled.
async fn handle_request(
    coord: &dyn Coordinator,
    snapshotter: &dyn Snapshotter,
    path: &str,
    data: &[u8],
) -> SchedulerResult<bool> {
    let mut request: SnapshotRequest = match node::decode(path, data) {
        Ok(request) => request,
        Err(e) => {
            // Unreadable requests get an error written into whatever JSON
            // object they hold, so later passes see them as handled.
            let mut fields = match serde_json::from_slice::<Value>(data) {
                Ok(Value::Object(fields)) => fields,
                _ => Map::new(),
            };
            if fields.get("error").is_some_and(|v| !v.is_null()) {
                return Ok(false);
            }
            warn!(path, error = %e, "Rejecting unreadable snapshot request");
            fields.insert("error".to_string(), Value::String(e.to_string()));
            node::store(coord, path, &Value::Object(fields)).await?;
            return Ok(true);
        }
    };
    if request.is_processed() {
        return Ok(false);
    }

    info!(request_id = %request.id, service_id = %request.service_id, "Starting snapshot");
    match snapshotter.snapshot(&request.service_id).await {
        Ok(label) => {
            info!(request_id = %request.id, label = %label, "Snapshot complete");
            request.label = Some(label);
        }
        Err(e) => {
            warn!(request_id = %request.id, error = %e, "Snapshot failed");
            request.error = Some(e.to_string());
        }
    }
    node::store(coord, path, &request).await?;
    Ok(true)
}
