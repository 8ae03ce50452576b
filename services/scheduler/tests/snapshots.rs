//! Snapshot request handling.

mod common;

use std::sync::Arc;

use common::*;
use convoy_coord::{node, paths, Coordinator, MemoryCoordinator, SnapshotRequest};
use convoy_id::{ServiceId, SnapshotRequestId};
use convoy_scheduler::{process_snapshot_requests, LabelSnapshotter};

fn snapshotter(coord: &MemoryCoordinator) -> LabelSnapshotter {
    LabelSnapshotter::new(Arc::new(coord.clone()))
}

async fn queue(coord: &MemoryCoordinator, service: &str) -> String {
    let request = SnapshotRequest::new(ServiceId::parse(service).unwrap());
    let path = paths::snapshot_request(&request.id);
    node::create_record(coord, &path, &request).await.unwrap();
    path
}

#[tokio::test]
async fn labels_each_request_once() {
    let coord = MemoryCoordinator::new();
    put_service(&coord, &service_def("web", 1)).await;
    let path = queue(&coord, "web").await;
    let snapshotter = snapshotter(&coord);

    let (handled, _) = process_snapshot_requests(&coord, &snapshotter).await.unwrap();
    assert_eq!(handled, 1);
    let first: SnapshotRequest = node::load(&coord, &path).await.unwrap();
    let label = first.label.clone().unwrap();
    assert!(label.starts_with("web_"));
    assert_eq!(label.len(), "web_".len() + "YYYYMMDD-HHMMSS".len());

    let (handled, _) = process_snapshot_requests(&coord, &snapshotter).await.unwrap();
    assert_eq!(handled, 0);
    let second: SnapshotRequest = node::load(&coord, &path).await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn unknown_service_records_an_error() {
    let coord = MemoryCoordinator::new();
    let path = queue(&coord, "missing").await;
    let snapshotter = snapshotter(&coord);

    let (handled, _) = process_snapshot_requests(&coord, &snapshotter).await.unwrap();
    assert_eq!(handled, 1);
    let done: SnapshotRequest = node::load(&coord, &path).await.unwrap();
    assert!(done.label.is_none());
    assert!(done.error.unwrap().contains("missing"));

    let (handled, _) = process_snapshot_requests(&coord, &snapshotter).await.unwrap();
    assert_eq!(handled, 0);
}

#[tokio::test]
async fn unreadable_request_is_rejected_once() {
    let coord = MemoryCoordinator::new();
    let path = paths::snapshot_request(&SnapshotRequestId::new());
    coord
        .create(&path, br#"{"service_id": 42}"#.to_vec())
        .await
        .unwrap();
    let snapshotter = snapshotter(&coord);

    let (handled, _) = process_snapshot_requests(&coord, &snapshotter).await.unwrap();
    assert_eq!(handled, 1);
    let raw: serde_json::Value = node::load(&coord, &path).await.unwrap();
    assert_eq!(raw["service_id"], 42);
    assert!(raw["error"].is_string());

    let (handled, _) = process_snapshot_requests(&coord, &snapshotter).await.unwrap();
    assert_eq!(handled, 0);
}

#[tokio::test]
async fn new_request_fires_the_queue_watch() {
    let coord = MemoryCoordinator::new();
    put_service(&coord, &service_def("web", 1)).await;
    let snapshotter = snapshotter(&coord);

    let (handled, changed) = process_snapshot_requests(&coord, &snapshotter).await.unwrap();
    assert_eq!(handled, 0);

    queue(&coord, "web").await;
    let event = tokio::time::timeout(std::time::Duration::from_secs(1), changed)
        .await
        .unwrap();
    assert_eq!(event.kind, convoy_coord::EventKind::NodeChildrenChanged);
}
