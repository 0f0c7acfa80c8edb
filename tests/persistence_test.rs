//! File backends across restarts.
//!
//! Covers:
//! 1. Rows and queued tasks surviving a restart
//! 2. Tasks in flight at a crash delivered again
//! 3. Locks persisted with the rows they guard

mod common;

use std::time::Duration;

use drydock::config::{DrydockConfig, QueueBackendConfig, StoreBackendConfig};
use drydock::core::{Actor, LeaseRequest, LeaseStatus, HOST_TYPE};
use drydock::runtime::TaskReport;

use common::{harness_with, host_pool, test_config, Harness};

fn file_config(dir: &tempfile::TempDir) -> DrydockConfig {
    DrydockConfig {
        store: StoreBackendConfig::File {
            path: dir.path().join("state.json"),
        },
        queue: QueueBackendConfig::File {
            path: dir.path().join("tasks.jsonl"),
        },
        ..test_config()
    }
}

fn open(dir: &tempfile::TempDir) -> Harness {
    harness_with(file_config(dir), |builder| builder)
}

#[tokio::test]
async fn test_queued_allocation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let lease = {
        let h = open(&dir);
        host_pool(&h, &["b1"]);
        h.drydock
            .request_lease(&Actor::System, LeaseRequest::new(HOST_TYPE))
            .unwrap()
    };

    let h = open(&dir);
    assert_eq!(h.lease(lease).status, LeaseStatus::Pending);
    assert_eq!(h.ctx().tasks().len(), 1);

    let reports = h.drain().await;
    assert!(matches!(reports.as_slice(), [TaskReport::Completed { .. }]));
    assert_eq!(h.lease(lease).status, LeaseStatus::Active);
    assert_eq!(h.lock_count(), 2);
}

#[tokio::test]
async fn test_task_in_flight_at_crash_is_redelivered() {
    let dir = tempfile::tempdir().unwrap();
    let (lease, task_id) = {
        let h = open(&dir);
        host_pool(&h, &["b1"]);
        let lease = h
            .drydock
            .request_lease(&Actor::System, LeaseRequest::new(HOST_TYPE))
            .unwrap();
        // Leased by a worker that then dies.
        let task = h
            .ctx()
            .tasks()
            .lease_due(h.ctx().now_ms(), Duration::from_secs(300))
            .unwrap()
            .expect("allocate task due");
        (lease, task.id)
    };

    let h = open(&dir);
    let reports = h.drain().await;
    assert!(matches!(reports.as_slice(), [TaskReport::Completed { id, .. }] if *id == task_id));
    assert_eq!(h.lease(lease).status, LeaseStatus::Active);
}

#[tokio::test]
async fn test_released_state_and_locks_persist() {
    let dir = tempfile::tempdir().unwrap();
    let lease = {
        let h = open(&dir);
        host_pool(&h, &["b1"]);
        let lease = h
            .drydock
            .request_lease(&Actor::System, LeaseRequest::new(HOST_TYPE))
            .unwrap();
        h.drain().await;
        h.drydock.release_lease(&Actor::System, lease).unwrap();
        h.drain().await;
        lease
    };

    let h = open(&dir);
    assert_eq!(h.lease(lease).status, LeaseStatus::Destroyed);
    assert!(h.ctx().tasks().is_empty());
    // Only the resource's binding lock remains.
    assert_eq!(h.lock_count(), 1);
}
