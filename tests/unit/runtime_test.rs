//! Tests for tokio spawner utilities and the worker host

use std::time::Duration;

use drydock::builders::DrydockBuilder;
use drydock::config::DrydockConfig;
use drydock::runtime::{health, Spawn, TaskReport, TokioSpawner, WorkerHostSettings};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_backoff_doubles_until_cap() {
    let settings = WorkerHostSettings {
        retry_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(10),
        ..WorkerHostSettings::default()
    };
    assert_eq!(settings.backoff(0), Duration::from_secs(1));
    assert_eq!(settings.backoff(3), Duration::from_secs(8));
    assert_eq!(settings.backoff(4), Duration::from_secs(10));
    assert_eq!(settings.backoff(40), Duration::from_secs(10));
}

#[tokio::test]
async fn test_idle_host_reports_idle() {
    let runtime = DrydockBuilder::new(DrydockConfig::default()).build().unwrap();
    assert_eq!(runtime.host.run_one().await.unwrap(), TaskReport::Idle);
    assert!(runtime.host.run_until_idle(10).await.unwrap().is_empty());

    let status = health(&runtime.drydock);
    assert!(status.ok);
    assert_eq!(status.queued_tasks, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_spawned_loops() {
    let runtime = DrydockBuilder::new(DrydockConfig {
        idle_poll_ms: 10,
        ..DrydockConfig::default()
    })
    .build()
    .unwrap();
    runtime.spawn_workers(&TokioSpawner::current());
    tokio::time::sleep(Duration::from_millis(30)).await;

    runtime.shutdown();
    assert!(runtime.host.is_stopped());
}

#[tokio::test]
async fn test_submit_lease_reports_pending_then_broken() {
    use drydock::core::{Actor, LeaseRequest, LeaseStatus, HOST_TYPE};
    use drydock::runtime::{lease_status, submit_lease};

    let runtime = DrydockBuilder::new(DrydockConfig::default()).build().unwrap();
    let submitted = submit_lease(&runtime.drydock, &Actor::System, LeaseRequest::new(HOST_TYPE)).unwrap();
    assert_eq!(submitted.status, LeaseStatus::Pending);
    assert!(submitted.resource.is_none());

    // No blueprints: the lease breaks and says why.
    runtime.host.run_until_idle(10).await.unwrap();
    let status = lease_status(&runtime.drydock, &Actor::System, submitted.lease).unwrap();
    assert_eq!(status.status, LeaseStatus::Broken);
    assert!(status.reason.is_some());
}
