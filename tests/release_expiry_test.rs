//! Release commands and expiration.
//!
//! Covers:
//! 1. RELEASE applied exactly once across task redelivery
//! 2. Racing release requests posting a single command
//! 3. Expire tasks firing early yielding until the deadline
//! 4. Expired leases released by the system identity
//! 5. Teardown failures retried until the strategy recovers

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;

use drydock::core::{
    Actor, AuditKind, Blueprint, BlueprintStrategy, Command, CommandKind, DrydockContext, DrydockError,
    HostPoolStrategy, Lease, LeaseRequest, LeaseStatus, Resource, ResourceStatus, ResourceTemplate, Result, StoreExt,
    TaskKind, TaskOutcome, TaskSpec, HOST_TYPE,
};
use drydock::runtime::TaskReport;
use drydock::util::ObjectRef;

use common::{harness, harness_with, host_pool, test_config, START_MS};

fn commands_for(h: &common::Harness, target: ObjectRef) -> Vec<Command> {
    h.ctx()
        .store()
        .snapshot(|t| t.commands.values().filter(|c| c.target == target).cloned().collect())
        .unwrap()
}

/// Authors of every command posted against `target`, from the audit trail.
fn posted_by(h: &common::Harness, target: ObjectRef) -> Vec<String> {
    h.audit
        .lock()
        .events_for(target)
        .into_iter()
        .filter(|e| e.kind == AuditKind::CommandPosted)
        .filter_map(|e| e.payload?["author"].as_str().map(ToString::to_string))
        .collect()
}

#[tokio::test]
async fn test_release_consumed_once_across_redelivery() {
    let h = harness();
    host_pool(&h, &["b1"]);
    let lease = h
        .drydock
        .request_lease(&Actor::System, LeaseRequest::new(HOST_TYPE))
        .unwrap();
    h.drain().await;

    h.drydock.release_lease(&Actor::System, lease).unwrap();
    // A second request while the first is pending posts nothing new.
    h.drydock.release_lease(&Actor::System, lease).unwrap();
    assert!(matches!(
        commands_for(&h, ObjectRef::Lease(lease)).as_slice(),
        [c] if c.kind == CommandKind::Release && !c.consumed
    ));

    let task = h
        .ctx()
        .tasks()
        .lease_due(h.ctx().now_ms(), Duration::from_secs(30))
        .unwrap()
        .expect("update task due");
    assert!(matches!(task.kind, TaskKind::LeaseUpdate { is_expire: false, .. }));
    assert!(matches!(h.host.worker().handle(task.kind).await, TaskOutcome::Ready));
    assert_eq!(h.lease(lease).status, LeaseStatus::Destroyed);

    // The worker never acknowledged; the task comes back.
    h.advance(Duration::from_secs(31));
    let reports = h.drain().await;
    assert!(matches!(reports.as_slice(), [TaskReport::Completed { .. }]));

    // Destruction cleared the command; it was posted once.
    assert!(commands_for(&h, ObjectRef::Lease(lease)).is_empty());
    assert_eq!(posted_by(&h, ObjectRef::Lease(lease)), vec!["system".to_string()]);

    let released = h
        .audit
        .lock()
        .events_for(lease)
        .into_iter()
        .filter(|e| e.kind == AuditKind::LeaseReleased)
        .count();
    assert_eq!(released, 1);
}

#[tokio::test]
async fn test_concurrent_releases_post_one_command() {
    const CALLERS: usize = 8;
    let h = harness();
    host_pool(&h, &["b1"]);
    let lease = h
        .drydock
        .request_lease(&Actor::System, LeaseRequest::new(HOST_TYPE))
        .unwrap();

    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let drydock = h.drydock.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                drydock.release_lease(&Actor::System, lease)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(commands_for(&h, ObjectRef::Lease(lease)).len(), 1);
    assert_eq!(posted_by(&h, ObjectRef::Lease(lease)).len(), 1);
}

#[tokio::test]
async fn test_early_expire_task_yields_until_deadline() {
    let h = harness();
    let bp = host_pool(&h, &["b1"]);
    let deadline = START_MS + 60_000;
    let resource = h
        .ctx()
        .allocate_resource(
            ResourceTemplate::new(&bp, "short lived")
                .until(deadline)
                .activate_when_allocated(),
        )
        .unwrap()
        .reference;

    // A timer that fired five seconds early.
    h.clock.set(deadline - 5_000);
    h.ctx()
        .tasks()
        .schedule(
            TaskSpec::new(TaskKind::ResourceUpdate {
                resource,
                is_expire: true,
            })
            .not_before(Some(deadline - 5_000)),
            h.ctx().now_ms(),
        )
        .unwrap();

    let reports = h.drain().await;
    assert!(matches!(reports.as_slice(), [TaskReport::Yielded { delay_ms: 5_000, .. }]));
    assert_eq!(h.resource(resource).status, ResourceStatus::Active);
    assert!(h.drain().await.is_empty());

    h.advance(Duration::from_secs(5));
    h.drain().await;
    assert_eq!(h.resource(resource).status, ResourceStatus::Destroyed);

    assert!(commands_for(&h, ObjectRef::Resource(resource)).is_empty());
    assert_eq!(posted_by(&h, ObjectRef::Resource(resource)), vec!["system".to_string()]);
}

#[tokio::test]
async fn test_expired_lease_is_released_by_system() {
    let h = harness();
    host_pool(&h, &["b1"]);
    let lease = h
        .drydock
        .request_lease(
            &Actor::user("alice"),
            LeaseRequest::new(HOST_TYPE).until(START_MS + 120_000),
        )
        .unwrap();
    h.drain().await;
    assert_eq!(h.lease(lease).status, LeaseStatus::Active);

    // Not due yet.
    h.advance(Duration::from_secs(60));
    assert!(h.drain().await.is_empty());
    assert_eq!(h.lease(lease).status, LeaseStatus::Active);

    h.advance(Duration::from_secs(60));
    h.drain().await;
    assert_eq!(h.lease(lease).status, LeaseStatus::Destroyed);
    assert_eq!(posted_by(&h, ObjectRef::Lease(lease)), vec!["system".to_string()]);
}

#[tokio::test]
async fn test_update_before_deadline_does_not_wait() {
    let h = harness();
    host_pool(&h, &["b1"]);
    let lease = h
        .drydock
        .request_lease(&Actor::System, LeaseRequest::new(HOST_TYPE).until(START_MS + 600_000))
        .unwrap();
    h.drain().await;

    h.drydock.release_lease(&Actor::System, lease).unwrap();
    h.drain().await;
    assert_eq!(h.lease(lease).status, LeaseStatus::Destroyed);

    // The leftover expire task finds nothing to do.
    h.advance(Duration::from_secs(600));
    let reports = h.drain().await;
    assert!(matches!(reports.as_slice(), [TaskReport::Completed { .. }]));
}

/// Host pool whose lease teardown fails a fixed number of times.
#[derive(Debug, Clone, Default)]
struct FlakyTeardown {
    failures_left: Arc<AtomicU32>,
    destroyed: Arc<AtomicU32>,
}

#[async_trait]
impl BlueprintStrategy for FlakyTeardown {
    fn type_tag(&self) -> &str {
        HOST_TYPE
    }

    fn can_ever_allocate(&self, blueprint: &Blueprint, lease: &Lease) -> bool {
        HostPoolStrategy.can_ever_allocate(blueprint, lease)
    }

    async fn can_allocate_now(&self, ctx: &DrydockContext, blueprint: &Blueprint, lease: &Lease) -> Result<bool> {
        HostPoolStrategy.can_allocate_now(ctx, blueprint, lease).await
    }

    async fn allocate(&self, ctx: &DrydockContext, blueprint: &Blueprint, lease: &Lease) -> Result<Resource> {
        HostPoolStrategy.allocate(ctx, blueprint, lease).await
    }

    async fn can_acquire_lease(
        &self,
        ctx: &DrydockContext,
        blueprint: &Blueprint,
        resource: &Resource,
        lease: &Lease,
    ) -> Result<bool> {
        HostPoolStrategy.can_acquire_lease(ctx, blueprint, resource, lease).await
    }

    async fn acquire_lease(
        &self,
        ctx: &DrydockContext,
        blueprint: &Blueprint,
        resource: &Resource,
        lease: &Lease,
    ) -> Result<Lease> {
        HostPoolStrategy.acquire_lease(ctx, blueprint, resource, lease).await
    }

    async fn destroy_resource(&self, _ctx: &DrydockContext, _blueprint: &Blueprint, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    async fn destroy_lease(
        &self,
        _ctx: &DrydockContext,
        _blueprint: &Blueprint,
        _resource: &Resource,
        _lease: &Lease,
    ) -> Result<()> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            // Even a "permanent" looking error is retried during teardown.
            return Err(DrydockError::Precondition("host unreachable".into()));
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_teardown_failure_is_retried() {
    let strategy = FlakyTeardown::default();
    strategy.failures_left.store(2, Ordering::SeqCst);
    let registered = strategy.clone();
    let h = harness_with(test_config(), move |builder| builder.with_strategy(registered));
    host_pool(&h, &["b1"]);

    let lease = h
        .drydock
        .request_lease(&Actor::System, LeaseRequest::new(HOST_TYPE))
        .unwrap();
    h.drain().await;
    h.drydock.release_lease(&Actor::System, lease).unwrap();

    let reports = h.drain().await;
    assert!(matches!(reports.as_slice(), [TaskReport::Retrying { attempts: 1, .. }]));
    assert_eq!(h.lease(lease).status, LeaseStatus::Released);

    // Backoff doubles: 1s, then 2s.
    h.advance(Duration::from_secs(1));
    assert!(matches!(h.drain().await.as_slice(), [TaskReport::Retrying { attempts: 2, .. }]));
    h.advance(Duration::from_secs(2));
    assert!(matches!(h.drain().await.as_slice(), [TaskReport::Completed { .. }]));

    assert_eq!(h.lease(lease).status, LeaseStatus::Destroyed);
    assert_eq!(strategy.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(h.host.stats().retried, 2);
}
