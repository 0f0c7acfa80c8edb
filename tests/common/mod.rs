//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use drydock::builders::DrydockBuilder;
use drydock::config::DrydockConfig;
use drydock::core::{
    Blueprint, Drydock, DrydockContext, HostBinding, HostPoolFields, HostPoolStrategy,
    InMemoryAuditSink, Lease, Resource, StoreExt,
};
use drydock::runtime::{TaskReport, WorkerHost};
use drydock::util::{LeaseRef, ManualClock, ResourceRef};

/// 2026-01-01T00:00:00Z.
pub const START_MS: u64 = 1_767_225_600_000;

pub struct Harness {
    pub drydock: Drydock,
    pub host: WorkerHost,
    pub clock: ManualClock,
    pub audit: Arc<Mutex<InMemoryAuditSink>>,
}

impl Harness {
    pub fn ctx(&self) -> &DrydockContext {
        self.drydock.context()
    }

    /// Run every task that is due right now.
    pub async fn drain(&self) -> Vec<TaskReport> {
        self.host.run_until_idle(1_000).await.expect("queue works")
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn lease(&self, lease: LeaseRef) -> Lease {
        self.ctx()
            .store()
            .snapshot(|t| t.lease(lease).cloned())
            .unwrap()
            .unwrap()
    }

    pub fn resource(&self, resource: ResourceRef) -> Resource {
        self.ctx()
            .store()
            .snapshot(|t| t.resource(resource).cloned())
            .unwrap()
            .unwrap()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.ctx()
            .store()
            .snapshot(|t| t.resources.values().cloned().collect())
            .unwrap()
    }

    pub fn lock_count(&self) -> usize {
        self.ctx().store().snapshot(|t| t.slot_locks.len()).unwrap()
    }
}

pub fn test_config() -> DrydockConfig {
    DrydockConfig {
        worker_count: 2,
        retry_backoff_ms: 1_000,
        max_backoff_ms: 60_000,
        idle_poll_ms: 20,
        wait_poll_interval_ms: 20,
        release_recheck_ms: 15_000,
        ..DrydockConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config(), |builder| builder)
}

pub fn harness_with(
    config: DrydockConfig,
    customize: impl FnOnce(DrydockBuilder) -> DrydockBuilder,
) -> Harness {
    drydock::util::init_tracing();
    let clock = ManualClock::new(START_MS);
    let runtime = customize(DrydockBuilder::new(config).with_clock(Arc::new(clock.clone())))
        .build()
        .expect("harness builds");
    Harness {
        drydock: runtime.drydock,
        host: runtime.host,
        clock,
        audit: runtime.audit_log.expect("audit enabled"),
    }
}

pub fn bindings(ids: &[&str]) -> HostPoolFields {
    HostPoolFields {
        bindings: ids
            .iter()
            .enumerate()
            .map(|(i, id)| HostBinding {
                id: (*id).to_string(),
                device: format!("dev-{id}"),
                address: format!("10.0.0.{}", i + 1),
                port: 22,
            })
            .collect(),
        credential: Some("ssh-key-1".into()),
    }
}

/// Save a host pool blueprint with the given bindings.
pub fn host_pool(h: &Harness, ids: &[&str]) -> Blueprint {
    h.drydock
        .create_blueprint(HostPoolStrategy::blueprint("hosts", bindings(ids)))
        .expect("blueprint saved")
}
