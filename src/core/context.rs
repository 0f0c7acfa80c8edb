//! The collaborators every transition runs against.
//!
//! [`DrydockContext`] is cheap to clone and shared by the facade, the
//! allocator, the worker, and blueprint strategies. It owns no lifecycle
//! state of its own: everything authoritative lives in the [`Store`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::core::audit::{build_audit_event, AuditKind, AuditSink, AuditSubject};
use crate::core::command::CommandChannel;
use crate::core::error::Result;
use crate::core::model::{Command, CommandKind};
use crate::core::policy::Actor;
use crate::core::slot_lock::SlotLockManager;
use crate::core::store::{Store, StoreExt};
use crate::core::task::{TaskKind, TaskScheduler, TaskSpec};
use crate::util::{Clock, LeaseRef, ObjectRef, ResourceRef, SystemClock, TaskId};

/// Shared, thread-safe audit sink.
pub type SharedAuditSink = Arc<Mutex<dyn AuditSink>>;

type WaiterMap = Arc<Mutex<HashMap<LeaseRef, Arc<Notify>>>>;

/// Interest in a lease's status changes. The lease's entry is dropped with
/// its last waiter.
#[derive(Debug)]
pub struct LeaseWaiter {
    lease: LeaseRef,
    signal: Arc<Notify>,
    waiters: WaiterMap,
}

impl LeaseWaiter {
    /// Fires whenever the lease changes status.
    #[must_use]
    pub fn signal(&self) -> &Notify {
        &self.signal
    }
}

impl Drop for LeaseWaiter {
    fn drop(&mut self) {
        let mut waiters = self.waiters.lock();
        // The map holds one reference and this waiter another.
        let last = waiters
            .get(&self.lease)
            .is_some_and(|current| Arc::ptr_eq(current, &self.signal) && Arc::strong_count(current) <= 2);
        if last {
            waiters.remove(&self.lease);
        }
    }
}

/// Store, task queue, clock, audit sink, and in-process waiters.
#[derive(Clone)]
pub struct DrydockContext {
    store: Arc<dyn Store>,
    tasks: TaskScheduler,
    clock: Arc<dyn Clock>,
    audit: Option<SharedAuditSink>,
    waiters: WaiterMap,
}

impl std::fmt::Debug for DrydockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrydockContext")
            .field("tasks", &self.tasks)
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

impl DrydockContext {
    /// Bundle a store and task scheduler with the system clock.
    pub fn new(store: Arc<dyn Store>, tasks: TaskScheduler) -> Self {
        Self {
            store,
            tasks,
            clock: Arc::new(SystemClock),
            audit: None,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record lifecycle events to `sink`.
    #[must_use]
    pub fn with_audit(mut self, sink: SharedAuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    /// The persistence layer.
    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// The task scheduler.
    #[must_use]
    pub const fn tasks(&self) -> &TaskScheduler {
        &self.tasks
    }

    /// Current epoch milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Slot lock manager over this context's store.
    #[must_use]
    pub fn slot_locks(&self) -> SlotLockManager<'_> {
        SlotLockManager::new(self.store(), self.now_ms())
    }

    /// Command channel over this context's store.
    #[must_use]
    pub fn commands(&self) -> CommandChannel<'_> {
        CommandChannel::new(self.store(), self.now_ms())
    }

    /// Post a RELEASE for `target` unless one is already waiting. The check
    /// and the post share one transaction, so concurrent callers post once.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn request_release(&self, target: ObjectRef, author: &Actor) -> Result<Option<Command>> {
        let now = self.now_ms();
        let posted = self.store().transaction(|tables| {
            if CommandChannel::is_releasing_in(tables, target) {
                return Ok(None);
            }
            Ok(Some(CommandChannel::post_in(
                tables,
                target,
                author.clone(),
                CommandKind::Release,
                now,
            )))
        })?;
        if let Some(command) = &posted {
            tracing::debug!(target_ref = %target, author = %author, sequence = command.sequence, "release posted");
            self.audit(
                target,
                AuditKind::CommandPosted,
                Some(serde_json::json!({ "kind": command.kind.to_string(), "author": author.to_string() })),
            );
        }
        Ok(posted)
    }

    /// Record an audit event if a sink is configured.
    pub fn audit(&self, subject: impl Into<AuditSubject>, kind: AuditKind, payload: Option<Value>) {
        if let Some(sink) = &self.audit {
            let event = build_audit_event(subject, kind, self.now_ms(), payload);
            sink.lock().record(event);
        }
    }

    /// Schedule an update task for a resource. With `expire_at`, the task is
    /// an expire task delayed until that epoch.
    ///
    /// # Errors
    ///
    /// Propagates task queue errors.
    pub fn schedule_resource_update(&self, resource: ResourceRef, expire_at: Option<u64>) -> Result<TaskId> {
        let spec = match expire_at {
            Some(epoch) => TaskSpec::new(TaskKind::ResourceUpdate {
                resource,
                is_expire: true,
            })
            .dedup(format!("expire:{resource}:{epoch}"))
            .not_before(Some(epoch)),
            None => TaskSpec::new(TaskKind::ResourceUpdate {
                resource,
                is_expire: false,
            })
            .dedup(format!("update:{resource}")),
        };
        self.tasks.schedule(spec, self.now_ms())
    }

    /// Schedule an update task for a lease. With `expire_at`, the task is an
    /// expire task delayed until that epoch.
    ///
    /// # Errors
    ///
    /// Propagates task queue errors.
    pub fn schedule_lease_update(&self, lease: LeaseRef, expire_at: Option<u64>) -> Result<TaskId> {
        let spec = match expire_at {
            Some(epoch) => TaskSpec::new(TaskKind::LeaseUpdate {
                lease,
                is_expire: true,
            })
            .dedup(format!("expire:{lease}:{epoch}"))
            .not_before(Some(epoch)),
            None => TaskSpec::new(TaskKind::LeaseUpdate {
                lease,
                is_expire: false,
            })
            .dedup(format!("update:{lease}")),
        };
        self.tasks.schedule(spec, self.now_ms())
    }

    /// Resume suspended tasks.
    ///
    /// # Errors
    ///
    /// Propagates task queue errors.
    pub fn awaken(&self, ids: &[TaskId]) -> Result<usize> {
        self.tasks.awaken(ids, self.now_ms())
    }

    /// Register interest in the lease's status changes.
    #[must_use]
    pub fn waiter(&self, lease: LeaseRef) -> LeaseWaiter {
        let signal = Arc::clone(self.waiters.lock().entry(lease).or_default());
        LeaseWaiter {
            lease,
            signal,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Leases with at least one in-process waiter.
    #[must_use]
    pub fn waiting_leases(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Wake in-process waiters on a lease. Waiters re-read the store, so a
    /// spurious wake is harmless.
    pub fn notify_lease(&self, lease: LeaseRef, finished: bool) {
        let mut waiters = self.waiters.lock();
        let notify = if finished {
            waiters.remove(&lease)
        } else {
            waiters.get(&lease).cloned()
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}
