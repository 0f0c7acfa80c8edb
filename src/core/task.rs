//! Durable delayed task queue contract.
//!
//! Tasks are delivered at least once: a worker leases a due task, and unless
//! it completes or reschedules it before the lease runs out, the task becomes
//! due again. Handlers must therefore be idempotent.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::core::error::Result;
use crate::util::{LeaseRef, ResourceRef, TaskId};

/// Work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Bind a pending lease to a resource.
    Allocate {
        /// The lease to allocate.
        lease: LeaseRef,
    },
    /// Process commands and expiration for a lease.
    LeaseUpdate {
        /// The lease to update.
        lease: LeaseRef,
        /// Scheduled for the lease's expiration epoch.
        is_expire: bool,
    },
    /// Process commands and expiration for a resource.
    ResourceUpdate {
        /// The resource to update.
        resource: ResourceRef,
        /// Scheduled for the resource's expiration epoch.
        is_expire: bool,
    },
}

impl TaskKind {
    /// Stable label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "allocate",
            Self::LeaseUpdate { is_expire: false, .. } => "lease-update",
            Self::LeaseUpdate { is_expire: true, .. } => "lease-expire",
            Self::ResourceUpdate { is_expire: false, .. } => "resource-update",
            Self::ResourceUpdate { is_expire: true, .. } => "resource-expire",
        }
    }
}

/// A request to schedule a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// What to run.
    pub kind: TaskKind,
    /// Tasks sharing a key collapse into one while queued.
    pub dedup_key: Option<String>,
    /// Earliest epoch millisecond the task may run.
    pub not_before_ms: Option<u64>,
}

impl TaskSpec {
    /// A task due immediately with no dedup key.
    #[must_use]
    pub const fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            dedup_key: None,
            not_before_ms: None,
        }
    }

    /// Set the dedup key.
    #[must_use]
    pub fn dedup(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Delay the task until `epoch_ms`.
    #[must_use]
    pub const fn not_before(mut self, epoch_ms: Option<u64>) -> Self {
        self.not_before_ms = epoch_ms;
        self
    }
}

/// A task as tracked by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Queue-assigned identifier.
    pub id: TaskId,
    /// What to run.
    pub kind: TaskKind,
    /// Dedup key, if any.
    pub dedup_key: Option<String>,
    /// Earliest epoch millisecond the task may run.
    pub not_before_ms: u64,
    /// Failed deliveries so far. Yields do not count.
    pub attempts: u32,
    /// When the task was first scheduled.
    pub created_at_ms: u64,
    /// Set while a worker holds the task.
    pub leased_until_ms: Option<u64>,
}

/// Abstraction for task queue backends.
pub trait TaskQueue: Send {
    /// Add a task, or merge it into a queued task with the same dedup key
    /// (keeping the earlier due time). Returns the id of the task that will run.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` at capacity, or a backend error.
    fn schedule(&mut self, spec: TaskSpec, now_ms: u64) -> Result<TaskId>;

    /// Lease the earliest due task to a worker until `now_ms + lease_ms`.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the lease cannot be recorded.
    fn lease_due(&mut self, now_ms: u64, lease_ms: u64) -> Result<Option<QueuedTask>>;

    /// Remove a leased task for good.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the removal cannot be recorded.
    fn complete(&mut self, id: TaskId) -> Result<()>;

    /// Return a leased task to the queue, due at `not_before_ms`.
    /// `failed` counts the delivery as a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the change cannot be recorded.
    fn reschedule(&mut self, id: TaskId, not_before_ms: u64, failed: bool) -> Result<()>;

    /// Make queued tasks due immediately. Returns how many were found.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the change cannot be recorded.
    fn awaken(&mut self, ids: &[TaskId], now_ms: u64) -> Result<usize>;

    /// Return tasks whose worker lease ran out to the queue.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the change cannot be recorded.
    fn reclaim_expired(&mut self, now_ms: u64) -> Result<usize>;

    /// Earliest due time among queued (not leased) tasks.
    fn next_due_ms(&self) -> Option<u64>;

    /// Look up a task.
    fn get(&self, id: TaskId) -> Option<QueuedTask>;

    /// Maximum number of tasks held.
    fn max_depth(&self) -> usize;

    /// Queued plus leased tasks.
    fn len(&self) -> usize;

    /// No tasks at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle to a task queue plus a wake signal for idle workers.
#[derive(Clone)]
pub struct TaskScheduler {
    queue: Arc<Mutex<Box<dyn TaskQueue>>>,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Wrap a queue backend.
    pub fn new(queue: impl TaskQueue + 'static) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Box::new(queue))),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Schedule a task and wake idle workers.
    ///
    /// # Errors
    ///
    /// Propagates queue backend errors.
    pub fn schedule(&self, spec: TaskSpec, now_ms: u64) -> Result<TaskId> {
        let kind = spec.kind;
        let not_before = spec.not_before_ms;
        let id = self.queue.lock().schedule(spec, now_ms)?;
        tracing::debug!(task_id = id, task = kind.label(), not_before_ms = ?not_before, "task scheduled");
        self.wake.notify_waiters();
        Ok(id)
    }

    /// Resume suspended tasks now.
    ///
    /// # Errors
    ///
    /// Propagates queue backend errors.
    pub fn awaken(&self, ids: &[TaskId], now_ms: u64) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let found = self.queue.lock().awaken(ids, now_ms)?;
        tracing::debug!(requested = ids.len(), found, "awakened tasks");
        if found > 0 {
            self.wake.notify_waiters();
        }
        Ok(found)
    }

    /// Lease the next due task, first reclaiming abandoned leases.
    ///
    /// # Errors
    ///
    /// Propagates queue backend errors.
    pub fn lease_due(&self, now_ms: u64, lease_for: Duration) -> Result<Option<QueuedTask>> {
        let lease_ms = u64::try_from(lease_for.as_millis()).unwrap_or(u64::MAX);
        let mut queue = self.queue.lock();
        let reclaimed = queue.reclaim_expired(now_ms)?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "reclaimed tasks from expired worker leases");
        }
        queue.lease_due(now_ms, lease_ms)
    }

    /// Finish a leased task.
    ///
    /// # Errors
    ///
    /// Propagates queue backend errors.
    pub fn complete(&self, id: TaskId) -> Result<()> {
        self.queue.lock().complete(id)
    }

    /// Put a leased task back for later.
    ///
    /// # Errors
    ///
    /// Propagates queue backend errors.
    pub fn reschedule(&self, id: TaskId, not_before_ms: u64, failed: bool) -> Result<()> {
        self.queue.lock().reschedule(id, not_before_ms, failed)?;
        self.wake.notify_waiters();
        Ok(())
    }

    /// Earliest due time among queued tasks.
    #[must_use]
    pub fn next_due_ms(&self) -> Option<u64> {
        self.queue.lock().next_due_ms()
    }

    /// Look up a task.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<QueuedTask> {
        self.queue.lock().get(id)
    }

    /// Queued plus leased tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// No tasks at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal fired whenever new work may be due.
    #[must_use]
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }
}
