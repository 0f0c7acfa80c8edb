//! Worker loops over the task queue.
//!
//! A [`WorkerHost`] leases due tasks, runs them through a [`DrydockWorker`],
//! and turns the outcome into queue bookkeeping: completed tasks are
//! removed, yields are rescheduled without counting an attempt, and failures
//! are retried with exponential backoff until they are permanent or out of
//! attempts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::task::{QueuedTask, TaskKind};
use crate::core::worker::{DrydockWorker, TaskOutcome};
use crate::runtime::Spawn;
use crate::util::TaskId;

/// Retry and polling knobs for worker loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHostSettings {
    /// How long a worker may hold a task before it is redelivered.
    pub lease_timeout: Duration,
    /// Failed deliveries before a task is dropped.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per failed attempt.
    pub retry_backoff: Duration,
    /// Longest retry delay.
    pub max_backoff: Duration,
    /// Longest an idle worker sleeps before checking the queue again.
    pub idle_poll: Duration,
}

impl Default for WorkerHostSettings {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(300),
            max_attempts: 10,
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            idle_poll: Duration::from_secs(1),
        }
    }
}

impl WorkerHostSettings {
    /// Retry delay after `attempts` failed deliveries.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.min(16)).unwrap_or(u32::MAX);
        self.retry_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// What happened to one leased task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskReport {
    /// Nothing was due.
    Idle,
    /// The task finished and was removed.
    Completed {
        /// Task id.
        id: TaskId,
        /// Task kind.
        task: TaskKind,
    },
    /// The task is not ready and will run again later.
    Yielded {
        /// Task id.
        id: TaskId,
        /// Task kind.
        task: TaskKind,
        /// Requested delay in milliseconds.
        delay_ms: u64,
    },
    /// The task failed and will be retried.
    Retrying {
        /// Task id.
        id: TaskId,
        /// Task kind.
        task: TaskKind,
        /// Failed deliveries including this one.
        attempts: u32,
        /// The failure.
        error: String,
    },
    /// The task failed for good and was removed.
    Dropped {
        /// Task id.
        id: TaskId,
        /// Task kind.
        task: TaskKind,
        /// The failure.
        error: String,
    },
}

/// Counters across every loop of a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    /// Tasks completed.
    pub completed: u64,
    /// Yields.
    pub yielded: u64,
    /// Failures that were retried.
    pub retried: u64,
    /// Tasks dropped after failing.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    yielded: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

/// Runs task handlers against the shared queue.
#[derive(Debug, Clone)]
pub struct WorkerHost {
    worker: DrydockWorker,
    settings: WorkerHostSettings,
    stopped: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl WorkerHost {
    /// Host `worker` with the given settings.
    #[must_use]
    pub fn new(worker: DrydockWorker, settings: WorkerHostSettings) -> Self {
        Self {
            worker,
            settings,
            stopped: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// The hosted worker.
    #[must_use]
    pub const fn worker(&self) -> &DrydockWorker {
        &self.worker
    }

    /// Current settings.
    #[must_use]
    pub const fn settings(&self) -> &WorkerHostSettings {
        &self.settings
    }

    /// Lease and run a single due task.
    ///
    /// # Errors
    ///
    /// Queue backend errors. Handler failures are reported, not returned.
    pub async fn run_one(&self) -> Result<TaskReport> {
        let ctx = self.worker.context();
        let Some(task) = ctx.tasks().lease_due(ctx.now_ms(), self.settings.lease_timeout)? else {
            return Ok(TaskReport::Idle);
        };
        tracing::debug!(task_id = task.id, task = task.kind.label(), attempts = task.attempts, "running task");
        let outcome = self.worker.handle(task.kind).await;
        self.settle(&task, outcome)
    }

    fn settle(&self, task: &QueuedTask, outcome: TaskOutcome) -> Result<TaskReport> {
        let ctx = self.worker.context();
        let (id, kind) = (task.id, task.kind);
        match outcome {
            TaskOutcome::Ready => {
                ctx.tasks().complete(id)?;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(TaskReport::Completed { id, task: kind })
            }
            TaskOutcome::Yield(delay) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                ctx.tasks()
                    .reschedule(id, ctx.now_ms().saturating_add(delay_ms), false)?;
                self.counters.yielded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task_id = id, task = kind.label(), delay_ms, "task yielded");
                Ok(TaskReport::Yielded {
                    id,
                    task: kind,
                    delay_ms,
                })
            }
            TaskOutcome::Failed(err) => {
                let attempts = task.attempts.saturating_add(1);
                if err.is_permanent() || attempts >= self.settings.max_attempts {
                    ctx.tasks().complete(id)?;
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task_id = id, task = kind.label(), attempts, error = %err, "task dropped");
                    return Ok(TaskReport::Dropped {
                        id,
                        task: kind,
                        error: err.to_string(),
                    });
                }
                let delay = self.settings.backoff(task.attempts);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                ctx.tasks()
                    .reschedule(id, ctx.now_ms().saturating_add(delay_ms), true)?;
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task_id = id, task = kind.label(), attempts, retry_in_ms = delay_ms, error = %err, "task failed; retrying");
                Ok(TaskReport::Retrying {
                    id,
                    task: kind,
                    attempts,
                    error: err.to_string(),
                })
            }
        }
    }

    /// Run tasks until nothing is due or `max_tasks` have run. Returns the
    /// reports of the tasks that ran.
    ///
    /// # Errors
    ///
    /// Queue backend errors.
    pub async fn run_until_idle(&self, max_tasks: usize) -> Result<Vec<TaskReport>> {
        let mut reports = Vec::new();
        while reports.len() < max_tasks {
            match self.run_one().await? {
                TaskReport::Idle => break,
                report => reports.push(report),
            }
        }
        Ok(reports)
    }

    /// Run until [`shutdown`](Self::shutdown), sleeping on the queue's wake
    /// signal while idle.
    pub async fn run_loop(&self, index: usize) {
        tracing::info!(worker = index, "worker loop started");
        let wake = self.worker.context().tasks().wake_signal();
        while !self.is_stopped() {
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.run_one().await {
                Ok(TaskReport::Idle) => {
                    if self.is_stopped() {
                        break;
                    }
                    let _ = tokio::time::timeout(self.idle_wait(), notified).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(worker = index, error = %err, "task queue error");
                    tokio::time::sleep(self.settings.idle_poll).await;
                }
            }
        }
        tracing::info!(worker = index, "worker loop stopped");
    }

    /// Sleep until the next task is due, capped by the idle poll.
    fn idle_wait(&self) -> Duration {
        let ctx = self.worker.context();
        ctx.tasks()
            .next_due_ms()
            .map_or(self.settings.idle_poll, |due| {
                crate::util::remaining(due, ctx.now_ms()).min(self.settings.idle_poll)
            })
    }

    /// Start `workers` loops on `spawner`.
    pub fn spawn<S: Spawn>(&self, spawner: &S, workers: usize) {
        for index in 0..workers.max(1) {
            let host = self.clone();
            spawner.spawn(async move { host.run_loop(index).await });
        }
    }

    /// Ask every loop to stop after its current task.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.worker.context().tasks().wake_signal().notify_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> HostStats {
        HostStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            yielded: self.counters.yielded.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}
