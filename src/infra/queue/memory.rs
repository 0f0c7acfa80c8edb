//! In-memory delayed queue ordered by due time.
//!
//! Queued tasks live in a `BTreeSet` keyed by `(not_before_ms, id)`, which
//! gives O(log n) scheduling and leasing with FIFO order among tasks due at
//! the same instant. Leased tasks leave the set until they are completed,
//! rescheduled, or reclaimed.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::error::{DrydockError, Result};
use crate::core::task::{QueuedTask, TaskQueue, TaskSpec};
use crate::util::TaskId;

/// In-memory queue with dedup keys and worker leases.
#[derive(Debug, Clone)]
pub struct InMemoryTaskQueue {
    max_depth: usize,
    next_id: TaskId,
    tasks: HashMap<TaskId, QueuedTask>,
    /// Queued (not leased) tasks by due time.
    ready: BTreeSet<(u64, TaskId)>,
    /// Dedup key to the queued task carrying it.
    dedup: HashMap<String, TaskId>,
    /// Leased tasks awakened while in flight; they run again immediately.
    woken_in_flight: HashSet<TaskId>,
}

impl InMemoryTaskQueue {
    /// Create an empty queue holding at most `max_depth` tasks.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            next_id: 1,
            tasks: HashMap::new(),
            ready: BTreeSet::new(),
            dedup: HashMap::new(),
            woken_in_flight: HashSet::new(),
        }
    }

    /// Rebuild a queue from persisted tasks. Leased tasks return to the
    /// queue, since whoever held them is gone.
    #[must_use]
    pub fn restore(max_depth: usize, tasks: impl IntoIterator<Item = QueuedTask>) -> Self {
        let mut queue = Self::new(max_depth);
        for mut task in tasks {
            task.leased_until_ms = None;
            queue.next_id = queue.next_id.max(task.id + 1);
            queue.tasks.insert(task.id, task.clone());
            queue.enqueue_ready(task.id);
        }
        queue
    }

    /// Every task, ordered by id.
    #[must_use]
    pub fn tasks(&self) -> Vec<QueuedTask> {
        let mut tasks: Vec<_> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Put a task into the ready set, folding it into a queued task with the
    /// same dedup key if one exists. Returns the id that remains queued.
    fn enqueue_ready(&mut self, id: TaskId) -> TaskId {
        let Some(task) = self.tasks.get(&id) else {
            return id;
        };
        let (not_before, key) = (task.not_before_ms, task.dedup_key.clone());
        if let Some(key) = key {
            if let Some(&existing) = self.dedup.get(&key) {
                if existing != id {
                    self.tasks.remove(&id);
                    self.pull_forward(existing, not_before);
                    return existing;
                }
            }
            self.dedup.insert(key, id);
        }
        self.ready.insert((not_before, id));
        id
    }

    /// Move a queued task's due time earlier, never later.
    fn pull_forward(&mut self, id: TaskId, not_before_ms: u64) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if not_before_ms < task.not_before_ms && task.leased_until_ms.is_none() {
            self.ready.remove(&(task.not_before_ms, id));
            task.not_before_ms = not_before_ms;
            self.ready.insert((not_before_ms, id));
        }
    }

    fn leased_task(&mut self, id: TaskId) -> Result<&mut QueuedTask> {
        match self.tasks.get_mut(&id) {
            Some(task) if task.leased_until_ms.is_some() => Ok(task),
            Some(_) => Err(DrydockError::Precondition(format!("task {id} is not leased"))),
            None => Err(DrydockError::NotFound(format!("task {id}"))),
        }
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn schedule(&mut self, spec: TaskSpec, now_ms: u64) -> Result<TaskId> {
        let not_before = spec.not_before_ms.unwrap_or(now_ms);
        if let Some(existing) = spec.dedup_key.as_ref().and_then(|k| self.dedup.get(k)).copied() {
            self.pull_forward(existing, not_before);
            return Ok(existing);
        }
        if self.len() >= self.max_depth() {
            return Err(DrydockError::QueueFull("max queue depth reached".into()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(
            id,
            QueuedTask {
                id,
                kind: spec.kind,
                dedup_key: spec.dedup_key,
                not_before_ms: not_before,
                attempts: 0,
                created_at_ms: now_ms,
                leased_until_ms: None,
            },
        );
        Ok(self.enqueue_ready(id))
    }

    fn lease_due(&mut self, now_ms: u64, lease_ms: u64) -> Result<Option<QueuedTask>> {
        let Some(&(not_before, id)) = self.ready.first() else {
            return Ok(None);
        };
        if not_before > now_ms {
            return Ok(None);
        }
        self.ready.remove(&(not_before, id));
        let Some(task) = self.tasks.get_mut(&id) else {
            return Ok(None);
        };
        // Once in flight, new work for the same key gets a fresh task.
        if let Some(key) = &task.dedup_key {
            if self.dedup.get(key) == Some(&id) {
                self.dedup.remove(key);
            }
        }
        task.leased_until_ms = Some(now_ms.saturating_add(lease_ms));
        Ok(Some(task.clone()))
    }

    fn complete(&mut self, id: TaskId) -> Result<()> {
        self.leased_task(id)?;
        self.tasks.remove(&id);
        self.woken_in_flight.remove(&id);
        Ok(())
    }

    fn reschedule(&mut self, id: TaskId, not_before_ms: u64, failed: bool) -> Result<()> {
        let woken = self.woken_in_flight.remove(&id);
        let task = self.leased_task(id)?;
        task.leased_until_ms = None;
        task.not_before_ms = if woken && !failed { 0 } else { not_before_ms };
        if failed {
            task.attempts += 1;
        }
        self.enqueue_ready(id);
        Ok(())
    }

    fn awaken(&mut self, ids: &[TaskId], now_ms: u64) -> Result<usize> {
        let mut found = 0;
        for &id in ids {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            found += 1;
            if task.leased_until_ms.is_some() {
                self.woken_in_flight.insert(id);
            } else {
                self.pull_forward(id, now_ms);
            }
        }
        Ok(found)
    }

    fn reclaim_expired(&mut self, now_ms: u64) -> Result<usize> {
        let expired: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.leased_until_ms.is_some_and(|until| until <= now_ms))
            .map(|t| t.id)
            .collect();
        for &id in &expired {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.leased_until_ms = None;
            }
            self.woken_in_flight.remove(&id);
            self.enqueue_ready(id);
        }
        Ok(expired.len())
    }

    fn next_due_ms(&self) -> Option<u64> {
        self.ready.first().map(|&(due, _)| due)
    }

    fn get(&self, id: TaskId) -> Option<QueuedTask> {
        self.tasks.get(&id).cloned()
    }

    fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }
}
