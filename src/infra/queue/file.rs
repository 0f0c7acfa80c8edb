//! File-backed task queue using JSON lines for durability.
//!
//! The queue is held in memory and the whole file is rewritten after every
//! mutation, one task per line. Tasks leased at the time of a crash come back
//! as due on the next open, which is what at-least-once delivery asks for.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{DrydockError, Result};
use crate::core::task::{QueuedTask, TaskQueue, TaskSpec};
use crate::infra::queue::memory::InMemoryTaskQueue;
use crate::util::TaskId;

/// JSONL-persisted task queue.
#[derive(Debug)]
pub struct FileTaskQueue {
    path: PathBuf,
    inner: InMemoryTaskQueue,
}

impl FileTaskQueue {
    /// Open (or create) the queue file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the parent directory cannot be created or a line does not
    /// parse.
    pub fn open(path: impl AsRef<Path>, max_depth: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tasks = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let task: QueuedTask = serde_json::from_str(&line)?;
                tasks.push(task);
            }
        }
        let restored = tasks.len();
        tracing::debug!(path = %path.display(), restored, "opened file task queue");
        Ok(Self {
            path,
            inner: InMemoryTaskQueue::restore(max_depth, tasks),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite_disk(&self) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        for task in self.inner.tasks() {
            let line = serde_json::to_string(&task)?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            DrydockError::Backend(format!("failed to replace {}: {e}", self.path.display()))
        })
    }

    /// Apply `op` in memory and persist it. A failed write rolls the memory
    /// copy back so both sides keep agreeing.
    fn apply<T>(
        &mut self,
        op: impl FnOnce(&mut InMemoryTaskQueue) -> Result<T>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T> {
        let before = self.inner.clone();
        let out = op(&mut self.inner)?;
        if changed(&out) {
            if let Err(err) = self.rewrite_disk() {
                tracing::warn!(path = %self.path.display(), error = %err, "queue write failed; rolled back");
                self.inner = before;
                return Err(err);
            }
        }
        Ok(out)
    }
}

impl TaskQueue for FileTaskQueue {
    fn schedule(&mut self, spec: TaskSpec, now_ms: u64) -> Result<TaskId> {
        self.apply(|q| q.schedule(spec, now_ms), |_| true)
    }

    fn lease_due(&mut self, now_ms: u64, lease_ms: u64) -> Result<Option<QueuedTask>> {
        self.apply(|q| q.lease_due(now_ms, lease_ms), Option::is_some)
    }

    fn complete(&mut self, id: TaskId) -> Result<()> {
        self.apply(|q| q.complete(id), |_| true)
    }

    fn reschedule(&mut self, id: TaskId, not_before_ms: u64, failed: bool) -> Result<()> {
        self.apply(|q| q.reschedule(id, not_before_ms, failed), |_| true)
    }

    fn awaken(&mut self, ids: &[TaskId], now_ms: u64) -> Result<usize> {
        self.apply(|q| q.awaken(ids, now_ms), |found| *found > 0)
    }

    fn reclaim_expired(&mut self, now_ms: u64) -> Result<usize> {
        self.apply(|q| q.reclaim_expired(now_ms), |reclaimed| *reclaimed > 0)
    }

    fn next_due_ms(&self) -> Option<u64> {
        self.inner.next_due_ms()
    }

    fn get(&self, id: TaskId) -> Option<QueuedTask> {
        self.inner.get(id)
    }

    fn max_depth(&self) -> usize {
        self.inner.max_depth()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
