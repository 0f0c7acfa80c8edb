//! Engine configuration: backends, worker counts, and timing.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::worker::WorkerSettings;
use crate::runtime::WorkerHostSettings;

/// Row store backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// In-memory store for development and testing.
    #[default]
    InMemory,
    /// JSON snapshot file.
    File {
        /// Snapshot path.
        path: PathBuf,
    },
}

/// Task queue backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueBackendConfig {
    /// In-memory queue for development and testing.
    #[default]
    InMemory,
    /// JSONL task file.
    File {
        /// Task file path.
        path: PathBuf,
    },
}

/// Root engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrydockConfig {
    /// Row store backend.
    pub store: StoreBackendConfig,
    /// Task queue backend.
    pub queue: QueueBackendConfig,
    /// Maximum tasks held by the queue.
    pub max_queue_depth: usize,
    /// Worker loops to spawn.
    pub worker_count: usize,
    /// Milliseconds a worker may hold a task before redelivery.
    pub task_lease_timeout_ms: u64,
    /// Failed deliveries before a task is dropped.
    pub max_task_attempts: u32,
    /// First retry delay in milliseconds.
    pub retry_backoff_ms: u64,
    /// Longest retry delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Longest idle sleep of a worker loop in milliseconds.
    pub idle_poll_ms: u64,
    /// Fallback poll of activation waiters in milliseconds. At most 1000.
    pub wait_poll_interval_ms: u64,
    /// Milliseconds a releasing resource waits between lease checks.
    pub release_recheck_ms: u64,
    /// Allocation passes before a lease is broken.
    pub allocation_rounds: u32,
    /// Audit events kept in memory; 0 disables auditing.
    pub audit_capacity: usize,
}

impl Default for DrydockConfig {
    fn default() -> Self {
        Self {
            store: StoreBackendConfig::InMemory,
            queue: QueueBackendConfig::InMemory,
            max_queue_depth: 10_000,
            worker_count: num_cpus::get().max(1),
            task_lease_timeout_ms: 300_000,
            max_task_attempts: 10,
            retry_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            idle_poll_ms: 1_000,
            wait_poll_interval_ms: 1_000,
            release_recheck_ms: 15_000,
            allocation_rounds: 3,
            audit_capacity: 1_000,
        }
    }
}

impl DrydockConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.task_lease_timeout_ms == 0 {
            return Err("task_lease_timeout_ms must be greater than 0".into());
        }
        if self.max_task_attempts == 0 {
            return Err("max_task_attempts must be greater than 0".into());
        }
        if self.retry_backoff_ms == 0 {
            return Err("retry_backoff_ms must be greater than 0".into());
        }
        if self.release_recheck_ms == 0 {
            return Err("release_recheck_ms must be greater than 0".into());
        }
        if self.retry_backoff_ms > self.max_backoff_ms {
            return Err("retry_backoff_ms must not exceed max_backoff_ms".into());
        }
        if self.idle_poll_ms == 0 {
            return Err("idle_poll_ms must be greater than 0".into());
        }
        if self.wait_poll_interval_ms == 0 || self.wait_poll_interval_ms > 1_000 {
            return Err("wait_poll_interval_ms must be between 1 and 1000".into());
        }
        if self.allocation_rounds == 0 {
            return Err("allocation_rounds must be greater than 0".into());
        }
        for (name, path) in [
            ("store", self.store_path()),
            ("queue", self.queue_path()),
        ] {
            if path.is_some_and(|p| p.as_os_str().is_empty()) {
                return Err(format!("{name} file path must not be empty"));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failures.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `DRYDOCK_*` environment variables, after
    /// loading a `.env` file if one exists.
    ///
    /// `DRYDOCK_STORE_PATH` and `DRYDOCK_QUEUE_PATH` select the file
    /// backends; numeric fields use their upper-cased names, e.g.
    /// `DRYDOCK_WORKER_COUNT`.
    ///
    /// # Errors
    ///
    /// Unparsable values or validation failures.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) over an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Unparsable values or validation failures.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            target: &mut T,
        ) -> Result<(), String> {
            if let Some(raw) = lookup(key) {
                *target = raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("{key}: cannot parse `{raw}`"))?;
            }
            Ok(())
        }

        let mut cfg = Self::default();
        if let Some(path) = lookup("DRYDOCK_STORE_PATH") {
            cfg.store = StoreBackendConfig::File { path: path.into() };
        }
        if let Some(path) = lookup("DRYDOCK_QUEUE_PATH") {
            cfg.queue = QueueBackendConfig::File { path: path.into() };
        }
        parse(&lookup, "DRYDOCK_MAX_QUEUE_DEPTH", &mut cfg.max_queue_depth)?;
        parse(&lookup, "DRYDOCK_WORKER_COUNT", &mut cfg.worker_count)?;
        parse(&lookup, "DRYDOCK_TASK_LEASE_TIMEOUT_MS", &mut cfg.task_lease_timeout_ms)?;
        parse(&lookup, "DRYDOCK_MAX_TASK_ATTEMPTS", &mut cfg.max_task_attempts)?;
        parse(&lookup, "DRYDOCK_RETRY_BACKOFF_MS", &mut cfg.retry_backoff_ms)?;
        parse(&lookup, "DRYDOCK_MAX_BACKOFF_MS", &mut cfg.max_backoff_ms)?;
        parse(&lookup, "DRYDOCK_IDLE_POLL_MS", &mut cfg.idle_poll_ms)?;
        parse(&lookup, "DRYDOCK_WAIT_POLL_INTERVAL_MS", &mut cfg.wait_poll_interval_ms)?;
        parse(&lookup, "DRYDOCK_RELEASE_RECHECK_MS", &mut cfg.release_recheck_ms)?;
        parse(&lookup, "DRYDOCK_ALLOCATION_ROUNDS", &mut cfg.allocation_rounds)?;
        parse(&lookup, "DRYDOCK_AUDIT_CAPACITY", &mut cfg.audit_capacity)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn store_path(&self) -> Option<&PathBuf> {
        match &self.store {
            StoreBackendConfig::File { path } => Some(path),
            StoreBackendConfig::InMemory => None,
        }
    }

    fn queue_path(&self) -> Option<&PathBuf> {
        match &self.queue {
            QueueBackendConfig::File { path } => Some(path),
            QueueBackendConfig::InMemory => None,
        }
    }

    /// Task handler settings.
    #[must_use]
    pub const fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            release_recheck: Duration::from_millis(self.release_recheck_ms),
            allocation_rounds: self.allocation_rounds,
        }
    }

    /// Worker loop settings.
    #[must_use]
    pub const fn host_settings(&self) -> WorkerHostSettings {
        WorkerHostSettings {
            lease_timeout: Duration::from_millis(self.task_lease_timeout_ms),
            max_attempts: self.max_task_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
        }
    }

    /// Fallback poll of activation waiters.
    #[must_use]
    pub const fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}
