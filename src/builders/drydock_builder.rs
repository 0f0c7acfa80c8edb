//! Wire a [`Drydock`] and its [`WorkerHost`] from a [`DrydockConfig`].

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::config::{DrydockConfig, QueueBackendConfig, StoreBackendConfig};
use crate::core::audit::InMemoryAuditSink;
use crate::core::blueprint::{BlueprintRegistry, BlueprintStrategy};
use crate::core::context::{DrydockContext, SharedAuditSink};
use crate::core::engine::Drydock;
use crate::core::error::AppResult;
use crate::core::host_pool::HostPoolStrategy;
use crate::core::store::Store;
use crate::core::task::TaskScheduler;
use crate::core::worker::DrydockWorker;
use crate::infra::{FileTaskQueue, InMemoryStore, InMemoryTaskQueue, JsonFileStore};
use crate::runtime::{Spawn, WorkerHost};
use crate::util::Clock;

/// Collects strategies and overrides, then builds the engine.
pub struct DrydockBuilder {
    config: DrydockConfig,
    registry: BlueprintRegistry,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<SharedAuditSink>,
}

impl std::fmt::Debug for DrydockBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrydockBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl DrydockBuilder {
    /// Builder with the host pool strategy registered.
    #[must_use]
    pub fn new(config: DrydockConfig) -> Self {
        Self {
            config,
            registry: BlueprintRegistry::new().with_strategy(HostPoolStrategy),
            clock: None,
            audit: None,
        }
    }

    /// The configuration being built from.
    #[must_use]
    pub const fn config(&self) -> &DrydockConfig {
        &self.config
    }

    /// Register another strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl BlueprintStrategy + 'static) -> Self {
        self.registry = self.registry.with_strategy(strategy);
        self
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Send audit events to `sink` instead of the bounded in-memory log.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: SharedAuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Validate the configuration and open the backends.
    ///
    /// # Errors
    ///
    /// Invalid configuration or a backend that fails to open.
    pub fn build(self) -> AppResult<DrydockRuntime> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;

        let store: Arc<dyn Store> = match &config.store {
            StoreBackendConfig::InMemory => Arc::new(InMemoryStore::new()),
            StoreBackendConfig::File { path } => Arc::new(
                JsonFileStore::open(path)
                    .with_context(|| format!("opening store at {}", path.display()))?,
            ),
        };
        let tasks = match &config.queue {
            QueueBackendConfig::InMemory => TaskScheduler::new(InMemoryTaskQueue::new(config.max_queue_depth)),
            QueueBackendConfig::File { path } => TaskScheduler::new(
                FileTaskQueue::open(path, config.max_queue_depth)
                    .with_context(|| format!("opening task queue at {}", path.display()))?,
            ),
        };

        let mut ctx = DrydockContext::new(store, tasks);
        if let Some(clock) = self.clock {
            ctx = ctx.with_clock(clock);
        }
        let mut audit_log = None;
        match self.audit {
            Some(sink) => ctx = ctx.with_audit(sink),
            None if config.audit_capacity > 0 => {
                let log = Arc::new(Mutex::new(InMemoryAuditSink::new(config.audit_capacity)));
                ctx = ctx.with_audit(log.clone());
                audit_log = Some(log);
            }
            None => {}
        }

        let registry = Arc::new(self.registry);
        let drydock = Drydock::new(ctx.clone(), Arc::clone(&registry))
            .with_wait_poll_interval(config.wait_poll_interval());
        let worker = DrydockWorker::new(ctx, registry, config.worker_settings());
        let host = WorkerHost::new(worker, config.host_settings());

        tracing::info!(
            store = ?config.store,
            queue = ?config.queue,
            workers = config.worker_count,
            strategies = ?drydock.registry().type_tags(),
            "drydock built"
        );
        Ok(DrydockRuntime {
            drydock,
            host,
            audit_log,
            config,
        })
    }
}

/// A built engine and the host that runs its tasks.
#[derive(Debug, Clone)]
pub struct DrydockRuntime {
    /// Caller-facing facade.
    pub drydock: Drydock,
    /// Worker loops.
    pub host: WorkerHost,
    /// The in-memory audit log, unless a custom sink was supplied.
    pub audit_log: Option<Arc<Mutex<InMemoryAuditSink>>>,
    config: DrydockConfig,
}

impl DrydockRuntime {
    /// The configuration the runtime was built from.
    #[must_use]
    pub const fn config(&self) -> &DrydockConfig {
        &self.config
    }

    /// Start the configured number of worker loops.
    pub fn spawn_workers<S: Spawn>(&self, spawner: &S) {
        self.host.spawn(spawner, self.config.worker_count);
    }

    /// Stop every worker loop.
    pub fn shutdown(&self) {
        self.host.shutdown();
    }
}
