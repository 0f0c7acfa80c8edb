//! Task handlers that drive resources and leases forward.
//!
//! Each handler is idempotent: redelivering a task after a crash re-reads
//! stored state and does only what is still missing. Handlers never sleep;
//! "not yet" is reported as [`TaskOutcome::Yield`] and the host reschedules.

use std::sync::Arc;
use std::time::Duration;

use crate::core::allocator::{AllocationOutcome, Allocator};
use crate::core::audit::AuditKind;
use crate::core::blueprint::BlueprintRegistry;
use crate::core::command::CommandChannel;
use crate::core::context::DrydockContext;
use crate::core::error::{DrydockError, Result};
use crate::core::model::{Command, CommandKind, Lease, LeaseStatus, Resource, ResourceStatus};
use crate::core::policy::Actor;
use crate::core::store::StoreExt;
use crate::core::task::TaskKind;
use crate::util::{remaining, LeaseRef, ObjectRef, ResourceRef};

/// What the host should do with a task after running it.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Done; remove the task.
    Ready,
    /// Not ready; run the task again after the delay.
    Yield(Duration),
    /// Failed; retry or drop depending on the error.
    Failed(DrydockError),
}

impl From<Result<()>> for TaskOutcome {
    fn from(value: Result<()>) -> Self {
        match value {
            Ok(()) => Self::Ready,
            Err(err) => Self::Failed(err),
        }
    }
}

/// Knobs for the task handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// How long a releasing resource waits for its leases between checks.
    pub release_recheck: Duration,
    /// Allocation passes before a lease is broken.
    pub allocation_rounds: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            release_recheck: Duration::from_secs(15),
            allocation_rounds: 3,
        }
    }
}

/// Runs allocate, update, and expire tasks.
#[derive(Debug, Clone)]
pub struct DrydockWorker {
    ctx: DrydockContext,
    registry: Arc<BlueprintRegistry>,
    allocator: Allocator,
    settings: WorkerSettings,
}

impl DrydockWorker {
    /// Worker over a context and strategy registry.
    #[must_use]
    pub fn new(ctx: DrydockContext, registry: Arc<BlueprintRegistry>, settings: WorkerSettings) -> Self {
        let allocator = Allocator::new(ctx.clone(), Arc::clone(&registry), settings.allocation_rounds);
        Self {
            ctx,
            registry,
            allocator,
            settings,
        }
    }

    /// The shared context.
    #[must_use]
    pub const fn context(&self) -> &DrydockContext {
        &self.ctx
    }

    /// Run one task.
    pub async fn handle(&self, task: TaskKind) -> TaskOutcome {
        match task {
            TaskKind::Allocate { lease } => match self.allocator.allocate_lease(lease).await {
                Ok(AllocationOutcome::Acquired(acquired)) => {
                    tracing::debug!(lease = %lease, status = %acquired.status, "allocate task finished");
                    TaskOutcome::Ready
                }
                Ok(AllocationOutcome::Skipped(_)) => TaskOutcome::Ready,
                Err(err) => TaskOutcome::Failed(err),
            },
            TaskKind::LeaseUpdate { lease, is_expire } => self.update_lease(lease, is_expire).await,
            TaskKind::ResourceUpdate { resource, is_expire } => self.update_resource(resource, is_expire).await,
        }
    }

    async fn update_lease(&self, reference: LeaseRef, is_expire: bool) -> TaskOutcome {
        let lease = match self.load_lease(reference) {
            Ok(lease) => lease,
            Err(err) => return TaskOutcome::Failed(err),
        };
        if lease.status == LeaseStatus::Destroyed {
            return TaskOutcome::Ready;
        }

        let now = self.ctx.now_ms();
        if let Some(until) = lease.until {
            if until > now {
                // Only an expire task waits out the deadline; updates carry on.
                if is_expire && lease.can_update() {
                    let delay = remaining(until, now);
                    tracing::debug!(lease = %reference, delay_ms = delay.as_millis(), "expire task ran early; yielding");
                    return TaskOutcome::Yield(delay);
                }
            } else if lease.can_release() {
                if let Err(err) = self.post_expiry_release(lease.object_ref()) {
                    return TaskOutcome::Failed(err);
                }
            }
        }

        if let Err(err) = self.apply_lease_commands(reference) {
            return TaskOutcome::Failed(err);
        }

        let lease = match self.load_lease(reference) {
            Ok(lease) => lease,
            Err(err) => return TaskOutcome::Failed(err),
        };
        if matches!(lease.status, LeaseStatus::Released | LeaseStatus::Broken) {
            return self.destroy_lease(&lease).await.into();
        }
        TaskOutcome::Ready
    }

    fn apply_lease_commands(&self, reference: LeaseRef) -> Result<()> {
        let target = ObjectRef::Lease(reference);
        for command in self.ctx.commands().fetch_unconsumed(target)? {
            let released = self.ctx.store().transaction(|tables| {
                match CommandChannel::consume_in(tables, command.reference) {
                    Ok(true) => {}
                    // Consumed already, or cleared when its target was destroyed.
                    Ok(false) | Err(DrydockError::NotFound(_)) => return Ok(false),
                    Err(err) => return Err(err),
                }
                if command.kind != CommandKind::Release {
                    return Ok(false);
                }
                let mut row = tables.lease(reference)?.clone();
                if !row.status.is_live() {
                    return Ok(false);
                }
                row.status = LeaseStatus::Released;
                tables.update_lease(row, self.ctx.now_ms());
                Ok(true)
            })?;
            self.after_command(target, &command, released);
            if released {
                self.ctx.notify_lease(reference, false);
                self.ctx.audit(reference, AuditKind::LeaseReleased, None);
            }
        }
        Ok(())
    }

    async fn destroy_lease(&self, lease: &Lease) -> Result<()> {
        if let Some(resource_ref) = lease.resource {
            let resource = self
                .ctx
                .store()
                .snapshot(|tables| tables.resource(resource_ref).cloned())??;
            let blueprint = self
                .ctx
                .store()
                .snapshot(|tables| tables.blueprint(resource.blueprint).cloned())??;
            let strategy = self.registry.strategy_for(&blueprint)?;
            strategy
                .destroy_lease(&self.ctx, &blueprint, &resource, lease)
                .await
                .map_err(as_transient)?;
            if lease.status == LeaseStatus::Released {
                strategy
                    .did_release_lease(&self.ctx, &blueprint, &resource, lease)
                    .await
                    .map_err(as_transient)?;
            }
        }
        match self.ctx.destroy_lease_row(lease.reference) {
            Ok(_) => Ok(()),
            // A redelivered task may find it already gone.
            Err(DrydockError::StateMismatch { .. }) if self.load_lease(lease.reference)?.status == LeaseStatus::Destroyed => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn update_resource(&self, reference: ResourceRef, is_expire: bool) -> TaskOutcome {
        let resource = match self.load_resource(reference) {
            Ok(resource) => resource,
            Err(err) => return TaskOutcome::Failed(err),
        };
        if resource.status == ResourceStatus::Destroyed {
            return TaskOutcome::Ready;
        }

        let now = self.ctx.now_ms();
        if let Some(until) = resource.until {
            if until > now {
                if is_expire && resource.can_update() {
                    let delay = remaining(until, now);
                    tracing::debug!(resource = %reference, delay_ms = delay.as_millis(), "expire task ran early; yielding");
                    return TaskOutcome::Yield(delay);
                }
            } else if resource.can_release() && resource.can_receive_commands() {
                if let Err(err) = self.post_expiry_release(resource.object_ref()) {
                    return TaskOutcome::Failed(err);
                }
            }
        }

        if let Err(err) = self.apply_resource_commands(reference) {
            return TaskOutcome::Failed(err);
        }

        let resource = match self.load_resource(reference) {
            Ok(resource) => resource,
            Err(err) => return TaskOutcome::Failed(err),
        };
        if !matches!(resource.status, ResourceStatus::Released | ResourceStatus::Broken) {
            return TaskOutcome::Ready;
        }

        match self.release_leases_on(&resource) {
            Ok(0) => {}
            Ok(live) => {
                tracing::debug!(resource = %reference, live, "waiting for leases to be destroyed");
                return TaskOutcome::Yield(self.settings.release_recheck);
            }
            Err(err) => return TaskOutcome::Failed(err),
        }
        self.destroy_resource(&resource).await.into()
    }

    fn apply_resource_commands(&self, reference: ResourceRef) -> Result<()> {
        let target = ObjectRef::Resource(reference);
        for command in self.ctx.commands().fetch_unconsumed(target)? {
            let released = self.ctx.store().transaction(|tables| {
                match CommandChannel::consume_in(tables, command.reference) {
                    Ok(true) => {}
                    // Consumed already, or cleared when its target was destroyed.
                    Ok(false) | Err(DrydockError::NotFound(_)) => return Ok(false),
                    Err(err) => return Err(err),
                }
                if command.kind != CommandKind::Release {
                    return Ok(false);
                }
                let mut row = tables.resource(reference)?.clone();
                if !row.can_receive_commands() {
                    return Ok(false);
                }
                row.status = ResourceStatus::Released;
                tables.update_resource(row, self.ctx.now_ms());
                Ok(true)
            })?;
            self.after_command(target, &command, released);
            if released {
                self.ctx.audit(reference, AuditKind::ResourceReleased, None);
            }
        }
        Ok(())
    }

    /// Ask every lease still bound to a releasing resource to go away.
    /// Returns how many are not yet destroyed.
    fn release_leases_on(&self, resource: &Resource) -> Result<usize> {
        let leases: Vec<Lease> = self.ctx.store().snapshot(|tables| {
            tables
                .leases_on(resource.reference)
                .filter(|lease| lease.status != LeaseStatus::Destroyed)
                .cloned()
                .collect()
        })?;
        for lease in &leases {
            let target = lease.object_ref();
            if lease.can_release() {
                self.ctx.request_release(target, &Actor::System)?;
            }
            self.ctx.schedule_lease_update(lease.reference, None)?;
        }
        Ok(leases.len())
    }

    async fn destroy_resource(&self, resource: &Resource) -> Result<()> {
        let blueprint = self
            .ctx
            .store()
            .snapshot(|tables| tables.blueprint(resource.blueprint).cloned())??;
        let strategy = self.registry.strategy_for(&blueprint)?;
        strategy
            .destroy_resource(&self.ctx, &blueprint, resource)
            .await
            .map_err(as_transient)?;
        match self.ctx.destroy_resource_row(resource.reference) {
            Ok(_) => Ok(()),
            Err(DrydockError::StateMismatch { .. })
                if self.load_resource(resource.reference)?.status == ResourceStatus::Destroyed =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Post a system RELEASE for an expired object unless one is pending.
    fn post_expiry_release(&self, target: ObjectRef) -> Result<()> {
        if self.ctx.request_release(target, &Actor::System)?.is_some() {
            tracing::info!(target_ref = %target, "expired; release posted");
        }
        Ok(())
    }

    fn after_command(&self, target: ObjectRef, command: &Command, applied: bool) {
        match (&command.kind, applied) {
            (CommandKind::Release, true) => {
                tracing::info!(target_ref = %target, author = %command.author, "release command applied");
            }
            (CommandKind::Release, false) => {
                tracing::debug!(target_ref = %target, "release command had nothing to do");
            }
            (CommandKind::Other(kind), _) => {
                tracing::debug!(target_ref = %target, kind = %kind, "ignoring unsupported command");
            }
        }
    }

    fn load_lease(&self, lease: LeaseRef) -> Result<Lease> {
        self.ctx.store().snapshot(|tables| tables.lease(lease).cloned())?
    }

    fn load_resource(&self, resource: ResourceRef) -> Result<Resource> {
        self.ctx
            .store()
            .snapshot(|tables| tables.resource(resource).cloned())?
    }
}

/// Teardown failures are always retried.
fn as_transient(err: DrydockError) -> DrydockError {
    if err.is_permanent() {
        DrydockError::Strategy(err.to_string())
    } else {
        err
    }
}
