//! Lease lifecycle transitions.
//!
//! Entering ACQUIRED or ACTIVE always takes the requested slot locks in the
//! same transaction as the status write, including the direct
//! PENDING → ACTIVE path.

use serde_json::{json, Value};

use crate::core::audit::AuditKind;
use crate::core::command::CommandChannel;
use crate::core::context::DrydockContext;
use crate::core::error::{DrydockError, Result};
use crate::core::model::{Lease, LeaseStatus, ResourceStatus, BROKEN_REASON_ATTRIBUTE};
use crate::core::slot_lock::SlotLockManager;
use crate::core::store::StoreExt;
use crate::core::task::{TaskKind, TaskSpec};
use crate::util::{LeaseRef, ResourceRef, TaskId};

/// How a lease binds to a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseAcquisition {
    activate_when_acquired: bool,
    slot_locks: Vec<String>,
}

impl LeaseAcquisition {
    /// Acquire without activating and without locks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Go straight to active. The resource must already be serving.
    #[must_use]
    pub const fn activate_when_acquired(mut self) -> Self {
        self.activate_when_acquired = true;
        self
    }

    /// Require `key` to be locked in the acquiring transaction.
    #[must_use]
    pub fn need_slot_lock(mut self, key: impl Into<String>) -> Self {
        self.slot_locks.push(key.into());
        self
    }
}

impl DrydockContext {
    /// Persist a new pending lease and schedule its allocation.
    ///
    /// # Errors
    ///
    /// [`DrydockError::Precondition`] if the lease was already saved or is
    /// not pending; task queue errors.
    pub fn queue_for_activation(&self, lease: Lease) -> Result<Lease> {
        if lease.id.is_some() {
            return Err(DrydockError::Precondition(format!(
                "{} has already been queued",
                lease.reference
            )));
        }
        if lease.status != LeaseStatus::Pending {
            return Err(DrydockError::state_mismatch(lease.reference, LeaseStatus::Pending, lease.status));
        }
        let now = self.now_ms();
        let saved = self.store().transaction(|tables| tables.insert_lease(lease, now))?;
        let scheduled = self.tasks().schedule(
            TaskSpec::new(TaskKind::Allocate { lease: saved.reference }).dedup(format!("allocate:{}", saved.reference)),
            now,
        );
        if let Err(err) = scheduled {
            // Nothing would ever allocate it; take the row back out.
            tracing::warn!(lease = %saved.reference, error = %err, "allocation could not be scheduled; discarding lease");
            self.store().transaction(|tables| {
                tables.leases.remove(&saved.reference);
                Ok(())
            })?;
            return Err(err);
        }
        tracing::info!(lease = %saved.reference, resource_type = %saved.resource_type, "lease queued");
        self.audit(saved.reference, AuditKind::LeaseQueued, None);
        Ok(saved)
    }

    /// Bind a pending lease to a resource, taking its slot locks.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the lease is pending and the
    /// resource can take leases; [`DrydockError::Precondition`] on a type
    /// mismatch or when activating against a pending resource;
    /// [`DrydockError::SlotLockConflict`] on contention.
    pub fn acquire_on_resource(&self, lease: LeaseRef, resource: ResourceRef, acquisition: LeaseAcquisition) -> Result<Lease> {
        let LeaseAcquisition {
            activate_when_acquired,
            slot_locks,
        } = acquisition;
        let next = if activate_when_acquired {
            LeaseStatus::Active
        } else {
            LeaseStatus::Acquired
        };
        let now = self.now_ms();
        let saved = self.store().transaction(|tables| {
            let mut row = tables.lease(lease)?.clone();
            if row.status != LeaseStatus::Pending {
                return Err(DrydockError::state_mismatch(lease, LeaseStatus::Pending, row.status));
            }
            let target = tables.resource(resource)?;
            if target.type_tag != row.resource_type {
                return Err(DrydockError::Precondition(format!(
                    "{lease} requests type `{}` but {resource} is `{}`",
                    row.resource_type, target.type_tag
                )));
            }
            if activate_when_acquired && target.status == ResourceStatus::Pending {
                return Err(DrydockError::Precondition(format!(
                    "{lease} cannot activate on {resource} while it is still pending"
                )));
            }
            if !matches!(
                target.status,
                ResourceStatus::Pending | ResourceStatus::Open | ResourceStatus::Active
            ) {
                return Err(DrydockError::state_mismatch(resource, "pending|open|active", target.status));
            }
            SlotLockManager::acquire_in(tables, row.object_ref(), &slot_locks, now)?;
            row.status = next;
            row.resource = Some(resource);
            Ok(tables.update_lease(row, now))
        })?;

        tracing::info!(lease = %lease, resource = %resource, status = %saved.status, "lease acquired");
        self.audit(lease, AuditKind::LeaseAcquired, Some(json!({ "resource": resource.to_string() })));
        self.notify_lease(lease, false);
        if saved.status == LeaseStatus::Active {
            self.did_activate_lease(&saved)?;
        }
        Ok(saved)
    }

    /// Move an acquired lease to active.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the lease is acquired and its
    /// resource is serving; [`DrydockError::Precondition`] while the
    /// resource is still pending.
    pub fn activate_on_resource(&self, lease: LeaseRef) -> Result<Lease> {
        let now = self.now_ms();
        let saved = self.store().transaction(|tables| {
            let mut row = tables.lease(lease)?.clone();
            if row.status != LeaseStatus::Acquired {
                return Err(DrydockError::state_mismatch(lease, LeaseStatus::Acquired, row.status));
            }
            let resource = row
                .resource
                .ok_or_else(|| DrydockError::Precondition(format!("{lease} is not bound to a resource")))?;
            let status = tables.resource(resource)?.status;
            if status == ResourceStatus::Pending {
                return Err(DrydockError::Precondition(format!(
                    "{lease} cannot activate on {resource} while it is still pending"
                )));
            }
            if !status.accepts_leases() {
                return Err(DrydockError::state_mismatch(resource, "open|active", status));
            }
            row.status = LeaseStatus::Active;
            Ok(tables.update_lease(row, now))
        })?;
        self.did_activate_lease(&saved)?;
        Ok(saved)
    }

    /// Side effects of reaching active: schedule the expire task and any
    /// pending command processing, resume suspended tasks, wake waiters.
    ///
    /// # Errors
    ///
    /// Propagates task queue and store errors.
    pub fn did_activate_lease(&self, lease: &Lease) -> Result<()> {
        let has_commands = self
            .store()
            .snapshot(|tables| !CommandChannel::unconsumed_in(tables, lease.object_ref()).is_empty())?;
        if has_commands {
            self.schedule_lease_update(lease.reference, None)?;
        }
        if let Some(until) = lease.until {
            self.schedule_lease_update(lease.reference, Some(until))?;
        }
        let awakened = self.awaken(&lease.awaken_task_ids)?;
        tracing::info!(lease = %lease.reference, awakened, "lease activated");
        self.audit(lease.reference, AuditKind::LeaseActivated, None);
        self.notify_lease(lease.reference, false);
        Ok(())
    }

    /// Record task ids to resume when the lease activates.
    ///
    /// # Errors
    ///
    /// [`DrydockError::NotFound`] for an unknown lease.
    pub fn set_awaken_task_ids(&self, lease: LeaseRef, ids: Vec<TaskId>) -> Result<Lease> {
        let now = self.now_ms();
        let saved = self.store().transaction(|tables| {
            let mut row = tables.lease(lease)?.clone();
            row.awaken_task_ids = ids;
            Ok(tables.update_lease(row, now))
        })?;
        // Activation may already have happened; resume right away then.
        if saved.is_active() {
            self.awaken(&saved.awaken_task_ids)?;
        }
        Ok(saved)
    }

    /// Mark a live lease released.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the lease is pending, acquired,
    /// or active.
    pub fn release_lease_now(&self, lease: LeaseRef) -> Result<Lease> {
        let saved = self.transition_lease(
            lease,
            &[LeaseStatus::Pending, LeaseStatus::Acquired, LeaseStatus::Active],
            LeaseStatus::Released,
            |_| {},
        )?;
        tracing::info!(lease = %lease, "lease released");
        self.audit(lease, AuditKind::LeaseReleased, None);
        Ok(saved)
    }

    /// Mark a live lease broken, recording why.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the lease is pending, acquired,
    /// or active.
    pub fn break_lease(&self, lease: LeaseRef, reason: &str) -> Result<Lease> {
        let saved = self.transition_lease(
            lease,
            &[LeaseStatus::Pending, LeaseStatus::Acquired, LeaseStatus::Active],
            LeaseStatus::Broken,
            |row| {
                row.attributes
                    .insert(BROKEN_REASON_ATTRIBUTE.to_string(), Value::String(reason.to_string()));
            },
        )?;
        tracing::warn!(lease = %lease, reason, "lease broken");
        self.audit(lease, AuditKind::LeaseBroken, Some(json!({ "reason": reason })));
        Ok(saved)
    }

    /// Final transition. Drops every slot lock the lease holds.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the lease is released or broken.
    pub fn destroy_lease_row(&self, lease: LeaseRef) -> Result<Lease> {
        let saved = self.transition_lease(
            lease,
            &[LeaseStatus::Released, LeaseStatus::Broken],
            LeaseStatus::Destroyed,
            |_| {},
        )?;
        tracing::info!(lease = %lease, "lease destroyed");
        self.audit(lease, AuditKind::LeaseDestroyed, None);
        Ok(saved)
    }

    fn transition_lease(
        &self,
        lease: LeaseRef,
        from: &[LeaseStatus],
        next: LeaseStatus,
        edit: impl FnOnce(&mut Lease),
    ) -> Result<Lease> {
        let now = self.now_ms();
        let saved = self.store().transaction(|tables| {
            let mut row = tables.lease(lease)?.clone();
            if !from.contains(&row.status) || !row.status.can_transition_to(next) {
                return Err(DrydockError::state_mismatch(
                    lease,
                    from.iter().map(ToString::to_string).collect::<Vec<_>>().join("|"),
                    row.status,
                ));
            }
            row.status = next;
            edit(&mut row);
            Ok(tables.update_lease(row, now))
        })?;
        self.notify_lease(lease, next == LeaseStatus::Destroyed);
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::model::Blueprint;
    use crate::core::resource::ResourceTemplate;
    use crate::core::store::Store;
    use crate::core::task::TaskScheduler;
    use crate::infra::{InMemoryStore, InMemoryTaskQueue};
    use crate::util::ManualClock;

    fn context() -> (DrydockContext, Blueprint) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ctx = DrydockContext::new(store, TaskScheduler::new(InMemoryTaskQueue::new(64)))
            .with_clock(Arc::new(ManualClock::new(1_000)));
        let blueprint = ctx
            .store()
            .transaction(|t| t.insert_blueprint(Blueprint::new("pool", "host"), 0))
            .unwrap();
        (ctx, blueprint)
    }

    #[test]
    fn queueing_twice_is_rejected() {
        let (ctx, _) = context();
        let saved = ctx.queue_for_activation(Lease::new("host")).unwrap();
        assert_eq!(ctx.tasks().len(), 1);
        assert!(matches!(
            ctx.queue_for_activation(saved),
            Err(DrydockError::Precondition(_))
        ));
    }

    #[test]
    fn full_queue_leaves_no_orphaned_lease() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let ctx = DrydockContext::new(store, TaskScheduler::new(InMemoryTaskQueue::new(1)))
            .with_clock(Arc::new(ManualClock::new(1_000)));
        let first = ctx.queue_for_activation(Lease::new("host")).unwrap();

        let second = Lease::new("host");
        let reference = second.reference;
        assert!(matches!(
            ctx.queue_for_activation(second),
            Err(DrydockError::QueueFull(_))
        ));

        let rows: Vec<LeaseRef> = ctx.store().snapshot(|t| t.leases.keys().copied().collect()).unwrap();
        assert_eq!(rows, vec![first.reference]);
        assert!(!rows.contains(&reference));
        assert_eq!(ctx.tasks().len(), 1);
    }

    #[test]
    fn acquire_then_activate() {
        let (ctx, bp) = context();
        let resource = ctx.allocate_resource(ResourceTemplate::new(&bp, "r")).unwrap();
        let lease = ctx.queue_for_activation(Lease::new("host")).unwrap();

        let acquired = ctx
            .acquire_on_resource(lease.reference, resource.reference, LeaseAcquisition::new().need_slot_lock("l"))
            .unwrap();
        assert_eq!(acquired.status, LeaseStatus::Acquired);
        assert_eq!(acquired.resource, Some(resource.reference));

        // Still pending capacity.
        assert!(matches!(
            ctx.activate_on_resource(lease.reference),
            Err(DrydockError::Precondition(_))
        ));
        ctx.activate_resource(resource.reference).unwrap();
        let active = ctx.activate_on_resource(lease.reference).unwrap();
        assert_eq!(active.status, LeaseStatus::Active);

        // A second acquisition is a state mismatch.
        assert!(matches!(
            ctx.acquire_on_resource(lease.reference, resource.reference, LeaseAcquisition::new()),
            Err(DrydockError::StateMismatch { .. })
        ));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let (ctx, bp) = context();
        let resource = ctx
            .allocate_resource(ResourceTemplate::new(&bp, "r").activate_when_allocated())
            .unwrap();
        let lease = ctx.queue_for_activation(Lease::new("database")).unwrap();
        assert!(matches!(
            ctx.acquire_on_resource(lease.reference, resource.reference, LeaseAcquisition::new()),
            Err(DrydockError::Precondition(_))
        ));
    }

    #[test]
    fn broken_lease_records_reason_and_can_be_destroyed() {
        let (ctx, _) = context();
        let lease = ctx.queue_for_activation(Lease::new("host")).unwrap();
        let broken = ctx.break_lease(lease.reference, "no capacity").unwrap();
        assert_eq!(broken.attribute(BROKEN_REASON_ATTRIBUTE), Some(&Value::from("no capacity")));
        assert!(matches!(
            ctx.release_lease_now(lease.reference),
            Err(DrydockError::StateMismatch { .. })
        ));
        assert_eq!(ctx.destroy_lease_row(lease.reference).unwrap().status, LeaseStatus::Destroyed);
    }
}
