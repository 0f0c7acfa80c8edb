//! Resource lifecycle transitions.
//!
//! Every transition re-reads the stored row inside the transaction and
//! checks the edge against [`ResourceStatus::can_transition_to`], so two
//! racing writers produce exactly one winner and one state mismatch.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use crate::core::audit::AuditKind;
use crate::core::command::CommandChannel;
use crate::core::context::DrydockContext;
use crate::core::error::{DrydockError, Result};
use crate::core::model::{AttributeMap, Blueprint, Resource, ResourceStatus, BROKEN_REASON_ATTRIBUTE};
use crate::core::slot_lock::SlotLockManager;
use crate::core::store::StoreExt;
use crate::util::{BlueprintRef, ResourceRef, TaskId};

/// An unsaved resource plus the side conditions of its first write.
#[derive(Debug, Clone)]
pub struct ResourceTemplate {
    resource: Resource,
    activate_when_allocated: bool,
    slot_locks: Vec<String>,
}

impl ResourceTemplate {
    /// Start a resource owned by `blueprint`. The reference is generated now
    /// so slot locks can name it before the row exists.
    pub fn new(blueprint: &Blueprint, name: impl Into<String>) -> Self {
        Self {
            resource: Resource {
                reference: ResourceRef::generate(),
                id: None,
                blueprint: blueprint.reference,
                type_tag: blueprint.type_tag().to_string(),
                name: name.into(),
                status: ResourceStatus::Pending,
                attributes: AttributeMap::new(),
                capabilities: BTreeSet::new(),
                until: None,
                owner: None,
                awaken_task_ids: Vec::new(),
                version: 0,
                created_at_ms: 0,
                updated_at_ms: 0,
            },
            activate_when_allocated: false,
            slot_locks: Vec::new(),
        }
    }

    /// The reference the resource will be saved under.
    #[must_use]
    pub const fn reference(&self) -> ResourceRef {
        self.resource.reference
    }

    /// Go straight to active on allocation.
    #[must_use]
    pub const fn activate_when_allocated(mut self) -> Self {
        self.activate_when_allocated = true;
        self
    }

    /// Require `key` to be locked in the allocating transaction.
    #[must_use]
    pub fn need_slot_lock(mut self, key: impl Into<String>) -> Self {
        self.slot_locks.push(key.into());
        self
    }

    /// Set an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.resource.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.resource.capabilities.insert(capability.into());
        self
    }

    /// Expire at `epoch_ms`.
    #[must_use]
    pub const fn until(mut self, epoch_ms: u64) -> Self {
        self.resource.until = Some(epoch_ms);
        self
    }

    /// Record an owner.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.resource.owner = Some(owner.into());
        self
    }

    /// The slot locks the allocation will take.
    #[must_use]
    pub fn slot_locks(&self) -> &[String] {
        &self.slot_locks
    }
}

impl DrydockContext {
    /// Persist a new resource and take its slot locks in one transaction.
    ///
    /// If a lock is held elsewhere nothing is written, a slot-lock failure is
    /// logged against the blueprint, and the conflict is returned so the
    /// caller can move on to another candidate.
    ///
    /// # Errors
    ///
    /// [`DrydockError::SlotLockConflict`] on contention,
    /// [`DrydockError::NotFound`] if the blueprint is gone, or a backend
    /// error.
    pub fn allocate_resource(&self, template: ResourceTemplate) -> Result<Resource> {
        let ResourceTemplate {
            mut resource,
            activate_when_allocated,
            slot_locks,
        } = template;
        if resource.id.is_some() {
            return Err(DrydockError::Precondition(format!(
                "{} has already been allocated",
                resource.reference
            )));
        }
        resource.status = if activate_when_allocated {
            ResourceStatus::Active
        } else {
            ResourceStatus::Pending
        };

        let now = self.now_ms();
        let blueprint = resource.blueprint;
        let holder = resource.object_ref();
        let outcome = self.store().transaction(|tables| {
            tables.blueprint(blueprint)?;
            SlotLockManager::acquire_in(tables, holder, &slot_locks, now)?;
            tables.insert_resource(resource, now)
        });

        let saved = match outcome {
            Ok(saved) => saved,
            Err(err @ DrydockError::SlotLockConflict { .. }) => {
                self.log_slot_lock_failure(blueprint, &slot_locks);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            resource = %saved.reference,
            blueprint = %saved.blueprint,
            status = %saved.status,
            locks = slot_locks.len(),
            "resource allocated"
        );
        self.audit(saved.reference, AuditKind::ResourceAllocated, Some(json!({ "slot_locks": slot_locks })));
        if saved.status == ResourceStatus::Active {
            self.did_activate_resource(&saved)?;
        }
        Ok(saved)
    }

    fn log_slot_lock_failure(&self, blueprint: BlueprintRef, keys: &[String]) {
        let holders = self
            .store()
            .snapshot(|tables| SlotLockManager::holders_in(tables, keys))
            .unwrap_or_default();
        let locks: serde_json::Map<String, Value> = holders
            .into_iter()
            .map(|(key, holder)| (key, Value::String(holder.to_string())))
            .collect();
        tracing::warn!(blueprint = %blueprint, locks = ?locks, "slot lock failure during allocation");
        self.audit(blueprint, AuditKind::SlotLockFailure, Some(json!({ "locks": locks })));
    }

    /// Move a pending resource to active.
    ///
    /// # Errors
    ///
    /// [`DrydockError::NotFound`] if the resource was never allocated,
    /// [`DrydockError::StateMismatch`] unless it is pending.
    pub fn activate_resource(&self, resource: ResourceRef) -> Result<Resource> {
        let saved = self.transition_resource(resource, &[ResourceStatus::Pending], ResourceStatus::Active, |_| {})?;
        self.did_activate_resource(&saved)?;
        Ok(saved)
    }

    /// Side effects of reaching active: schedule the expire task and any
    /// pending command processing, then resume waiting tasks.
    ///
    /// # Errors
    ///
    /// Propagates task queue and store errors.
    pub fn did_activate_resource(&self, resource: &Resource) -> Result<()> {
        let has_commands = self
            .store()
            .snapshot(|tables| !CommandChannel::unconsumed_in(tables, resource.object_ref()).is_empty())?;
        if has_commands {
            self.schedule_resource_update(resource.reference, None)?;
        }
        if let Some(until) = resource.until {
            self.schedule_resource_update(resource.reference, Some(until))?;
        }
        self.awaken(&resource.awaken_task_ids)?;
        tracing::info!(resource = %resource.reference, "resource activated");
        self.audit(resource.reference, AuditKind::ResourceActivated, None);
        Ok(())
    }

    /// Move a pending resource to open: ready for leases but not yet serving.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the resource is pending.
    pub fn open_resource(&self, resource: ResourceRef) -> Result<Resource> {
        self.transition_resource(resource, &[ResourceStatus::Pending], ResourceStatus::Open, |_| {})
    }

    /// Stop accepting new leases. Existing leases are untouched.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the resource is open or active.
    pub fn close_resource(&self, resource: ResourceRef) -> Result<Resource> {
        let saved = self.transition_resource(
            resource,
            &[ResourceStatus::Open, ResourceStatus::Active],
            ResourceStatus::Closed,
            |_| {},
        )?;
        self.audit(resource, AuditKind::ResourceClosed, None);
        Ok(saved)
    }

    /// Mark a resource released. Its leases are released by the next update.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] if the resource is already released,
    /// broken, or destroyed.
    pub fn release_resource_now(&self, resource: ResourceRef) -> Result<Resource> {
        let saved = self.transition_resource(
            resource,
            &[
                ResourceStatus::Pending,
                ResourceStatus::Open,
                ResourceStatus::Active,
                ResourceStatus::Closed,
            ],
            ResourceStatus::Released,
            |_| {},
        )?;
        tracing::info!(resource = %resource, "resource released");
        self.audit(resource, AuditKind::ResourceReleased, None);
        Ok(saved)
    }

    /// Record an unrecoverable strategy failure.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] if the resource is no longer live.
    pub fn break_resource(&self, resource: ResourceRef, reason: &str) -> Result<Resource> {
        let saved = self.transition_resource(
            resource,
            &[
                ResourceStatus::Pending,
                ResourceStatus::Open,
                ResourceStatus::Active,
                ResourceStatus::Closed,
            ],
            ResourceStatus::Broken,
            |row| {
                row.attributes
                    .insert(BROKEN_REASON_ATTRIBUTE.to_string(), Value::String(reason.to_string()));
            },
        )?;
        tracing::warn!(resource = %resource, reason, "resource broken");
        self.audit(resource, AuditKind::ResourceBroken, Some(json!({ "reason": reason })));
        Ok(saved)
    }

    /// Final transition. Drops every slot lock the resource holds.
    ///
    /// # Errors
    ///
    /// [`DrydockError::StateMismatch`] unless the resource is released or
    /// broken.
    pub fn destroy_resource_row(&self, resource: ResourceRef) -> Result<Resource> {
        let saved = self.transition_resource(
            resource,
            &[ResourceStatus::Released, ResourceStatus::Broken],
            ResourceStatus::Destroyed,
            |_| {},
        )?;
        tracing::info!(resource = %resource, "resource destroyed");
        self.audit(resource, AuditKind::ResourceDestroyed, None);
        Ok(saved)
    }

    /// Record task ids to resume when the resource activates.
    ///
    /// # Errors
    ///
    /// [`DrydockError::NotFound`] for an unknown resource.
    pub fn set_resource_awaken_task_ids(&self, resource: ResourceRef, ids: Vec<TaskId>) -> Result<Resource> {
        let now = self.now_ms();
        self.store().transaction(|tables| {
            let mut row = tables.resource(resource)?.clone();
            row.awaken_task_ids = ids;
            Ok(tables.update_resource(row, now))
        })
    }

    /// Apply `from → next` against the stored row, with `edit` applied to
    /// the row in the same write.
    fn transition_resource(
        &self,
        resource: ResourceRef,
        from: &[ResourceStatus],
        next: ResourceStatus,
        edit: impl FnOnce(&mut Resource),
    ) -> Result<Resource> {
        let now = self.now_ms();
        self.store().transaction(|tables| {
            let mut row = tables.resource(resource)?.clone();
            if !from.contains(&row.status) || !row.status.can_transition_to(next) {
                return Err(DrydockError::state_mismatch(
                    resource,
                    from.iter().map(ToString::to_string).collect::<Vec<_>>().join("|"),
                    row.status,
                ));
            }
            row.status = next;
            edit(&mut row);
            Ok(tables.update_resource(row, now))
        })
    }
}
