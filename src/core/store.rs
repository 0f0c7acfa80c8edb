//! Persistence contract.
//!
//! A [`Store`] runs closures against [`Tables`] with all-or-nothing
//! semantics: if the closure returns an error, nothing it wrote is visible
//! afterwards, slot locks included. Row-level helpers on [`Tables`] stamp
//! identifiers, versions and timestamps. Destroying a holder drops its slot
//! locks and its commands.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::error::{DrydockError, Result};
use crate::core::model::{Blueprint, Command, Lease, LeaseStatus, Resource, ResourceStatus, SlotLock};
use crate::util::{BlueprintRef, LeaseRef, ObjectRef, ResourceRef};

/// Every persisted row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    /// Blueprints by reference.
    pub blueprints: BTreeMap<BlueprintRef, Blueprint>,
    /// Resources by reference.
    pub resources: BTreeMap<ResourceRef, Resource>,
    /// Leases by reference.
    pub leases: BTreeMap<LeaseRef, Lease>,
    /// Slot locks by key. The map key is the uniqueness constraint.
    pub slot_locks: BTreeMap<String, SlotLock>,
    /// Commands by insertion sequence.
    pub commands: BTreeMap<u64, Command>,
    /// Last assigned row identifier.
    pub last_row_id: u64,
    /// Last assigned command sequence.
    pub last_command_sequence: u64,
}

impl Tables {
    fn next_row_id(&mut self) -> u64 {
        self.last_row_id += 1;
        self.last_row_id
    }

    /// Next command sequence number. Strictly increasing.
    pub fn next_command_sequence(&mut self) -> u64 {
        self.last_command_sequence += 1;
        self.last_command_sequence
    }

    /// Insert a blueprint that has never been saved.
    ///
    /// # Errors
    ///
    /// Fails if the reference is already taken.
    pub fn insert_blueprint(&mut self, mut blueprint: Blueprint, now_ms: u64) -> Result<Blueprint> {
        if self.blueprints.contains_key(&blueprint.reference) {
            return Err(DrydockError::Precondition(format!(
                "{} already exists",
                blueprint.reference
            )));
        }
        blueprint.id = Some(self.next_row_id());
        blueprint.created_at_ms = now_ms;
        self.blueprints.insert(blueprint.reference, blueprint.clone());
        Ok(blueprint)
    }

    /// Insert a resource that has never been saved.
    ///
    /// # Errors
    ///
    /// Fails if the reference is already taken.
    pub fn insert_resource(&mut self, mut resource: Resource, now_ms: u64) -> Result<Resource> {
        if self.resources.contains_key(&resource.reference) {
            return Err(DrydockError::Precondition(format!(
                "{} has already been persisted",
                resource.reference
            )));
        }
        resource.id = Some(self.next_row_id());
        resource.version = 1;
        resource.created_at_ms = now_ms;
        resource.updated_at_ms = now_ms;
        self.resources.insert(resource.reference, resource.clone());
        Ok(resource)
    }

    /// Overwrite a saved resource, bumping its version.
    ///
    /// Destroying a resource drops every slot lock it holds and every
    /// command aimed at it.
    pub fn update_resource(&mut self, mut resource: Resource, now_ms: u64) -> Resource {
        resource.version += 1;
        resource.updated_at_ms = now_ms;
        if resource.status == ResourceStatus::Destroyed {
            self.release_locks(resource.object_ref());
            self.drop_commands(resource.object_ref());
        }
        self.resources.insert(resource.reference, resource.clone());
        resource
    }

    /// Insert a lease that has never been saved.
    ///
    /// # Errors
    ///
    /// Fails if the reference is already taken.
    pub fn insert_lease(&mut self, mut lease: Lease, now_ms: u64) -> Result<Lease> {
        if self.leases.contains_key(&lease.reference) {
            return Err(DrydockError::Precondition(format!(
                "{} has already been persisted",
                lease.reference
            )));
        }
        lease.id = Some(self.next_row_id());
        lease.version = 1;
        lease.created_at_ms = now_ms;
        lease.updated_at_ms = now_ms;
        self.leases.insert(lease.reference, lease.clone());
        Ok(lease)
    }

    /// Overwrite a saved lease, bumping its version.
    ///
    /// Destroying a lease drops every slot lock it holds and every command
    /// aimed at it.
    pub fn update_lease(&mut self, mut lease: Lease, now_ms: u64) -> Lease {
        lease.version += 1;
        lease.updated_at_ms = now_ms;
        if lease.status == LeaseStatus::Destroyed {
            self.release_locks(lease.object_ref());
            self.drop_commands(lease.object_ref());
        }
        self.leases.insert(lease.reference, lease.clone());
        lease
    }

    /// Fetch a resource or fail with `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns [`DrydockError::NotFound`] if no such resource exists.
    pub fn resource(&self, reference: ResourceRef) -> Result<&Resource> {
        self.resources
            .get(&reference)
            .ok_or_else(|| DrydockError::NotFound(reference.to_string()))
    }

    /// Fetch a lease or fail with `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns [`DrydockError::NotFound`] if no such lease exists.
    pub fn lease(&self, reference: LeaseRef) -> Result<&Lease> {
        self.leases
            .get(&reference)
            .ok_or_else(|| DrydockError::NotFound(reference.to_string()))
    }

    /// Fetch a blueprint or fail with `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns [`DrydockError::NotFound`] if no such blueprint exists.
    pub fn blueprint(&self, reference: BlueprintRef) -> Result<&Blueprint> {
        self.blueprints
            .get(&reference)
            .ok_or_else(|| DrydockError::NotFound(reference.to_string()))
    }

    /// Leases bound to a resource.
    pub fn leases_on(&self, resource: ResourceRef) -> impl Iterator<Item = &Lease> {
        self.leases
            .values()
            .filter(move |lease| lease.resource == Some(resource))
    }

    /// Drop every lock held by `holder`, returning how many were dropped.
    pub fn release_locks(&mut self, holder: ObjectRef) -> usize {
        let before = self.slot_locks.len();
        self.slot_locks.retain(|_, lock| lock.holder != holder);
        before - self.slot_locks.len()
    }

    /// Drop every command targeting `target`, returning how many were dropped.
    pub fn drop_commands(&mut self, target: ObjectRef) -> usize {
        let before = self.commands.len();
        self.commands.retain(|_, command| command.target != target);
        before - self.commands.len()
    }
}

/// Transactional row storage shared by every worker.
///
/// Implementations must make `transact` atomic with respect to every other
/// `transact` and `read` call on the same store.
pub trait Store: Send + Sync {
    /// Apply `body` to the tables. Commit if it returns `Ok`, discard every
    /// change otherwise.
    ///
    /// # Errors
    ///
    /// Propagates the body's error, or a backend error if the commit fails.
    fn transact(&self, body: &mut dyn FnMut(&mut Tables) -> Result<()>) -> Result<()>;

    /// Run `body` against a consistent snapshot.
    fn read(&self, body: &mut dyn FnMut(&Tables));
}

/// Typed helpers over [`Store`].
pub trait StoreExt: Store {
    /// Run a transaction that produces a value.
    ///
    /// # Errors
    ///
    /// Propagates the body's error; nothing is committed in that case.
    fn transaction<T>(&self, body: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut body = Some(body);
        let mut output = None;
        self.transact(&mut |tables| {
            let run = body
                .take()
                .ok_or_else(|| DrydockError::Backend("transaction body ran twice".into()))?;
            output = Some(run(tables)?);
            Ok(())
        })?;
        output.ok_or_else(|| DrydockError::Backend("transaction produced no value".into()))
    }

    /// Read a value from a consistent snapshot.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store never invoked the body.
    fn snapshot<T>(&self, body: impl FnOnce(&Tables) -> T) -> Result<T> {
        let mut body = Some(body);
        let mut output = None;
        self.read(&mut |tables| {
            if let Some(run) = body.take() {
                output = Some(run(tables));
            }
        });
        output.ok_or_else(|| DrydockError::Backend("store read did not run".into()))
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::CommandChannel;
    use crate::core::model::{CommandKind, Lease};
    use crate::core::policy::Actor;

    #[test]
    fn destroying_a_lease_cascades_its_locks() {
        let mut tables = Tables::default();
        let lease = tables.insert_lease(Lease::new("host"), 10).unwrap();
        let other = ObjectRef::Lease(LeaseRef::generate());
        for (key, holder) in [("a", lease.object_ref()), ("b", lease.object_ref()), ("c", other)] {
            tables.slot_locks.insert(
                key.to_string(),
                SlotLock {
                    key: key.to_string(),
                    holder,
                    acquired_at_ms: 10,
                },
            );
        }

        let mut destroyed = lease;
        destroyed.status = LeaseStatus::Destroyed;
        let saved = tables.update_lease(destroyed, 20);

        assert_eq!(saved.version, 2);
        assert_eq!(saved.updated_at_ms, 20);
        assert_eq!(tables.slot_locks.keys().collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn destroying_a_lease_drops_its_commands() {
        let mut tables = Tables::default();
        let lease = tables.insert_lease(Lease::new("host"), 10).unwrap();
        let other = ObjectRef::Lease(LeaseRef::generate());
        CommandChannel::post_in(&mut tables, lease.object_ref(), Actor::System, CommandKind::Release, 11);
        CommandChannel::post_in(&mut tables, other, Actor::System, CommandKind::Release, 12);

        let mut released = lease;
        released.status = LeaseStatus::Released;
        let released = tables.update_lease(released, 13);
        assert_eq!(tables.commands.len(), 2);

        let mut destroyed = released;
        destroyed.status = LeaseStatus::Destroyed;
        tables.update_lease(destroyed, 14);
        let left: Vec<ObjectRef> = tables.commands.values().map(|c| c.target).collect();
        assert_eq!(left, vec![other]);
        // Sequences keep climbing after the prune.
        assert_eq!(tables.next_command_sequence(), 3);
    }

    #[test]
    fn double_insert_is_rejected() {
        let mut tables = Tables::default();
        let lease = Lease::new("host");
        tables.insert_lease(lease.clone(), 1).unwrap();
        assert!(matches!(
            tables.insert_lease(lease, 2),
            Err(DrydockError::Precondition(_))
        ));
    }

    #[test]
    fn row_ids_are_monotonic_across_tables() {
        let mut tables = Tables::default();
        let a = tables.insert_lease(Lease::new("host"), 1).unwrap();
        let b = tables
            .insert_blueprint(Blueprint::new("pool", "host"), 1)
            .unwrap();
        assert!(b.id > a.id);
    }
}
