//! Slot lock manager.
//!
//! A slot lock is an exclusive claim on a string key, recorded in the store.
//! Uniqueness comes from the lock table's key inside a store transaction, so
//! two holders racing for one key can never both commit, whatever process
//! they run in. Locks are released when their holder is destroyed.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::error::{DrydockError, Result};
use crate::core::model::SlotLock;
use crate::core::store::{Store, StoreExt, Tables};
use crate::util::ObjectRef;

/// Acquire and inspect slot locks.
#[derive(Clone, Copy)]
pub struct SlotLockManager<'a> {
    store: &'a dyn Store,
    now_ms: u64,
}

impl<'a> SlotLockManager<'a> {
    /// Manage locks in `store`, stamping new locks with `now_ms`.
    #[must_use]
    pub fn new(store: &'a dyn Store, now_ms: u64) -> Self {
        Self { store, now_ms }
    }

    /// Take every key for `holder` inside an open transaction.
    ///
    /// Keys already held by `holder` are left alone. If any key is held by
    /// someone else nothing is written and the contended keys are returned
    /// in the error; the enclosing transaction then rolls back as a whole.
    ///
    /// # Errors
    ///
    /// Returns [`DrydockError::SlotLockConflict`] on contention.
    pub fn acquire_in(tables: &mut Tables, holder: ObjectRef, keys: &[String], now_ms: u64) -> Result<()> {
        let wanted: BTreeSet<&String> = keys.iter().collect();
        let contended: Vec<String> = wanted
            .iter()
            .filter(|key| {
                tables
                    .slot_locks
                    .get(key.as_str())
                    .is_some_and(|lock| lock.holder != holder)
            })
            .map(|key| (*key).clone())
            .collect();
        if !contended.is_empty() {
            tracing::debug!(holder = %holder, keys = ?contended, "slot lock conflict");
            return Err(DrydockError::SlotLockConflict {
                holder,
                keys: contended,
            });
        }
        for key in wanted {
            tables.slot_locks.entry(key.clone()).or_insert_with(|| SlotLock {
                key: key.clone(),
                holder,
                acquired_at_ms: now_ms,
            });
        }
        Ok(())
    }

    /// Current holders of whichever `keys` are held.
    #[must_use]
    pub fn holders_in(tables: &Tables, keys: &[String]) -> BTreeMap<String, ObjectRef> {
        keys.iter()
            .filter_map(|key| tables.slot_locks.get(key).map(|lock| (key.clone(), lock.holder)))
            .collect()
    }

    /// Take every key for `holder` in a transaction of its own.
    ///
    /// # Errors
    ///
    /// Returns [`DrydockError::SlotLockConflict`] on contention, or a backend
    /// error.
    pub fn acquire_locks(&self, holder: ObjectRef, keys: &[String]) -> Result<()> {
        let now_ms = self.now_ms;
        self.store
            .transaction(|tables| Self::acquire_in(tables, holder, keys, now_ms))
    }

    /// Point-in-time check that nobody holds `key`.
    ///
    /// The answer may be stale by the time the caller acts on it. Use it to
    /// skip hopeless candidates, never as a guarantee.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be read.
    pub fn is_lock_free(&self, key: &str) -> Result<bool> {
        self.store.snapshot(|tables| !tables.slot_locks.contains_key(key))
    }

    /// Whoever holds `key`, if anyone.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be read.
    pub fn holder(&self, key: &str) -> Result<Option<ObjectRef>> {
        self.store
            .snapshot(|tables| tables.slot_locks.get(key).map(|lock| lock.holder))
    }

    /// Keys held by `holder`, sorted.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be read.
    pub fn locks_held_by(&self, holder: ObjectRef) -> Result<Vec<String>> {
        self.store.snapshot(|tables| {
            tables
                .slot_locks
                .values()
                .filter(|lock| lock.holder == holder)
                .map(|lock| lock.key.clone())
                .collect()
        })
    }

    /// Drop every lock `holder` owns. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store cannot be written.
    pub fn release_locks(&self, holder: ObjectRef) -> Result<usize> {
        let released = self
            .store
            .transaction(|tables| Ok(tables.release_locks(holder)))?;
        if released > 0 {
            tracing::debug!(holder = %holder, released, "released slot locks");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InMemoryStore;
    use crate::util::{LeaseRef, ResourceRef};

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn all_or_nothing() {
        let store = InMemoryStore::new();
        let locks = SlotLockManager::new(&store, 1);
        let a = ObjectRef::Resource(ResourceRef::generate());
        let b = ObjectRef::Resource(ResourceRef::generate());

        locks.acquire_locks(a, &keys(&["x"])).unwrap();
        let err = locks.acquire_locks(b, &keys(&["y", "x", "z"])).unwrap_err();
        match err {
            DrydockError::SlotLockConflict { holder, keys } => {
                assert_eq!(holder, b);
                assert_eq!(keys, vec!["x".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(locks.is_lock_free("y").unwrap());
        assert!(locks.is_lock_free("z").unwrap());
        assert_eq!(locks.holder("x").unwrap(), Some(a));
    }

    #[test]
    fn reacquiring_own_keys_is_idempotent() {
        let store = InMemoryStore::new();
        let locks = SlotLockManager::new(&store, 1);
        let lease = ObjectRef::Lease(LeaseRef::generate());
        locks.acquire_locks(lease, &keys(&["k", "k"])).unwrap();
        locks.acquire_locks(lease, &keys(&["k", "j"])).unwrap();
        assert_eq!(locks.locks_held_by(lease).unwrap(), keys(&["j", "k"]));
        assert_eq!(locks.release_locks(lease).unwrap(), 2);
        assert!(locks.is_lock_free("k").unwrap());
    }
}
