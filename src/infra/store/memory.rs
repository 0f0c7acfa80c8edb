//! In-memory store for development, tests, and single-process deployments.

use parking_lot::Mutex;

use crate::core::error::Result;
use crate::core::store::{Store, Tables};

/// Tables held behind one mutex.
///
/// Each transaction works on a copy of the tables and swaps it in on
/// success, so a failing body leaves no trace. The copy costs O(rows) per
/// transaction.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with existing tables.
    #[must_use]
    pub fn with_tables(tables: Tables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }
}

impl Store for InMemoryStore {
    fn transact(&self, body: &mut dyn FnMut(&mut Tables) -> Result<()>) -> Result<()> {
        let mut guard = self.tables.lock();
        let mut working = guard.clone();
        body(&mut working)?;
        *guard = working;
        Ok(())
    }

    fn read(&self, body: &mut dyn FnMut(&Tables)) {
        let guard = self.tables.lock();
        body(&guard);
    }
}
