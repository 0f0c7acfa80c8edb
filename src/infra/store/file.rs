//! File-backed store persisting the tables as a JSON document.
//!
//! Every committed transaction rewrites the document through a temporary file
//! and an atomic rename, so a crash leaves either the old or the new state on
//! disk, never a torn one. Suitable for a single host; concurrent processes
//! must not share one file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::error::{DrydockError, Result};
use crate::core::store::{Store, Tables};

/// JSON document store.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing state if the file exists.
    ///
    /// # Errors
    ///
    /// Fails if the parent directory cannot be created or the document does
    /// not parse.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tables = if path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            Tables::default()
        };
        tracing::debug!(path = %path.display(), "opened json file store");
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    /// Location of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, tables: &Tables) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let bytes = serde_json::to_vec(tables)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            DrydockError::Backend(format!("failed to replace {}: {e}", self.path.display()))
        })
    }
}

impl Store for JsonFileStore {
    fn transact(&self, body: &mut dyn FnMut(&mut Tables) -> Result<()>) -> Result<()> {
        let mut guard = self.tables.lock();
        let mut working = guard.clone();
        body(&mut working)?;
        self.persist(&working)?;
        *guard = working;
        Ok(())
    }

    fn read(&self, body: &mut dyn FnMut(&Tables)) {
        let guard = self.tables.lock();
        body(&guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Lease;
    use crate::core::store::StoreExt;

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drydock").join("state.json");

        let lease = {
            let store = JsonFileStore::open(&path).unwrap();
            store
                .transaction(|t| t.insert_lease(Lease::new("host"), 7))
                .unwrap()
        };

        let reopened = JsonFileStore::open(&path).unwrap();
        let loaded = reopened
            .snapshot(|t| t.leases.get(&lease.reference).cloned())
            .unwrap()
            .unwrap();
        assert_eq!(loaded, lease);
        assert_eq!(reopened.snapshot(|t| t.last_row_id).unwrap(), 1);
    }

    #[test]
    fn failed_transaction_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).unwrap();
        let result: Result<()> = store.transaction(|t| {
            t.insert_lease(Lease::new("host"), 1)?;
            Err(DrydockError::Backend("abort".into()))
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
