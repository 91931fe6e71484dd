//! ReDB storage backend.
//!
//! One table keyed by user id with JSON-serialized [`UserRecord`] values.
//! Every compare-and-set runs inside a single write transaction, and ReDB
//! serializes write transactions, so the read-compare-write cannot interleave
//! with another writer.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::{KeyshareError, KeyshareResult};
use crate::keyshare::SecureContainer;
use crate::storage::{CasOutcome, PinState, UserRecord, UserStore};

// String keys, JSON values
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Durable user store.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> KeyshareResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| KeyshareError::Storage(e.to_string()))?;
        let store = Self::init(db)?;

        tracing::info!(path = %path.display(), "Opened user database");
        Ok(store)
    }

    /// Open a non-persistent database backed by memory.
    pub fn open_memory() -> KeyshareResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| KeyshareError::Storage(e.to_string()))?;
        Self::init(db)
    }

    fn init(db: Database) -> KeyshareResult<Self> {
        // Opening the table creates it if missing
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Read-modify-write one record inside a write transaction.
    ///
    /// `update` returns `None` to leave the record untouched (a conflict).
    fn modify<F>(&self, user_id: &str, update: F) -> KeyshareResult<CasOutcome>
    where
        F: FnOnce(UserRecord) -> Option<UserRecord>,
    {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(USERS)?;
            let current = table.get(user_id)?.map(|v| v.value().to_vec());
            let Some(current) = current else {
                drop(table);
                write_txn.abort()?;
                return Err(KeyshareError::UserNotFound(user_id.to_string()));
            };

            let record: UserRecord = serde_json::from_slice(&current)?;
            match update(record) {
                Some(updated) => {
                    let value = serde_json::to_vec(&updated)?;
                    table.insert(user_id, value.as_slice())?;
                    CasOutcome::Updated
                }
                None => CasOutcome::Conflict,
            }
        };

        match outcome {
            CasOutcome::Updated => write_txn.commit()?,
            CasOutcome::Conflict => write_txn.abort()?,
        }
        Ok(outcome)
    }
}

impl UserStore for RedbStore {
    fn get(&self, user_id: &str) -> KeyshareResult<UserRecord> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        match table.get(user_id)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Err(KeyshareError::UserNotFound(user_id.to_string())),
        }
    }

    fn insert(&self, record: UserRecord) -> KeyshareResult<()> {
        let value = serde_json::to_vec(&record)?;
        let write_txn = self.db.begin_write()?;
        let exists = {
            let mut table = write_txn.open_table(USERS)?;
            let exists = table.get(record.user_id.as_str())?.is_some();
            if !exists {
                table.insert(record.user_id.as_str(), value.as_slice())?;
            }
            exists
        };

        if exists {
            write_txn.abort()?;
            return Err(KeyshareError::UserExists(record.user_id));
        }

        write_txn.commit()?;
        tracing::debug!(user_id = %record.user_id, "Stored user record");
        Ok(())
    }

    fn compare_and_update_pin_state(
        &self,
        user_id: &str,
        expected: &PinState,
        new: PinState,
    ) -> KeyshareResult<CasOutcome> {
        self.modify(user_id, |mut record| {
            (record.pin == *expected).then(|| {
                record.pin = new;
                record
            })
        })
    }

    fn replace_secure_container(
        &self,
        user_id: &str,
        expected: &SecureContainer,
        new: SecureContainer,
    ) -> KeyshareResult<CasOutcome> {
        self.modify(user_id, |mut record| {
            (record.container == *expected).then(|| {
                record.container = new;
                record
            })
        })
    }

    fn user_ids(&self) -> KeyshareResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        table
            .iter()?
            .map(|entry| {
                let (k, _) = entry?;
                Ok(k.value().to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support;

    #[test]
    fn test_insert_and_get() -> KeyshareResult<()> {
        test_support::check_insert_and_get(&RedbStore::open_memory()?);
        Ok(())
    }

    #[test]
    fn test_pin_state_cas() -> KeyshareResult<()> {
        test_support::check_pin_state_cas(&RedbStore::open_memory()?);
        Ok(())
    }

    #[test]
    fn test_container_cas() -> KeyshareResult<()> {
        test_support::check_container_cas(&RedbStore::open_memory()?);
        Ok(())
    }

    #[test]
    fn test_user_ids() -> KeyshareResult<()> {
        test_support::check_user_ids(&RedbStore::open_memory()?);
        Ok(())
    }

    #[test]
    fn test_survives_reopen() -> KeyshareResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("users.redb");
        let alice = test_support::record("alice");

        {
            let store = RedbStore::open(&path)?;
            store.insert(alice.clone())?;

            let mut failed = alice.pin.clone();
            failed.failures = 2;
            failed.generation = 1;
            store.compare_and_update_pin_state("alice", &alice.pin, failed)?;
        }

        let reopened = RedbStore::open(&path)?;
        let stored = reopened.get("alice")?;
        assert_eq!(stored.pin.failures, 2);
        assert_eq!(stored.container, alice.container);
        Ok(())
    }
}
