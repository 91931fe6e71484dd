//! User record storage.
//!
//! The [`UserStore`] trait is the only way the keyshare core touches
//! persistent state. Two backends implement it:
//!
//! - [`MemoryStore`]: mutex-guarded map for tests and local development
//! - [`RedbStore`]: ReDB embedded database with ACID transactions
//!
//! Updates to mutable fields are compare-and-set: the caller passes the value
//! it read and the store applies the new value only if nothing changed in
//! between. Store methods are synchronous; async callers run them on the
//! blocking pool.

pub mod memory;
pub mod redb;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KeyshareResult;
use crate::keyshare::SecureContainer;

pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;

/// PIN verifier and attempt bookkeeping for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinState {
    /// Argon2id PHC string.
    pub verifier: String,
    /// Consecutive failed attempts since the last success.
    pub failures: u32,
    /// Attempts are rejected until this instant.
    pub lockout_until: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Incremented on every committed update.
    pub generation: u64,
}

impl PinState {
    pub fn new(verifier: String) -> Self {
        Self {
            verifier,
            failures: 0,
            lockout_until: None,
            last_success: None,
            generation: 0,
        }
    }

    /// Seconds left on an active lockout, rounded up.
    pub fn lockout_remaining(&self, now: DateTime<Utc>) -> Option<u64> {
        let until = self.lockout_until?;
        if now >= until {
            return None;
        }
        let millis = (until - now).num_milliseconds().max(1);
        Some(u64::try_from(millis).unwrap_or(u64::MAX).div_ceil(1000))
    }
}

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub container: SecureContainer,
    pub pin: PinState,
    pub created_at: DateTime<Utc>,
}

/// Result of a compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Updated,
    /// The stored value no longer matches `expected`.
    Conflict,
}

/// Persistence contract for user records.
pub trait UserStore: Send + Sync {
    /// Fetch a record. Missing users are `UserNotFound`.
    fn get(&self, user_id: &str) -> KeyshareResult<UserRecord>;

    /// Insert a new record. Existing users are `UserExists`.
    fn insert(&self, record: UserRecord) -> KeyshareResult<()>;

    /// Replace the PIN state if it still equals `expected`.
    fn compare_and_update_pin_state(
        &self,
        user_id: &str,
        expected: &PinState,
        new: PinState,
    ) -> KeyshareResult<CasOutcome>;

    /// Replace the secure container if it still equals `expected`.
    fn replace_secure_container(
        &self,
        user_id: &str,
        expected: &SecureContainer,
        new: SecureContainer,
    ) -> KeyshareResult<CasOutcome>;

    /// Every registered user id, in no particular order.
    fn user_ids(&self) -> KeyshareResult<Vec<String>>;
}

/// Backend selected at startup.
#[derive(Clone)]
pub enum UserStoreBackend {
    Memory(MemoryStore),
    Redb(RedbStore),
}

impl UserStoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redb(_) => "redb",
        }
    }
}

impl UserStore for UserStoreBackend {
    fn get(&self, user_id: &str) -> KeyshareResult<UserRecord> {
        match self {
            Self::Memory(store) => store.get(user_id),
            Self::Redb(store) => store.get(user_id),
        }
    }

    fn insert(&self, record: UserRecord) -> KeyshareResult<()> {
        match self {
            Self::Memory(store) => store.insert(record),
            Self::Redb(store) => store.insert(record),
        }
    }

    fn compare_and_update_pin_state(
        &self,
        user_id: &str,
        expected: &PinState,
        new: PinState,
    ) -> KeyshareResult<CasOutcome> {
        match self {
            Self::Memory(store) => store.compare_and_update_pin_state(user_id, expected, new),
            Self::Redb(store) => store.compare_and_update_pin_state(user_id, expected, new),
        }
    }

    fn replace_secure_container(
        &self,
        user_id: &str,
        expected: &SecureContainer,
        new: SecureContainer,
    ) -> KeyshareResult<CasOutcome> {
        match self {
            Self::Memory(store) => store.replace_secure_container(user_id, expected, new),
            Self::Redb(store) => store.replace_secure_container(user_id, expected, new),
        }
    }

    fn user_ids(&self) -> KeyshareResult<Vec<String>> {
        match self {
            Self::Memory(store) => store.user_ids(),
            Self::Redb(store) => store.user_ids(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Behaviour shared by every backend, run against each in its own tests.

    use super::*;
    use crate::error::KeyshareError;
    use crate::keyshare::{KeyRegistry, StorageKey, seal};

    pub fn record(user_id: &str) -> UserRecord {
        let registry = KeyRegistry::new(1, StorageKey::from_bytes([0x42; 32]));
        UserRecord {
            user_id: user_id.to_string(),
            container: seal(&registry, b"share").unwrap(),
            pin: PinState::new("$argon2id$v=19$m=8,t=1,p=1$c2FsdA$aGFzaA".to_string()),
            created_at: Utc::now(),
        }
    }

    pub fn check_insert_and_get(store: &dyn UserStore) {
        let alice = record("alice");
        store.insert(alice.clone()).unwrap();
        assert_eq!(store.get("alice").unwrap(), alice);

        assert!(matches!(
            store.insert(record("alice")),
            Err(KeyshareError::UserExists(_))
        ));
        assert!(matches!(
            store.get("bob"),
            Err(KeyshareError::UserNotFound(_))
        ));
    }

    pub fn check_pin_state_cas(store: &dyn UserStore) {
        let alice = record("alice");
        store.insert(alice.clone()).unwrap();

        let mut failed = alice.pin.clone();
        failed.failures = 1;
        failed.generation = 1;

        assert_eq!(
            store
                .compare_and_update_pin_state("alice", &alice.pin, failed.clone())
                .unwrap(),
            CasOutcome::Updated
        );

        // A writer still holding the old state loses.
        let mut stale = alice.pin.clone();
        stale.failures = 0;
        stale.generation = 1;
        assert_eq!(
            store
                .compare_and_update_pin_state("alice", &alice.pin, stale)
                .unwrap(),
            CasOutcome::Conflict
        );

        assert_eq!(store.get("alice").unwrap().pin, failed);
        assert!(matches!(
            store.compare_and_update_pin_state("bob", &alice.pin, failed),
            Err(KeyshareError::UserNotFound(_))
        ));
    }

    pub fn check_container_cas(store: &dyn UserStore) {
        let alice = record("alice");
        store.insert(alice.clone()).unwrap();

        let replacement = record("alice").container;
        assert_eq!(
            store
                .replace_secure_container("alice", &alice.container, replacement.clone())
                .unwrap(),
            CasOutcome::Updated
        );
        assert_eq!(
            store
                .replace_secure_container("alice", &alice.container, alice.container.clone())
                .unwrap(),
            CasOutcome::Conflict
        );

        let stored = store.get("alice").unwrap();
        assert_eq!(stored.container, replacement);
        // PIN state is untouched by container replacement
        assert_eq!(stored.pin, alice.pin);
    }

    pub fn check_user_ids(store: &dyn UserStore) {
        for id in ["carol", "alice", "bob"] {
            store.insert(record(id)).unwrap();
        }
        let mut ids = store.user_ids().unwrap();
        ids.sort();
        assert_eq!(ids, ["alice", "bob", "carol"]);
    }
}
