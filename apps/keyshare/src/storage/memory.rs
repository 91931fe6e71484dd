//! In-memory user store.
//!
//! Not durable: everything is lost on restart. Rejected in production.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{KeyshareError, KeyshareResult};
use crate::keyshare::SecureContainer;
use crate::storage::{CasOutcome, PinState, UserRecord, UserStore};

/// Map of user id to record behind a lock. Clone is cheap.
#[derive(Clone, Default)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<String, UserRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> KeyshareError {
    KeyshareError::Storage("memory store lock poisoned".to_string())
}

impl UserStore for MemoryStore {
    fn get(&self, user_id: &str) -> KeyshareResult<UserRecord> {
        let users = self.users.read().map_err(poisoned)?;
        users
            .get(user_id)
            .cloned()
            .ok_or_else(|| KeyshareError::UserNotFound(user_id.to_string()))
    }

    fn insert(&self, record: UserRecord) -> KeyshareResult<()> {
        let mut users = self.users.write().map_err(poisoned)?;
        if users.contains_key(&record.user_id) {
            return Err(KeyshareError::UserExists(record.user_id));
        }
        users.insert(record.user_id.clone(), record);
        Ok(())
    }

    fn compare_and_update_pin_state(
        &self,
        user_id: &str,
        expected: &PinState,
        new: PinState,
    ) -> KeyshareResult<CasOutcome> {
        let mut users = self.users.write().map_err(poisoned)?;
        let record = users
            .get_mut(user_id)
            .ok_or_else(|| KeyshareError::UserNotFound(user_id.to_string()))?;

        if record.pin != *expected {
            return Ok(CasOutcome::Conflict);
        }
        record.pin = new;
        Ok(CasOutcome::Updated)
    }

    fn replace_secure_container(
        &self,
        user_id: &str,
        expected: &SecureContainer,
        new: SecureContainer,
    ) -> KeyshareResult<CasOutcome> {
        let mut users = self.users.write().map_err(poisoned)?;
        let record = users
            .get_mut(user_id)
            .ok_or_else(|| KeyshareError::UserNotFound(user_id.to_string()))?;

        if record.container != *expected {
            return Ok(CasOutcome::Conflict);
        }
        record.container = new;
        Ok(CasOutcome::Updated)
    }

    fn user_ids(&self) -> KeyshareResult<Vec<String>> {
        let users = self.users.read().map_err(poisoned)?;
        Ok(users.keys().cloned().collect())
    }
}
