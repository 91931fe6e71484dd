//! Keyshare core: registration, PIN-gated secret release and maintenance.
//!
//! ## PIN attempt state machine
//!
//! ```text
//!            wrong PIN (failures < N)
//!          ┌─────────────┐
//!          ▼             │
//!      ┌────────┐ ───────┘      wrong PIN (failures >= N)     ┌────────┐
//!      │ Active │ ──────────────────────────────────────────► │ Locked │
//!      └────────┘ ◄────────────────────────────────────────── └────────┘
//!          ▲           lockout_until passes (evaluated lazily)
//!          │
//!    correct PIN: failures reset, share released, assertion issued
//! ```
//!
//! Every transition is an optimistic compare-and-set on the generation tagged
//! [`PinState`]. A writer that loses the race re-reads and re-decides, so
//! concurrent wrong attempts can never be lost and an attempt decided after
//! the lockout was committed sees the lockout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::error::{KeyshareError, KeyshareResult};
use crate::keyshare::assertion::{AssertionIssuer, AssertionKind};
use crate::keyshare::container::{SecureContainer, open, seal};
use crate::keyshare::keys::KeyRegistry;
use crate::keyshare::lockout::LockoutPolicy;
use crate::keyshare::pin::PinHasher;
use crate::keyshare::share::UserSecretShare;
use crate::storage::{CasOutcome, PinState, UserRecord, UserStore};

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of compare-and-set retries before giving up.
pub const DEFAULT_CAS_RETRIES: u32 = 8;

/// Tunables for [`KeyshareCore`].
#[derive(Clone, Debug)]
pub struct CoreOptions {
    pub lockout: LockoutPolicy,
    pub hasher: PinHasher,
    pub store_timeout: Duration,
    pub cas_retries: u32,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            lockout: LockoutPolicy::default(),
            hasher: PinHasher::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cas_retries: DEFAULT_CAS_RETRIES,
        }
    }
}

/// Successful PIN verification.
#[derive(Debug)]
pub struct PinVerified<R> {
    /// Signed `pin` assertion for the user.
    pub assertion: String,
    /// Whatever the continuation computed from the released share.
    pub output: R,
}

/// Outcome counts of a migration pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub already_current: usize,
    pub failed: usize,
}

/// Which transition a successful PIN check commits.
enum OnMatch {
    Release,
    Replace(String),
}

/// What a committed PIN transition decided.
enum Decision {
    Matched(UserRecord),
    Failed { remaining_attempts: u32, lockout_secs: Option<u64> },
}

/// The keyshare cryptographic core.
pub struct KeyshareCore<S> {
    registry: Arc<KeyRegistry>,
    issuer: AssertionIssuer,
    store: S,
    options: CoreOptions,
}

impl<S> KeyshareCore<S>
where
    S: UserStore + Clone + 'static,
{
    pub fn new(
        registry: Arc<KeyRegistry>,
        issuer: AssertionIssuer,
        store: S,
        options: CoreOptions,
    ) -> Self {
        Self {
            registry,
            issuer,
            store,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run a store call on the blocking pool, bounded by the store timeout.
    async fn with_store<T, F>(&self, op: &'static str, f: F) -> KeyshareResult<T>
    where
        F: FnOnce(&S) -> KeyshareResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let timeout = self.options.store_timeout;

        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || f(&store))).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(KeyshareError::Internal(format!("store task failed: {e}"))),
            Err(_) => {
                let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(op, timeout_ms = millis, "Store operation timed out");
                Err(KeyshareError::StorageTimeout(millis))
            }
        }
    }

    async fn load(&self, user_id: &str) -> KeyshareResult<UserRecord> {
        let user_id = user_id.to_string();
        self.with_store("get", move |store| store.get(&user_id)).await
    }

    async fn hash_pin(&self, pin: &str) -> KeyshareResult<String> {
        PinHasher::validate(pin)?;
        let hasher = self.options.hasher.clone();
        let pin = Zeroizing::new(pin.to_string());
        tokio::task::spawn_blocking(move || hasher.hash(&pin))
            .await
            .map_err(|e| KeyshareError::Internal(format!("PIN hashing task failed: {e}")))?
    }

    async fn check_pin(&self, pin: &Zeroizing<String>, verifier: &str) -> KeyshareResult<bool> {
        let hasher = self.options.hasher.clone();
        let pin = pin.clone();
        let verifier = verifier.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&pin, &verifier))
            .await
            .map_err(|e| KeyshareError::Internal(format!("PIN verification task failed: {e}")))?
    }

    /// Seal a share under the current primary key.
    pub fn seal_share(&self, share: &UserSecretShare) -> KeyshareResult<SecureContainer> {
        let payload = share.to_payload();
        seal(&self.registry, &payload)
    }

    fn open_share(&self, user_id: &str, container: &SecureContainer) -> KeyshareResult<UserSecretShare> {
        open(&self.registry, container)
            .and_then(UserSecretShare::from_payload)
            .inspect_err(|e| {
                tracing::error!(
                    user_id,
                    key_id = container.key_id(),
                    error = %e,
                    "Secure container could not be opened"
                );
            })
    }

    /// Register a new user with their PIN and secret share.
    #[tracing::instrument(skip(self, pin, share))]
    pub async fn register_user(
        &self,
        user_id: &str,
        pin: &str,
        share: UserSecretShare,
    ) -> KeyshareResult<()> {
        if user_id.trim().is_empty() {
            return Err(KeyshareError::InvalidInput("username must not be empty".to_string()));
        }

        let verifier = self.hash_pin(pin).await?;
        let container = self.seal_share(&share)?;
        drop(share);

        let record = UserRecord {
            user_id: user_id.to_string(),
            container,
            pin: PinState::new(verifier),
            created_at: Utc::now(),
        };
        self.with_store("insert", move |store| store.insert(record))
            .await?;

        tracing::info!("Registered user");
        Ok(())
    }

    /// Verify a PIN and, on success, hand the decrypted share to
    /// `continuation` and issue a `pin` assertion.
    pub async fn verify_pin<F, R>(
        &self,
        user_id: &str,
        pin: &str,
        continuation: F,
    ) -> KeyshareResult<PinVerified<R>>
    where
        F: FnOnce(&UserSecretShare) -> R,
    {
        self.verify_pin_at(user_id, pin, Utc::now(), continuation)
            .await
    }

    /// [`Self::verify_pin`] with an explicit clock.
    #[tracing::instrument(skip(self, pin, continuation))]
    pub async fn verify_pin_at<F, R>(
        &self,
        user_id: &str,
        pin: &str,
        now: DateTime<Utc>,
        continuation: F,
    ) -> KeyshareResult<PinVerified<R>>
    where
        F: FnOnce(&UserSecretShare) -> R,
    {
        let record = match self.attempt(user_id, pin, now, OnMatch::Release).await? {
            Decision::Matched(record) => record,
            Decision::Failed {
                remaining_attempts,
                lockout_secs,
            } => return Err(pin_incorrect(remaining_attempts, lockout_secs)),
        };

        // Dropped (and zeroized) on every path out of this function
        let share = self.open_share(user_id, &record.container)?;
        let output = continuation(&share);
        drop(share);

        let assertion =
            self.issuer
                .issue_at(user_id, AssertionKind::Pin, Map::new(), None, now)?;

        tracing::info!("PIN verified");
        Ok(PinVerified { assertion, output })
    }

    /// Replace a user's PIN after verifying the old one.
    ///
    /// Subject to the same attempt accounting and lockout as
    /// [`Self::verify_pin`].
    #[tracing::instrument(skip(self, old_pin, new_pin))]
    pub async fn change_pin(&self, user_id: &str, old_pin: &str, new_pin: &str) -> KeyshareResult<()> {
        self.change_pin_at(user_id, old_pin, new_pin, Utc::now())
            .await
    }

    /// [`Self::change_pin`] with an explicit clock.
    pub async fn change_pin_at(
        &self,
        user_id: &str,
        old_pin: &str,
        new_pin: &str,
        now: DateTime<Utc>,
    ) -> KeyshareResult<()> {
        let verifier = self.hash_pin(new_pin).await?;

        match self
            .attempt(user_id, old_pin, now, OnMatch::Replace(verifier))
            .await?
        {
            Decision::Matched(_) => {
                tracing::info!("PIN changed");
                Ok(())
            }
            Decision::Failed {
                remaining_attempts,
                lockout_secs,
            } => Err(pin_incorrect(remaining_attempts, lockout_secs)),
        }
    }

    /// Decide and commit one PIN attempt.
    async fn attempt(
        &self,
        user_id: &str,
        pin: &str,
        now: DateTime<Utc>,
        on_match: OnMatch,
    ) -> KeyshareResult<Decision> {
        let pin = Zeroizing::new(pin.to_string());
        // Argon2 result for the last verifier seen; conflicts rarely change it.
        let mut checked: Option<(String, bool)> = None;

        for attempt in 0..=self.options.cas_retries {
            let record = self.load(user_id).await?;
            let current = &record.pin;

            if let Some(retry_after_secs) = current.lockout_remaining(now) {
                tracing::info!(retry_after_secs, "PIN attempt rejected, account locked");
                return Err(KeyshareError::PinLocked { retry_after_secs });
            }

            let matched = match &checked {
                Some((verifier, matched)) if *verifier == current.verifier => *matched,
                _ => {
                    let matched = self.check_pin(&pin, &current.verifier).await?;
                    checked = Some((current.verifier.clone(), matched));
                    matched
                }
            };

            let mut next = current.clone();
            next.generation = current.generation.wrapping_add(1);

            let decision = if matched {
                next.failures = 0;
                next.lockout_until = None;
                next.last_success = Some(now);
                if let OnMatch::Replace(verifier) = &on_match {
                    next.verifier.clone_from(verifier);
                }
                None
            } else {
                next.failures = current.failures.saturating_add(1);
                let lockout = self.options.lockout.lockout_duration(next.failures);
                next.lockout_until = lockout.map(|window| deadline(now, window));
                Some(Decision::Failed {
                    remaining_attempts: self.options.lockout.remaining_attempts(next.failures),
                    lockout_secs: lockout.map(|window| window.as_secs()),
                })
            };

            let expected = current.clone();
            let uid = user_id.to_string();
            let committed = next.clone();
            let outcome = self
                .with_store("compare_and_update_pin_state", move |store| {
                    store.compare_and_update_pin_state(&uid, &expected, committed)
                })
                .await?;

            match outcome {
                CasOutcome::Updated => {
                    return Ok(match decision {
                        Some(failed) => {
                            tracing::info!(failures = next.failures, "Incorrect PIN");
                            failed
                        }
                        None => Decision::Matched(UserRecord { pin: next, ..record }),
                    });
                }
                CasOutcome::Conflict => {
                    tracing::debug!(attempt, "PIN state changed concurrently, retrying");
                }
            }
        }

        tracing::warn!("PIN state update retries exhausted");
        Err(KeyshareError::StorageConflict(user_id.to_string()))
    }

    /// Issue a `commitment_proof` assertion with the configured expiry.
    #[tracing::instrument(skip(self, claims))]
    pub fn issue_assertion(&self, subject: &str, claims: Map<String, Value>) -> KeyshareResult<String> {
        if subject.trim().is_empty() {
            return Err(KeyshareError::InvalidInput("subject must not be empty".to_string()));
        }
        self.issuer
            .issue(subject, AssertionKind::CommitmentProof, claims, None)
    }

    /// Re-seal one user's container under the current primary key.
    ///
    /// Returns `false` when it already was. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_container(&self, user_id: &str) -> KeyshareResult<bool> {
        let primary_id = self.registry.primary_id();

        for attempt in 0..=self.options.cas_retries {
            let record = self.load(user_id).await?;
            if record.container.key_id() == primary_id {
                return Ok(false);
            }

            let share = self.open_share(user_id, &record.container)?;
            let resealed = self.seal_share(&share)?;
            drop(share);

            let uid = user_id.to_string();
            let from_key = record.container.key_id();
            let outcome = self
                .with_store("replace_secure_container", move |store| {
                    store.replace_secure_container(&uid, &record.container, resealed)
                })
                .await?;

            match outcome {
                CasOutcome::Updated => {
                    tracing::info!(from_key, to_key = primary_id, "Migrated secure container");
                    return Ok(true);
                }
                CasOutcome::Conflict => {
                    tracing::debug!(attempt, "Container changed concurrently, retrying");
                }
            }
        }

        Err(KeyshareError::StorageConflict(user_id.to_string()))
    }

    /// Migrate every user. Failures are logged and counted, not fatal.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_all_containers(&self) -> KeyshareResult<MigrationReport> {
        let user_ids = self
            .with_store("user_ids", |store| store.user_ids())
            .await?;
        let mut report = MigrationReport::default();

        for user_id in user_ids {
            match self.migrate_container(&user_id).await {
                Ok(true) => report.migrated += 1,
                Ok(false) => report.already_current += 1,
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Container migration failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            migrated = report.migrated,
            already_current = report.already_current,
            failed = report.failed,
            "Container migration finished"
        );
        Ok(report)
    }
}

fn pin_incorrect(remaining_attempts: u32, lockout_secs: Option<u64>) -> KeyshareError {
    KeyshareError::PinIncorrect {
        remaining_attempts,
        locked: lockout_secs.is_some(),
        lockout_secs: lockout_secs.unwrap_or(0),
    }
}

fn deadline(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
