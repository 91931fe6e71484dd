//! Progressive lockout policy for PIN brute-force protection.
//!
//! Failures below the threshold only count. Once the failure counter reaches
//! the threshold, every further failure locks the account for an
//! exponentially growing window:
//!
//! ```text
//! backoff(n) = min(base * 2^(n - threshold), max)   for n >= threshold
//! ```

use std::time::Duration;

/// Default number of failures before the first lockout.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default first lockout window.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(60);
/// Default upper bound on the lockout window.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential lockout policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Failures allowed before the first lockout.
    pub threshold: u32,
    /// Lockout window at the threshold.
    pub base: Duration,
    /// Cap on the lockout window.
    pub max: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MAX_ATTEMPTS,
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl LockoutPolicy {
    pub fn new(threshold: u32, base: Duration, max: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            base,
            max: max.max(base),
        }
    }

    /// Lockout window after `failures` consecutive failures, or `None` while
    /// still below the threshold.
    pub fn lockout_duration(&self, failures: u32) -> Option<Duration> {
        if !self.is_locked(failures) {
            return None;
        }

        let level = (failures - self.threshold).min(32);
        let factor = 1u32.checked_shl(level).unwrap_or(u32::MAX);
        let window = self
            .base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max));

        Some(window)
    }

    /// Attempts left before the next failure triggers a lockout.
    pub fn remaining_attempts(&self, failures: u32) -> u32 {
        self.threshold.saturating_sub(failures)
    }

    /// Check if `failures` consecutive failures put the account into lockout.
    pub fn is_locked(&self, failures: u32) -> bool {
        failures >= self.threshold
    }
}
