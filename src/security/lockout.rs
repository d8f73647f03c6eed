//! Account lockout after repeated failed logins.
//!
//! Each account carries a failed-attempt counter and an optional lock expiry.
//! Reaching the threshold locks the account for a fixed duration; a successful
//! login clears both.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::LockoutConfig;
use crate::error::{GuardError, Result};

/// Persisted lockout fields of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedLoginState {
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Lockout state of an account at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutState {
    Unlocked { attempts: u32 },
    Locked { until: DateTime<Utc> },
}

/// Result of recording a failed login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// State to persist
    pub state: FailedLoginState,
    /// Set when this failure locked the account
    pub locked_until: Option<DateTime<Utc>>,
}

/// Threshold and duration of account locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountLockoutPolicy {
    max_attempts: u32,
    lock_duration: chrono::Duration,
}

impl Default for AccountLockoutPolicy {
    fn default() -> Self {
        Self::from_config(&LockoutConfig::default())
    }
}

impl AccountLockoutPolicy {
    pub fn new(max_attempts: u32, lock_duration: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            lock_duration: chrono::Duration::from_std(lock_duration)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
        }
    }

    pub fn from_config(config: &LockoutConfig) -> Self {
        Self::new(
            config.max_failed_attempts,
            Duration::from_secs(config.lock_duration_secs),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Evaluate a persisted record at `now`.
    ///
    /// A lock that has run out counts as a fresh start.
    pub fn evaluate(&self, record: &FailedLoginState, now: DateTime<Utc>) -> LockoutState {
        match record.locked_until {
            Some(until) if until > now => LockoutState::Locked { until },
            Some(_) => LockoutState::Unlocked { attempts: 0 },
            None => LockoutState::Unlocked {
                attempts: record.failed_login_attempts,
            },
        }
    }

    /// Record a failed password check.
    ///
    /// A record that is still locked comes back unchanged.
    pub fn on_failure(&self, record: &FailedLoginState, now: DateTime<Utc>) -> FailureOutcome {
        let attempts = match self.evaluate(record, now) {
            LockoutState::Locked { .. } => {
                return FailureOutcome {
                    state: record.clone(),
                    locked_until: None,
                }
            }
            LockoutState::Unlocked { attempts } => attempts.saturating_add(1),
        };

        if attempts >= self.max_attempts {
            let until = now + self.lock_duration;
            FailureOutcome {
                state: FailedLoginState {
                    failed_login_attempts: attempts,
                    locked_until: Some(until),
                },
                locked_until: Some(until),
            }
        } else {
            FailureOutcome {
                state: FailedLoginState {
                    failed_login_attempts: attempts,
                    locked_until: None,
                },
                locked_until: None,
            }
        }
    }

    /// State after a successful login.
    pub fn on_success(&self) -> FailedLoginState {
        FailedLoginState::default()
    }

    /// Time left on a lock, zero when unlocked.
    pub fn remaining_lock(&self, record: &FailedLoginState, now: DateTime<Utc>) -> Duration {
        match self.evaluate(record, now) {
            LockoutState::Locked { until } => (until - now).to_std().unwrap_or_default(),
            LockoutState::Unlocked { .. } => Duration::ZERO,
        }
    }
}

/// Storage for per-account lockout fields.
#[async_trait]
pub trait LoginStateStore: Send + Sync {
    /// The record for `user_id`, or the default when none exists.
    async fn load(&self, user_id: &str) -> Result<FailedLoginState>;

    async fn save(&self, user_id: &str, state: &FailedLoginState) -> Result<()>;
}

/// Lockout records held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLoginStateStore {
    records: DashMap<String, FailedLoginState>,
}

impl InMemoryLoginStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoginStateStore for InMemoryLoginStateStore {
    async fn load(&self, user_id: &str) -> Result<FailedLoginState> {
        Ok(self
            .records
            .get(user_id)
            .map(|record| record.value().clone())
            .unwrap_or_default())
    }

    async fn save(&self, user_id: &str, state: &FailedLoginState) -> Result<()> {
        if user_id.is_empty() {
            return Err(GuardError::Store("empty user id".to_string()));
        }
        if *state == FailedLoginState::default() {
            self.records.remove(user_id);
        } else {
            self.records.insert(user_id.to_string(), state.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_failures_below_threshold() {
        let policy = AccountLockoutPolicy::default();
        let mut record = FailedLoginState::default();

        for expected in 1..=4 {
            let outcome = policy.on_failure(&record, at(0));
            assert_eq!(outcome.locked_until, None);
            assert_eq!(outcome.state.failed_login_attempts, expected);
            record = outcome.state;
        }
        assert_eq!(
            policy.evaluate(&record, at(0)),
            LockoutState::Unlocked { attempts: 4 }
        );
    }

    #[test]
    fn test_fifth_failure_locks_for_thirty_minutes() {
        let policy = AccountLockoutPolicy::default();
        let record = FailedLoginState {
            failed_login_attempts: 4,
            locked_until: None,
        };

        let outcome = policy.on_failure(&record, at(0));
        let until = at(30 * 60);
        assert_eq!(outcome.locked_until, Some(until));
        assert_eq!(outcome.state.locked_until, Some(until));

        // Any attempt before the expiry is rejected
        assert_eq!(
            policy.evaluate(&outcome.state, at(29 * 60)),
            LockoutState::Locked { until }
        );
        assert_eq!(
            policy.remaining_lock(&outcome.state, at(29 * 60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_failure_while_locked_keeps_state() {
        let policy = AccountLockoutPolicy::default();
        let record = FailedLoginState {
            failed_login_attempts: 5,
            locked_until: Some(at(600)),
        };

        let outcome = policy.on_failure(&record, at(10));
        assert_eq!(outcome.state, record);
        assert_eq!(outcome.locked_until, None);
    }

    #[test]
    fn test_expired_lock_starts_over() {
        let policy = AccountLockoutPolicy::default();
        let record = FailedLoginState {
            failed_login_attempts: 5,
            locked_until: Some(at(0)),
        };

        assert_eq!(
            policy.evaluate(&record, at(1)),
            LockoutState::Unlocked { attempts: 0 }
        );
        let outcome = policy.on_failure(&record, at(1));
        assert_eq!(outcome.state.failed_login_attempts, 1);
        assert_eq!(outcome.state.locked_until, None);
        assert_eq!(policy.remaining_lock(&record, at(1)), Duration::ZERO);
    }

    #[test]
    fn test_success_clears() {
        let policy = AccountLockoutPolicy::default();
        assert_eq!(policy.on_success(), FailedLoginState::default());
    }

    #[test]
    fn test_custom_threshold() {
        let policy = AccountLockoutPolicy::new(2, Duration::from_secs(60));
        let first = policy.on_failure(&FailedLoginState::default(), at(0));
        assert!(first.locked_until.is_none());
        let second = policy.on_failure(&first.state, at(0));
        assert_eq!(second.locked_until, Some(at(60)));
    }

    #[test]
    fn test_in_memory_store() {
        tokio_test::block_on(async {
            let store = InMemoryLoginStateStore::new();
            assert_eq!(store.load("u-1").await.unwrap(), FailedLoginState::default());

            let state = FailedLoginState {
                failed_login_attempts: 3,
                locked_until: None,
            };
            store.save("u-1", &state).await.unwrap();
            assert_eq!(store.load("u-1").await.unwrap(), state);
            assert_eq!(store.load("u-2").await.unwrap(), FailedLoginState::default());

            store.save("u-1", &FailedLoginState::default()).await.unwrap();
            assert_eq!(store.load("u-1").await.unwrap(), FailedLoginState::default());

            assert!(store.save("", &state).await.is_err());
        });
    }

    #[test]
    fn test_state_serialization() {
        let state = FailedLoginState {
            failed_login_attempts: 5,
            locked_until: Some(at(0)),
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["failedLoginAttempts"], 5);
        assert!(value["lockedUntil"].is_string());
    }
}
