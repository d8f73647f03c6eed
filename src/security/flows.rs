//! Login and registration guards.
//!
//! A login runs through the login limiter, then the account lookup, then the
//! lockout check, and only then the password check. Every outcome leaves one
//! or two entries in the security log.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::events::{SecurityEvent, SecurityEventType, SecurityLogger};
use super::lockout::{AccountLockoutPolicy, LockoutState, LoginStateStore};
use crate::error::Result;
use crate::gate::{check_rate_limit, CheckOptions, GateDecision, RateLimitRejection};
use crate::ratelimit::{client_ip, user_agent, Clock, NamedLimiter};

/// Why a login attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginFailureReason {
    UserNotFound,
    InvalidPassword,
    AccountLocked,
}

impl LoginFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginFailureReason::UserNotFound => "user_not_found",
            LoginFailureReason::InvalidPassword => "invalid_password",
            LoginFailureReason::AccountLocked => "account_locked",
        }
    }
}

/// Result of a guarded login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Password accepted; lockout state cleared
    Success { user_id: String },
    /// Turned away by the login limiter
    RateLimited(RateLimitRejection),
    /// Account is locked; the password was not checked
    Locked {
        until: DateTime<Utc>,
        remaining: Duration,
    },
    /// Unknown account or wrong password
    Failed {
        reason: LoginFailureReason,
        /// Set when this failure locked the account
        locked_until: Option<DateTime<Utc>>,
    },
}

/// Limiter, lockout and audit trail around password login.
#[derive(Clone)]
pub struct LoginGuard {
    limiter: NamedLimiter,
    policy: AccountLockoutPolicy,
    store: Arc<dyn LoginStateStore>,
    logger: SecurityLogger,
    clock: Arc<dyn Clock>,
}

impl LoginGuard {
    pub fn new(
        limiter: NamedLimiter,
        policy: AccountLockoutPolicy,
        store: Arc<dyn LoginStateStore>,
        logger: SecurityLogger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            policy,
            store,
            logger,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.clock.now_ms() as i64).unwrap_or_else(Utc::now)
    }

    /// Run one login attempt.
    ///
    /// `user_id` is the account the submitted credentials resolved to, if
    /// any. `verify` checks the password and is only called for an existing,
    /// unlocked account. Fails only when the lockout state cannot be stored.
    pub async fn login<F>(
        &self,
        headers: &HeaderMap,
        user_id: Option<&str>,
        verify: F,
    ) -> Result<LoginOutcome>
    where
        F: FnOnce() -> bool,
    {
        let options = CheckOptions {
            logger: Some(&self.logger),
            ..CheckOptions::default()
        };
        if let GateDecision::Reject(rejection) =
            check_rate_limit(headers, &self.limiter, options).await
        {
            return Ok(LoginOutcome::RateLimited(rejection));
        }

        let ip = client_ip(headers);
        let agent = user_agent(headers);
        let event = |event_type| SecurityEvent::new(event_type, ip.clone()).user_agent(agent.clone());

        let Some(user_id) = user_id else {
            debug!(ip = %ip, "Login for unknown account");
            self.logger
                .log(
                    event(SecurityEventType::LoginFailed)
                        .metadata(json!({ "reason": LoginFailureReason::UserNotFound.as_str() })),
                )
                .await;
            return Ok(LoginOutcome::Failed {
                reason: LoginFailureReason::UserNotFound,
                locked_until: None,
            });
        };

        let now = self.now();
        let record = self.store.load(user_id).await?;

        if let LockoutState::Locked { until } = self.policy.evaluate(&record, now) {
            let remaining = self.policy.remaining_lock(&record, now);
            debug!(user_id, until = %until, "Login for locked account");
            self.logger
                .log(event(SecurityEventType::LoginFailed).user(user_id).metadata(json!({
                    "reason": LoginFailureReason::AccountLocked.as_str(),
                    "lockedUntil": until,
                })))
                .await;
            return Ok(LoginOutcome::Locked { until, remaining });
        }

        if verify() {
            let cleared = self.policy.on_success();
            if record != cleared {
                self.store.save(user_id, &cleared).await?;
            }
            self.logger
                .log(event(SecurityEventType::LoginSuccess).user(user_id))
                .await;
            return Ok(LoginOutcome::Success {
                user_id: user_id.to_string(),
            });
        }

        let outcome = self.policy.on_failure(&record, now);
        self.store.save(user_id, &outcome.state).await?;
        self.logger
            .log(event(SecurityEventType::LoginFailed).user(user_id).metadata(json!({
                "reason": LoginFailureReason::InvalidPassword.as_str(),
                "attemptCount": outcome.state.failed_login_attempts,
            })))
            .await;

        if let Some(until) = outcome.locked_until {
            info!(user_id, until = %until, "Account locked after repeated failed logins");
            self.logger
                .log(event(SecurityEventType::AccountLocked).user(user_id).metadata(json!({
                    "attemptCount": outcome.state.failed_login_attempts,
                    "lockedUntil": until,
                })))
                .await;
        }

        Ok(LoginOutcome::Failed {
            reason: LoginFailureReason::InvalidPassword,
            locked_until: outcome.locked_until,
        })
    }
}

impl std::fmt::Debug for LoginGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginGuard")
            .field("limiter", &self.limiter)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Limiter and audit trail around account registration.
#[derive(Debug, Clone)]
pub struct RegistrationGuard {
    limiter: NamedLimiter,
    logger: SecurityLogger,
}

impl RegistrationGuard {
    pub fn new(limiter: NamedLimiter, logger: SecurityLogger) -> Self {
        Self { limiter, logger }
    }

    /// Gate a registration request through the register limiter.
    pub async fn admit(&self, headers: &HeaderMap) -> GateDecision {
        let options = CheckOptions {
            logger: Some(&self.logger),
            ..CheckOptions::default()
        };
        check_rate_limit(headers, &self.limiter, options).await
    }

    /// Log the outcome of an admitted registration.
    ///
    /// `Ok` carries the new account id, `Err` a short failure reason.
    pub async fn record(&self, headers: &HeaderMap, outcome: std::result::Result<&str, &str>) {
        let ip = client_ip(headers);
        let event = match outcome {
            Ok(user_id) => {
                SecurityEvent::new(SecurityEventType::RegistrationSuccess, ip).user(user_id)
            }
            Err(reason) => SecurityEvent::new(SecurityEventType::RegistrationFailed, ip)
                .metadata(json!({ "reason": reason })),
        };
        self.logger.log(event.user_agent(user_agent(headers))).await;
    }
}
