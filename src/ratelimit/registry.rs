//! Named limiters and their configuration.
//!
//! Every endpoint family gets its own limiter with its own window and
//! threshold. The set is fixed at startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::limiter::RateLimiter;
use super::window::{LimiterConfig, RateLimitResult};
use crate::error::GuardError;

/// The named limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterName {
    /// Account registration
    Register,
    /// Password login
    Login,
    /// Generic API traffic
    Api,
    /// Other auth endpoints (password reset, verification)
    Auth,
    /// Token refresh
    Refresh,
    /// Sensitive operations
    Strict,
}

impl LimiterName {
    pub const ALL: [LimiterName; 6] = [
        LimiterName::Register,
        LimiterName::Login,
        LimiterName::Api,
        LimiterName::Auth,
        LimiterName::Refresh,
        LimiterName::Strict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterName::Register => "register",
            LimiterName::Login => "login",
            LimiterName::Api => "api",
            LimiterName::Auth => "auth",
            LimiterName::Refresh => "refresh",
            LimiterName::Strict => "strict",
        }
    }
}

impl fmt::Display for LimiterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimiterName {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LimiterName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| GuardError::Config(format!("Unknown limiter: {}", s)))
    }
}

/// Longest window a limiter may be configured with (one day).
pub const MAX_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Window and threshold for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Window width in milliseconds
    pub window_ms: u64,
    /// Requests admitted per window
    pub max_requests: u32,
}

impl LimitSettings {
    pub const fn new(window_secs: u64, max_requests: u32) -> Self {
        Self {
            window_ms: window_secs * 1000,
            max_requests,
        }
    }

    /// Whether `window_ms` is usable as a window width.
    pub fn valid_window(window_ms: u64) -> bool {
        window_ms > 0 && window_ms <= MAX_WINDOW_MS
    }
}

/// Windows and thresholds for every named limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterRegistryConfig {
    #[serde(default = "default_register")]
    pub register: LimitSettings,
    #[serde(default = "default_login")]
    pub login: LimitSettings,
    #[serde(default = "default_api")]
    pub api: LimitSettings,
    #[serde(default = "default_auth")]
    pub auth: LimitSettings,
    #[serde(default = "default_refresh")]
    pub refresh: LimitSettings,
    #[serde(default = "default_strict")]
    pub strict: LimitSettings,
}

fn default_register() -> LimitSettings {
    LimitSettings::new(300, 5)
}

fn default_login() -> LimitSettings {
    LimitSettings::new(900, 10)
}

fn default_api() -> LimitSettings {
    LimitSettings::new(60, 60)
}

fn default_auth() -> LimitSettings {
    LimitSettings::new(60, 10)
}

fn default_refresh() -> LimitSettings {
    LimitSettings::new(900, 5)
}

fn default_strict() -> LimitSettings {
    LimitSettings::new(60, 5)
}

impl Default for LimiterRegistryConfig {
    fn default() -> Self {
        Self {
            register: default_register(),
            login: default_login(),
            api: default_api(),
            auth: default_auth(),
            refresh: default_refresh(),
            strict: default_strict(),
        }
    }
}

impl LimiterRegistryConfig {
    /// Replace unusable values with the limiter's default.
    ///
    /// A zero or over-long window and a zero threshold fall back, the same way
    /// environment overrides do.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for name in LimiterName::ALL {
            let fallback = *defaults.get(name);
            let settings = self.get_mut(name);
            if !LimitSettings::valid_window(settings.window_ms) {
                warn!(
                    limiter = %name,
                    window_ms = settings.window_ms,
                    default = fallback.window_ms,
                    "Invalid limiter window, using default"
                );
                settings.window_ms = fallback.window_ms;
            }
            if settings.max_requests == 0 {
                warn!(
                    limiter = %name,
                    default = fallback.max_requests,
                    "Limiter threshold must be positive, using default"
                );
                settings.max_requests = fallback.max_requests;
            }
        }
    }

    pub fn get(&self, name: LimiterName) -> &LimitSettings {
        match name {
            LimiterName::Register => &self.register,
            LimiterName::Login => &self.login,
            LimiterName::Api => &self.api,
            LimiterName::Auth => &self.auth,
            LimiterName::Refresh => &self.refresh,
            LimiterName::Strict => &self.strict,
        }
    }

    pub fn get_mut(&mut self, name: LimiterName) -> &mut LimitSettings {
        match name {
            LimiterName::Register => &mut self.register,
            LimiterName::Login => &mut self.login,
            LimiterName::Api => &mut self.api,
            LimiterName::Auth => &mut self.auth,
            LimiterName::Refresh => &mut self.refresh,
            LimiterName::Strict => &mut self.strict,
        }
    }

    /// The limiter configuration for `name`, keyed by its name.
    pub fn limiter_config(&self, name: LimiterName) -> LimiterConfig {
        let settings = self.get(name);
        LimiterConfig {
            window_ms: settings.window_ms,
            max_requests: settings.max_requests,
            key_prefix: name.as_str().to_string(),
        }
    }
}

/// A limiter bound to one configuration.
#[derive(Clone)]
pub struct NamedLimiter {
    name: LimiterName,
    config: LimiterConfig,
    limiter: Arc<RateLimiter>,
}

impl NamedLimiter {
    pub fn new(name: LimiterName, config: LimiterConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            name,
            config,
            limiter,
        }
    }

    pub fn name(&self) -> LimiterName {
        self.name
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Check and record a request for `identifier`.
    pub async fn check(&self, identifier: &str) -> RateLimitResult {
        self.limiter.check(identifier, &self.config).await
    }

    /// Clear all state for `identifier`.
    pub async fn reset(&self, identifier: &str) {
        self.limiter.reset(identifier, &self.config).await
    }
}

impl fmt::Debug for NamedLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

/// The fixed set of named limiters sharing one [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterRegistry {
    register: NamedLimiter,
    login: NamedLimiter,
    api: NamedLimiter,
    auth: NamedLimiter,
    refresh: NamedLimiter,
    strict: NamedLimiter,
}

impl LimiterRegistry {
    /// Build every named limiter from `config`.
    pub fn new(config: &LimiterRegistryConfig, limiter: Arc<RateLimiter>) -> Self {
        let build = |name: LimiterName| {
            let limiter_config = config.limiter_config(name);
            info!(
                limiter = %name,
                window_ms = limiter_config.window_ms,
                max_requests = limiter_config.max_requests,
                "Configured rate limiter"
            );
            NamedLimiter::new(name, limiter_config, limiter.clone())
        };

        Self {
            register: build(LimiterName::Register),
            login: build(LimiterName::Login),
            api: build(LimiterName::Api),
            auth: build(LimiterName::Auth),
            refresh: build(LimiterName::Refresh),
            strict: build(LimiterName::Strict),
        }
    }

    pub fn get(&self, name: LimiterName) -> &NamedLimiter {
        match name {
            LimiterName::Register => &self.register,
            LimiterName::Login => &self.login,
            LimiterName::Api => &self.api,
            LimiterName::Auth => &self.auth,
            LimiterName::Refresh => &self.refresh,
            LimiterName::Strict => &self.strict,
        }
    }

    pub fn register(&self) -> &NamedLimiter {
        &self.register
    }

    pub fn login(&self) -> &NamedLimiter {
        &self.login
    }

    pub fn api(&self) -> &NamedLimiter {
        &self.api
    }

    pub fn auth(&self) -> &NamedLimiter {
        &self.auth
    }

    pub fn refresh(&self) -> &NamedLimiter {
        &self.refresh
    }

    pub fn strict(&self) -> &NamedLimiter {
        &self.strict
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedLimiter> {
        LimiterName::ALL.into_iter().map(move |name| self.get(name))
    }
}
