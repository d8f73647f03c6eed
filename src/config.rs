//! Configuration management for the guard.
//!
//! Configuration comes from an optional YAML file, then environment overrides
//! are applied on top. Environment values that are missing, unparsable or not
//! positive leave the file value (or the default) in place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GuardError, Result};
use crate::ratelimit::{LimitSettings, LimiterName, LimiterRegistryConfig};

/// Environment value that marks a production deployment.
pub const PRODUCTION: &str = "production";

/// Main configuration for the guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Deployment environment name
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Distributed counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limiter windows and thresholds
    #[serde(default)]
    pub limits: LimiterRegistryConfig,

    /// In-process store sweep configuration
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Account lockout configuration
    #[serde(default)]
    pub lockout: LockoutConfig,

    /// Security log configuration
    #[serde(default)]
    pub security_log: SecurityLogConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            store: StoreConfig::default(),
            limits: LimiterRegistryConfig::default(),
            sweep: SweepConfig::default(),
            lockout: LockoutConfig::default(),
            security_log: SecurityLogConfig::default(),
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

/// Distributed counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection string; absent means in-process counters only
    #[serde(default)]
    pub url: Option<String>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Consecutive failed connects before giving up for good
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Backoff added per failed connect, in milliseconds
    #[serde(default = "default_reconnect_step")]
    pub reconnect_step_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_step_ms: default_reconnect_step(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_command_timeout() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_step() -> u64 {
    200
}

fn default_reconnect_max_delay() -> u64 {
    2_000
}

/// In-process store sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Timestamps older than this many seconds are dropped
    #[serde(default = "default_sweep_max_age")]
    pub max_age_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            max_age_secs: default_sweep_max_age(),
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_max_age() -> u64 {
    600
}

/// Account lockout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Failed logins that trigger a lock
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,

    /// Lock length in seconds
    #[serde(default = "default_lock_duration")]
    pub lock_duration_secs: u64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_failed_attempts(),
            lock_duration_secs: default_lock_duration(),
        }
    }
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lock_duration() -> u64 {
    30 * 60
}

/// Security log configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityLogConfig {
    /// JSON Lines file receiving security events; in-memory when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl GuardConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse guard config: {}", e)))?;
        config.limits.sanitize();
        Ok(config)
    }

    /// Load the optional file, then apply overrides from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&EnvOverrides::from_process()?);
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(environment) = env.string("APP_ENV") {
            self.environment = environment;
        }
        if let Some(url) = env.string("REDIS_URL") {
            self.store.url = Some(url);
        }
        if let Some(path) = env.string("SECURITY_LOG_PATH") {
            self.security_log.path = Some(PathBuf::from(path));
        }

        for name in LimiterName::ALL {
            let settings = self.limits.get_mut(name);
            let upper = name.as_str().to_uppercase();
            if let Some(window_ms) = env
                .positive::<u64>(&format!("RATE_LIMIT_{}_WINDOW_MS", upper))
                .filter(|window_ms| LimitSettings::valid_window(*window_ms))
            {
                settings.window_ms = window_ms;
            }
            if let Some(max) = env.positive::<u32>(&format!("RATE_LIMIT_{}_MAX", upper)) {
                settings.max_requests = max;
            }
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case(PRODUCTION)
    }
}

/// Environment-style key/value overrides, read once.
pub struct EnvOverrides {
    values: config::Config,
}

impl EnvOverrides {
    /// Snapshot the process environment.
    pub fn from_process() -> Result<Self> {
        Self::build(config::Environment::default())
    }

    /// Use an explicit set of variables instead of the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        Self::build(config::Environment::default().source(Some(vars)))
    }

    fn build(source: config::Environment) -> Result<Self> {
        let values = config::Config::builder()
            .add_source(source)
            .build()
            .map_err(|e| GuardError::Config(format!("Failed to read environment: {}", e)))?;
        Ok(Self { values })
    }

    /// A non-blank string value.
    pub fn string(&self, key: &str) -> Option<String> {
        self.values
            .get_string(&key.to_lowercase())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// A value that parses and is greater than zero.
    pub fn positive<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr + PartialOrd + Default,
    {
        self.string(key)?
            .parse::<T>()
            .ok()
            .filter(|value| *value > T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimiterRegistry, RateLimiter};
    use std::sync::Arc;

    fn env(pairs: &[(&str, &str)]) -> EnvOverrides {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvOverrides::from_map(vars).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert!(config.store.url.is_none());
        assert_eq!(config.store.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.store.max_reconnect_attempts, 5);
        assert_eq!(config.sweep.interval(), Duration::from_secs(300));
        assert_eq!(config.sweep.max_age(), Duration::from_secs(600));
        assert_eq!(config.lockout.max_failed_attempts, 5);
        assert_eq!(config.lockout.lock_duration_secs, 1800);
        assert_eq!(config.limits.login.max_requests, 10);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
environment: production
store:
  url: redis://cache:6379
  command_timeout_ms: 250
limits:
  login:
    window_ms: 60000
    max_requests: 3
sweep:
  interval_secs: 30
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        assert!(config.is_production());
        assert_eq!(config.store.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store.command_timeout(), Duration::from_millis(250));
        assert_eq!(config.store.connect_timeout_ms, 5_000);
        assert_eq!(config.limits.login.window_ms, 60_000);
        assert_eq!(config.limits.login.max_requests, 3);
        assert_eq!(config.limits.register.max_requests, 5);
        assert_eq!(config.sweep.interval_secs, 30);
        assert_eq!(config.sweep.max_age_secs, 600);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = GuardConfig::from_yaml("store: [not, a, map]");
        assert!(matches!(result, Err(GuardError::Config(_))));
    }

    #[test]
    fn test_env_overrides_limits() {
        let mut config = GuardConfig::default();
        config.apply_env(&env(&[
            ("RATE_LIMIT_LOGIN_MAX", "20"),
            ("RATE_LIMIT_LOGIN_WINDOW_MS", "120000"),
            ("RATE_LIMIT_STRICT_MAX", "2"),
        ]));

        assert_eq!(config.limits.login.max_requests, 20);
        assert_eq!(config.limits.login.window_ms, 120_000);
        assert_eq!(config.limits.strict.max_requests, 2);
        assert_eq!(config.limits.api.max_requests, 60);
    }

    #[test]
    fn test_env_bad_values_fall_back_silently() {
        let mut config = GuardConfig::default();
        config.apply_env(&env(&[
            ("RATE_LIMIT_LOGIN_MAX", "0"),
            ("RATE_LIMIT_REGISTER_MAX", "-3"),
            ("RATE_LIMIT_API_WINDOW_MS", "soon"),
            ("RATE_LIMIT_AUTH_MAX", ""),
        ]));

        assert_eq!(config.limits.login.max_requests, 10);
        assert_eq!(config.limits.register.max_requests, 5);
        assert_eq!(config.limits.api.window_ms, 60_000);
        assert_eq!(config.limits.auth.max_requests, 10);
    }

    #[test]
    fn test_env_oversized_window_is_ignored() {
        let mut config = GuardConfig::default();
        config.apply_env(&env(&[(
            "RATE_LIMIT_LOGIN_WINDOW_MS",
            "18446744073709551615",
        )]));
        assert_eq!(config.limits.login.window_ms, 900_000);

        let limiter = Arc::new(RateLimiter::in_process());
        let registry = LimiterRegistry::new(&config.limits, limiter);
        let result = tokio_test::block_on(registry.login().check("1.2.3.4"));
        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
    }

    #[test]
    fn test_yaml_non_positive_limits_fall_back() {
        let yaml = r#"
limits:
  login:
    window_ms: 0
    max_requests: 0
  register:
    window_ms: 60000
    max_requests: 0
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limits.login, LimitSettings::new(900, 10));
        assert_eq!(config.limits.register, LimitSettings::new(60, 5));
    }

    #[test]
    fn test_env_store_and_environment() {
        let mut config = GuardConfig::default();
        config.apply_env(&env(&[
            ("REDIS_URL", "redis://localhost:6379"),
            ("APP_ENV", "production"),
            ("SECURITY_LOG_PATH", "/var/log/souq/security.jsonl"),
        ]));

        assert_eq!(config.store.url.as_deref(), Some("redis://localhost:6379"));
        assert!(config.is_production());
        assert_eq!(
            config.security_log.path,
            Some(PathBuf::from("/var/log/souq/security.jsonl"))
        );
    }

    #[test]
    fn test_env_blank_redis_url_is_absent() {
        let mut config = GuardConfig::default();
        config.apply_env(&env(&[("REDIS_URL", "  ")]));
        assert!(config.store.url.is_none());
    }
}
