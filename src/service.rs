//! Wiring of the guard components.
//!
//! [`GuardService`] owns the shared counter store connection, the in-process
//! fallback with its sweeper, the named limiters and the security logger.
//! Request handlers borrow what they need from it.

use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::GuardConfig;
use crate::error::Result;
use crate::ratelimit::{
    Clock, CounterBackend, DistributedBackend, InProcessBackend, LimiterRegistry, RateLimiter,
    SystemClock,
};
use crate::security::{
    AccountLockoutPolicy, InMemoryLoginStateStore, JsonlSecurityLogStore, LoginGuard,
    LoginStateStore, MemorySecurityLogStore, RegistrationGuard, SecurityLogStore, SecurityLogger,
};

static IN_PROCESS_NOTICE: Once = Once::new();

/// The assembled guard.
pub struct GuardService {
    config: GuardConfig,
    distributed: Option<Arc<DistributedBackend>>,
    limiter: Arc<RateLimiter>,
    registry: LimiterRegistry,
    logger: SecurityLogger,
    policy: AccountLockoutPolicy,
    login_state: Arc<dyn LoginStateStore>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl GuardService {
    /// Build every component from `config` and start the sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: GuardConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: GuardConfig) -> GuardServiceBuilder {
        GuardServiceBuilder {
            config,
            clock: None,
            login_state: None,
            log_store: None,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn registry(&self) -> &LimiterRegistry {
        &self.registry
    }

    pub fn logger(&self) -> &SecurityLogger {
        &self.logger
    }

    /// The shared counter store, when one is configured.
    pub fn distributed(&self) -> Option<&Arc<DistributedBackend>> {
        self.distributed.as_ref()
    }

    pub fn login_guard(&self) -> LoginGuard {
        LoginGuard::new(
            self.registry.login().clone(),
            self.policy,
            self.login_state.clone(),
            self.logger.clone(),
            self.clock.clone(),
        )
    }

    pub fn registration_guard(&self) -> RegistrationGuard {
        RegistrationGuard::new(self.registry.register().clone(), self.logger.clone())
    }

    /// Stop the sweeper and close the shared store connection.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        if let Some(distributed) = &self.distributed {
            distributed.close();
        }
        info!("Guard service stopped");
    }
}

impl std::fmt::Debug for GuardService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardService")
            .field("environment", &self.config.environment)
            .field("distributed", &self.distributed.is_some())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GuardService`] with replaceable collaborators.
pub struct GuardServiceBuilder {
    config: GuardConfig,
    clock: Option<Arc<dyn Clock>>,
    login_state: Option<Arc<dyn LoginStateStore>>,
    log_store: Option<Arc<dyn SecurityLogStore>>,
}

impl GuardServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist lockout state somewhere other than process memory.
    pub fn login_state(mut self, store: Arc<dyn LoginStateStore>) -> Self {
        self.login_state = Some(store);
        self
    }

    /// Send security events somewhere other than the configured store.
    pub fn log_store(mut self, store: Arc<dyn SecurityLogStore>) -> Self {
        self.log_store = Some(store);
        self
    }

    pub fn build(self) -> Result<GuardService> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let distributed = if config.store.url.is_some() {
            Some(Arc::new(DistributedBackend::new(&config.store)?))
        } else {
            if !config.is_production() {
                IN_PROCESS_NOTICE.call_once(|| {
                    info!(
                        environment = %config.environment,
                        "REDIS_URL not set, rate limits are counted in this process only"
                    );
                });
            }
            None
        };

        let preferred = distributed
            .clone()
            .map(|backend| backend as Arc<dyn CounterBackend>);
        let limiter = Arc::new(
            RateLimiter::new(preferred, Arc::new(InProcessBackend::new()), clock.clone())
                .with_sweep_max_age(config.sweep.max_age()),
        );
        let sweeper = limiter.spawn_sweeper(config.sweep.interval());
        let registry = LimiterRegistry::new(&config.limits, limiter.clone());

        let log_store = match (self.log_store, &config.security_log.path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                info!(path = %path.display(), "Writing security events to file");
                Arc::new(JsonlSecurityLogStore::new(path.clone())) as Arc<dyn SecurityLogStore>
            }
            (None, None) => Arc::new(MemorySecurityLogStore::new()) as Arc<dyn SecurityLogStore>,
        };
        let login_state = self
            .login_state
            .unwrap_or_else(|| Arc::new(InMemoryLoginStateStore::new()));

        info!(
            environment = %config.environment,
            distributed = distributed.is_some(),
            "Guard service started"
        );

        Ok(GuardService {
            policy: AccountLockoutPolicy::from_config(&config.lockout),
            config,
            distributed,
            limiter,
            registry,
            logger: SecurityLogger::new(log_store),
            login_state,
            clock,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }
}
