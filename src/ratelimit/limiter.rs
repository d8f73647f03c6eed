//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::backend::{BackendError, CounterBackend};
use super::clock::{Clock, SystemClock};
use super::memory::InProcessBackend;
use super::window::{LimiterConfig, RateLimitResult, WindowSnapshot};

/// Sliding window rate limiter with a preferred backend and a process-local
/// fallback.
///
/// Every check tries the preferred backend first and falls back on any error.
/// There is no sticky "degraded" mode: the next check tries again.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Shared store, usually Redis; absent means process-local only
    preferred: Option<Arc<dyn CounterBackend>>,
    /// Always-available process-local store
    fallback: Arc<InProcessBackend>,
    clock: Arc<dyn Clock>,
    /// Timestamps older than this are dropped by sweeps
    sweep_max_age: Duration,
}

impl RateLimiter {
    /// Default bound applied by sweeps.
    pub const DEFAULT_SWEEP_MAX_AGE: Duration = Duration::from_secs(600);

    /// Create a rate limiter that only counts in this process.
    pub fn in_process() -> Self {
        Self::new(None, Arc::new(InProcessBackend::new()), Arc::new(SystemClock))
    }

    /// Create a rate limiter over the given backends.
    pub fn new(
        preferred: Option<Arc<dyn CounterBackend>>,
        fallback: Arc<InProcessBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            preferred,
            fallback,
            clock,
            sweep_max_age: Self::DEFAULT_SWEEP_MAX_AGE,
        }
    }

    /// Set the age bound used by [`RateLimiter::sweep`].
    pub fn with_sweep_max_age(mut self, max_age: Duration) -> Self {
        self.sweep_max_age = max_age;
        self
    }

    /// Check the rate limit for `identifier` and record the request if allowed.
    pub async fn check(&self, identifier: &str, config: &LimiterConfig) -> RateLimitResult {
        let now_ms = self.clock.now_ms();

        trace!(
            limiter = %config.key_prefix,
            identifier = %identifier,
            window_start_ms = now_ms.saturating_sub(config.window_ms),
            "Checking rate limit"
        );

        let snapshot = match self.try_preferred(identifier, config, now_ms).await {
            Some(snapshot) => snapshot,
            None => self.fallback.record_local(config, identifier, now_ms),
        };

        let result = RateLimitResult::from_snapshot(snapshot, config, now_ms);
        if !result.allowed {
            debug!(
                limiter = %config.key_prefix,
                identifier = %identifier,
                retry_after_secs = ?result.retry_after_secs,
                "Rate limit exceeded"
            );
        }
        result
    }

    async fn try_preferred(
        &self,
        identifier: &str,
        config: &LimiterConfig,
        now_ms: u64,
    ) -> Option<WindowSnapshot> {
        let backend = self.preferred.as_ref()?;
        match backend.record(config, identifier, now_ms).await {
            Ok(snapshot) => Some(snapshot),
            Err(BackendError::Unavailable(reason)) => {
                trace!(backend = backend.name(), reason, "Preferred backend unavailable, counting locally");
                None
            }
            Err(e) => {
                warn!(
                    backend = backend.name(),
                    limiter = %config.key_prefix,
                    error = %e,
                    "Rate limit check failed, counting locally"
                );
                None
            }
        }
    }

    /// Clear all state for `identifier`.
    ///
    /// The local entry is always removed; the shared one is best effort.
    pub async fn reset(&self, identifier: &str, config: &LimiterConfig) {
        self.fallback.clear_local(&config.key_prefix, identifier);

        if let Some(backend) = &self.preferred {
            match backend.clear(config, identifier).await {
                Ok(()) => {}
                Err(BackendError::Unavailable(_)) => {}
                Err(e) => warn!(
                    backend = backend.name(),
                    limiter = %config.key_prefix,
                    error = %e,
                    "Failed to clear shared rate limit state"
                ),
            }
        }

        debug!(limiter = %config.key_prefix, identifier = %identifier, "Rate limit state reset");
    }

    /// Drop stale local entries now. Returns the number of identifiers removed.
    pub fn sweep(&self) -> usize {
        self.fallback.sweep(self.clock.now_ms(), self.sweep_max_age)
    }

    /// Run [`RateLimiter::sweep`] every `interval` on the tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    info!(
                        removed,
                        remaining = limiter.fallback.total_identifiers(),
                        "Rate limiter sweep completed"
                    );
                }
            }
        })
    }

    /// The process-local store.
    pub fn local_store(&self) -> &Arc<InProcessBackend> {
        &self.fallback
    }

    /// Whether a shared backend is configured.
    pub fn has_shared_backend(&self) -> bool {
        self.preferred.is_some()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::in_process()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::distributed::DistributedBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START_MS: u64 = 1_700_000_000_000;

    /// Backend that always fails with a store error and counts calls.
    #[derive(Default)]
    struct BrokenBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn record(
            &self,
            _config: &LimiterConfig,
            _identifier: &str,
            _now_ms: u64,
        ) -> Result<WindowSnapshot, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::MalformedReply("garbage".to_string()))
        }

        async fn clear(&self, _config: &LimiterConfig, _identifier: &str) -> Result<(), BackendError> {
            Err(BackendError::Timeout("DEL"))
        }
    }

    fn limiter_with_clock(preferred: Option<Arc<dyn CounterBackend>>) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let limiter = RateLimiter::new(preferred, Arc::new(InProcessBackend::new()), clock.clone());
        (limiter, clock)
    }

    fn login_config() -> LimiterConfig {
        LimiterConfig::new("login", Duration::from_millis(900_000), 10)
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let (limiter, clock) = limiter_with_clock(None);
        let config = login_config();

        for expected_remaining in (0..10).rev() {
            let result = limiter.check("1.2.3.4", &config).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
            assert_eq!(result.limit, 10);
            clock.advance(Duration::from_secs(1));
        }

        let denied = limiter.check("1.2.3.4", &config).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        let retry_after = denied.retry_after_secs.unwrap();
        assert!(retry_after > 0 && retry_after <= 900);
    }

    #[tokio::test]
    async fn test_recovers_after_reset_at() {
        let (limiter, clock) = limiter_with_clock(None);
        let config = LimiterConfig::new("strict", Duration::from_secs(60), 5);

        for _ in 0..5 {
            assert!(limiter.check("9.9.9.9", &config).await.allowed);
            clock.advance(Duration::from_millis(100));
        }
        let denied = limiter.check("9.9.9.9", &config).await;
        assert!(!denied.allowed);

        clock.set(denied.reset_at_ms.unwrap());
        let result = limiter.check("9.9.9.9", &config).await;
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_denied_checks_are_not_recorded() {
        let (limiter, clock) = limiter_with_clock(None);
        let config = LimiterConfig::new("register", Duration::from_secs(10), 1);

        assert!(limiter.check("a", &config).await.allowed);
        for _ in 0..5 {
            clock.advance(Duration::from_secs(1));
            assert!(!limiter.check("a", &config).await.allowed);
        }

        // Only the first request occupies the window
        clock.set(START_MS + 10_000);
        assert!(limiter.check("a", &config).await.allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (limiter, _clock) = limiter_with_clock(None);
        let config = LimiterConfig::new("auth", Duration::from_secs(60), 2);

        limiter.check("a", &config).await;
        limiter.check("a", &config).await;
        assert!(!limiter.check("a", &config).await.allowed);

        let other = limiter.check("b", &config).await;
        assert!(other.allowed);
        assert_eq!(other.remaining, 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::in_process());
        let config = Arc::new(LimiterConfig::new("api", Duration::from_secs(60), 25));

        let mut handles = Vec::new();
        for i in 0..100 {
            let limiter = limiter.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let identifier = if i % 2 == 0 { "even" } else { "odd" };
                (identifier, limiter.check(identifier, &config).await.allowed)
            }));
        }

        let mut even = 0;
        let mut odd = 0;
        for handle in handles {
            let (identifier, allowed) = handle.await.unwrap();
            if allowed {
                match identifier {
                    "even" => even += 1,
                    _ => odd += 1,
                }
            }
        }
        assert_eq!(even, 25);
        assert_eq!(odd, 25);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let (limiter, _clock) = limiter_with_clock(None);
        let config = LimiterConfig::new("strict", Duration::from_secs(60), 5);

        for _ in 0..5 {
            limiter.check("1.2.3.4", &config).await;
        }
        assert!(!limiter.check("1.2.3.4", &config).await.allowed);

        limiter.reset("1.2.3.4", &config).await;
        let result = limiter.check("1.2.3.4", &config).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_falls_back_on_every_failed_check() {
        let broken = Arc::new(BrokenBackend::default());
        let (limiter, _clock) = limiter_with_clock(Some(broken.clone() as Arc<dyn CounterBackend>));
        let config = LimiterConfig::new("login", Duration::from_secs(60), 3);

        for _ in 0..3 {
            assert!(limiter.check("1.2.3.4", &config).await.allowed);
        }
        assert!(!limiter.check("1.2.3.4", &config).await.allowed);

        // Each check tried the preferred backend again
        assert_eq!(broken.calls.load(Ordering::SeqCst), 4);
        assert_eq!(limiter.local_store().identifier_count("login"), 1);
    }

    #[tokio::test]
    async fn test_reset_succeeds_when_shared_store_fails() {
        let (limiter, _clock) = limiter_with_clock(Some(Arc::new(BrokenBackend::default()) as Arc<dyn CounterBackend>));
        let config = LimiterConfig::new("login", Duration::from_secs(60), 1);

        limiter.check("1.2.3.4", &config).await;
        limiter.reset("1.2.3.4", &config).await;
        assert!(limiter.check("1.2.3.4", &config).await.allowed);
    }

    #[tokio::test]
    async fn test_fallback_equivalence_with_unconfigured_store() {
        let store = DistributedBackend::new(&crate::config::StoreConfig::default()).unwrap();
        let (limiter, clock) = limiter_with_clock(Some(Arc::new(store) as Arc<dyn CounterBackend>));
        let config = LimiterConfig::new("register", Duration::from_secs(300), 5);

        for _ in 0..5 {
            assert!(limiter.check("5.6.7.8", &config).await.allowed);
        }
        let denied = limiter.check("5.6.7.8", &config).await;
        assert!(!denied.allowed);

        clock.set(denied.reset_at_ms.unwrap());
        assert!(limiter.check("5.6.7.8", &config).await.allowed);
    }

    #[tokio::test]
    async fn test_sweep_uses_clock() {
        let (limiter, clock) = limiter_with_clock(None);
        let config = LimiterConfig::new("api", Duration::from_secs(60), 10);

        for i in 0..1000 {
            limiter.check(&format!("id-{}", i), &config).await;
        }
        assert_eq!(limiter.local_store().identifier_count("api"), 1000);

        clock.advance(Duration::from_secs(11 * 60));
        assert_eq!(limiter.sweep(), 1000);
        assert_eq!(limiter.local_store().total_identifiers(), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_full_login_window() {
        let (limiter, clock) = limiter_with_clock(None);
        let config = login_config();

        for _ in 0..10 {
            assert!(limiter.check("1.2.3.4", &config).await.allowed);
        }
        assert!(!limiter.check("1.2.3.4", &config).await.allowed);

        // Past the sweep age, still inside the 15 minute window
        clock.advance(Duration::from_secs(11 * 60));
        assert_eq!(limiter.sweep(), 0);
        assert!(!limiter.check("1.2.3.4", &config).await.allowed);

        clock.advance(Duration::from_secs(4 * 60));
        assert!(limiter.check("1.2.3.4", &config).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let limiter = Arc::new(RateLimiter::new(
            None,
            Arc::new(InProcessBackend::new()),
            clock.clone(),
        ));
        let config = LimiterConfig::new("api", Duration::from_secs(60), 10);
        limiter.check("stale", &config).await;
        clock.advance(Duration::from_secs(11 * 60));

        let handle = limiter.spawn_sweeper(Duration::from_secs(300));
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(limiter.local_store().total_identifiers(), 0);
        handle.abort();
    }
}
