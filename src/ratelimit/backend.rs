//! Counter backend trait for abstracting distributed and in-process storage.

use async_trait::async_trait;
use thiserror::Error;

use super::window::{LimiterConfig, WindowSnapshot};

/// Errors a counter backend can report.
///
/// None of these reach callers of the limiter; they decide whether a check
/// falls back to the in-process store.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No client configured, or the reconnect budget is spent
    #[error("Counter store unavailable: {0}")]
    Unavailable(&'static str),

    /// Connect or command took longer than allowed
    #[error("Counter store timed out during {0}")]
    Timeout(&'static str),

    /// The store answered with an error
    #[error("Counter store error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store answered with something other than the expected shape
    #[error("Malformed counter store reply: {0}")]
    MalformedReply(String),
}

/// Trait for sliding window counter storage.
///
/// Implemented by the Redis-backed `DistributedBackend` and the process-local
/// `InProcessBackend`, so the limiter can try one and fall back to the other.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Expire old entries for `identifier`, then record a request at `now_ms`
    /// if the window has room.
    async fn record(
        &self,
        config: &LimiterConfig,
        identifier: &str,
        now_ms: u64,
    ) -> Result<WindowSnapshot, BackendError>;

    /// Forget every entry recorded for `identifier`.
    async fn clear(&self, config: &LimiterConfig, identifier: &str) -> Result<(), BackendError>;
}
