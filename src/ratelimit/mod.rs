//! Sliding window rate limiting with a shared store and a local fallback.

mod backend;
mod clock;
mod distributed;
mod identifier;
mod limiter;
mod memory;
mod registry;
mod window;

pub use backend::{BackendError, CounterBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedBackend, ReconnectPolicy};
pub use identifier::{client_ip, rate_limit_identifier, user_agent, LOOPBACK};
pub use limiter::RateLimiter;
pub use memory::InProcessBackend;
pub use registry::{
    LimitSettings, LimiterName, LimiterRegistry, LimiterRegistryConfig, NamedLimiter, MAX_WINDOW_MS,
};
pub use window::{retry_after_secs, LimiterConfig, RateLimitResult, WindowSnapshot};
