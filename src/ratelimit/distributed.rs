//! Distributed sliding window counters in Redis.
//!
//! Each window is a sorted set scored by request time. Trimming, counting and
//! inserting run in one server-side script so two concurrent requests for the
//! same identifier can never both see room in a full window.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use parking_lot::Mutex;
use redis::Script;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::backend::{BackendError, CounterBackend};
use super::window::{LimiterConfig, WindowSnapshot};
use crate::config::StoreConfig;
use crate::error::{GuardError, Result};

/// KEYS[1] window key; ARGV now_ms, window_ms, max_requests, member.
/// Returns {admitted, count_before, oldest_score or -1}.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
    admitted = 1
end

local oldest = -1
local head = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if head[2] then
    oldest = math.floor(tonumber(head[2]))
end

return {admitted, count, oldest}
"#;

/// Bounded reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures after which no further connects are attempted
    pub max_attempts: u32,
    /// Delay added per failure
    pub step: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            step: Duration::from_millis(200),
            max_delay: Duration::from_millis(2_000),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            step: Duration::from_millis(config.reconnect_step_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
        }
    }

    /// Wait before the connect that follows `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.step.saturating_mul(failures).min(self.max_delay)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[derive(Default)]
struct ConnectionState {
    connection: Option<MultiplexedConnection>,
    failures: u32,
    retry_at: Option<Instant>,
    /// A connect is in flight; other callers fall back instead of waiting
    connecting: bool,
}

/// Clears `connecting` if a connect future is dropped before it completes.
struct ConnectAttempt<'a> {
    state: &'a Mutex<ConnectionState>,
    armed: bool,
}

impl ConnectAttempt<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().connecting = false;
        }
    }
}

/// Counter backend over a shared, lazily opened Redis connection.
pub struct DistributedBackend {
    client: Option<redis::Client>,
    state: Mutex<ConnectionState>,
    script: Script,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl DistributedBackend {
    /// Create a backend from the store configuration.
    ///
    /// No connection is opened here. Without a URL the backend reports itself
    /// unavailable on every call.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = match config.url.as_deref() {
            Some(url) => Some(redis::Client::open(url).map_err(|e| {
                GuardError::Config(format!("Invalid counter store URL: {}", e))
            })?),
            None => None,
        };

        Ok(Self {
            client,
            state: Mutex::new(ConnectionState::default()),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            policy: ReconnectPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        })
    }

    /// Whether a connection string was configured.
    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    /// Consecutive failed connects so far.
    pub fn failed_attempts(&self) -> u32 {
        self.state.lock().failures
    }

    /// Get the shared connection, opening it if allowed.
    ///
    /// The state lock is never held across the connect itself: while one
    /// caller connects, the others are told the store is unavailable.
    async fn connection(&self) -> std::result::Result<MultiplexedConnection, BackendError> {
        let client = self
            .client
            .as_ref()
            .ok_or(BackendError::Unavailable("no connection string configured"))?;

        let mut attempt = {
            let mut state = self.state.lock();
            if let Some(connection) = &state.connection {
                return Ok(connection.clone());
            }
            if self.policy.exhausted(state.failures) {
                return Err(BackendError::Unavailable("reconnect attempts exhausted"));
            }
            if let Some(retry_at) = state.retry_at {
                if Instant::now() < retry_at {
                    return Err(BackendError::Unavailable("waiting to reconnect"));
                }
            }
            if state.connecting {
                return Err(BackendError::Unavailable("connect in progress"));
            }
            state.connecting = true;
            ConnectAttempt {
                state: &self.state,
                armed: true,
            }
        };

        let outcome = timeout(self.connect_timeout, client.get_multiplexed_async_connection()).await;

        attempt.disarm();
        let mut state = self.state.lock();
        state.connecting = false;

        match outcome {
            Ok(Ok(connection)) => {
                if state.failures > 0 {
                    info!(failures = state.failures, "Reconnected to counter store");
                } else {
                    debug!("Connected to counter store");
                }
                state.failures = 0;
                state.retry_at = None;
                state.connection = Some(connection.clone());
                Ok(connection)
            }
            Ok(Err(e)) => {
                self.note_failure(&mut state);
                Err(BackendError::Redis(e))
            }
            Err(_) => {
                self.note_failure(&mut state);
                Err(BackendError::Timeout("connect"))
            }
        }
    }

    fn note_failure(&self, state: &mut ConnectionState) {
        state.failures += 1;
        if self.policy.exhausted(state.failures) {
            state.retry_at = None;
            warn!(
                failures = state.failures,
                "Counter store unreachable, giving up; rate limits stay process-local"
            );
        } else {
            let delay = self.policy.delay_after(state.failures);
            state.retry_at = Some(Instant::now() + delay);
            debug!(
                failures = state.failures,
                retry_in_ms = delay.as_millis() as u64,
                "Counter store connect failed"
            );
        }
    }

    /// Forget the cached connection after a connection-level error.
    fn discard_connection(&self, error: &redis::RedisError) {
        if error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal() {
            self.state.lock().connection = None;
        }
    }

    /// Round-trip a PING, for operators checking connectivity.
    pub async fn ping(&self) -> std::result::Result<(), BackendError> {
        let mut connection = self.connection().await?;
        let reply: redis::RedisResult<String> =
            match timeout(self.command_timeout, redis::cmd("PING").query_async(&mut connection)).await {
                Ok(reply) => reply,
                Err(_) => return Err(BackendError::Timeout("ping")),
            };
        if let Err(e) = &reply {
            self.discard_connection(e);
        }
        reply?;
        Ok(())
    }

    /// Drop the connection. Later calls reconnect lazily.
    pub fn close(&self) {
        if self.state.lock().connection.take().is_some() {
            debug!("Closed counter store connection");
        }
    }
}

/// Sorted-set member for a request at `now_ms`.
fn window_member(now_ms: u64) -> String {
    format!("{}-{:016x}", now_ms, rand::random::<u64>())
}

fn parse_reply(reply: &[i64]) -> std::result::Result<WindowSnapshot, BackendError> {
    match reply {
        [admitted, count, oldest] if *count >= 0 => Ok(WindowSnapshot {
            admitted: *admitted == 1,
            count: *count as u32,
            oldest_ms: (*oldest >= 0).then_some(*oldest as u64),
        }),
        other => Err(BackendError::MalformedReply(format!("{:?}", other))),
    }
}

#[async_trait]
impl CounterBackend for DistributedBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn record(
        &self,
        config: &LimiterConfig,
        identifier: &str,
        now_ms: u64,
    ) -> std::result::Result<WindowSnapshot, BackendError> {
        let mut connection = self.connection().await?;
        let key = config.redis_key(identifier);

        trace!(key = %key, now_ms, "Recording request in counter store");

        let mut invocation = self.script.key(&key);
        invocation
            .arg(now_ms)
            .arg(config.window_ms)
            .arg(config.max_requests)
            .arg(window_member(now_ms));

        let reply: redis::RedisResult<Vec<i64>> =
            match timeout(self.command_timeout, invocation.invoke_async(&mut connection)).await {
                Ok(reply) => reply,
                Err(_) => return Err(BackendError::Timeout("sliding window script")),
            };

        match reply {
            Ok(values) => parse_reply(&values),
            Err(e) => {
                self.discard_connection(&e);
                Err(BackendError::Redis(e))
            }
        }
    }

    async fn clear(&self, config: &LimiterConfig, identifier: &str) -> std::result::Result<(), BackendError> {
        let mut connection = self.connection().await?;
        let key = config.redis_key(identifier);

        let reply: redis::RedisResult<i64> =
            match timeout(self.command_timeout, redis::cmd("DEL").arg(&key).query_async(&mut connection)).await {
                Ok(reply) => reply,
                Err(_) => return Err(BackendError::Timeout("DEL")),
            };

        match reply {
            Ok(_) => Ok(()),
            Err(e) => {
                self.discard_connection(&e);
                Err(BackendError::Redis(e))
            }
        }
    }
}
