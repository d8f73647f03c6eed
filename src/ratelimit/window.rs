//! Sliding window types shared by every counter backend.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static configuration of one limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Width of the sliding window in milliseconds
    pub window_ms: u64,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Namespace for this limiter's counters
    pub key_prefix: String,
}

impl LimiterConfig {
    pub fn new(key_prefix: impl Into<String>, window: Duration, max_requests: u32) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
            key_prefix: key_prefix.into(),
        }
    }

    /// Get the duration of the window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Key of the sorted set holding `identifier`'s window.
    pub fn redis_key(&self, identifier: &str) -> String {
        format!("ratelimit:{}:{}", self.key_prefix, identifier)
    }
}

/// What a backend observed while recording one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Whether the request was admitted and recorded
    pub admitted: bool,
    /// Entries in the window before this request
    pub count: u32,
    /// Timestamp of the oldest entry still in the window, after this request
    pub oldest_ms: Option<u64>,
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// Seconds until a retry can succeed, set only on deny
    pub retry_after_secs: Option<u32>,
    /// When the oldest entry leaves the window
    pub reset_at_ms: Option<u64>,
}

impl RateLimitResult {
    /// Build a result from what a backend recorded at `now_ms`.
    pub fn from_snapshot(snapshot: WindowSnapshot, config: &LimiterConfig, now_ms: u64) -> Self {
        let reset_at_ms = snapshot
            .oldest_ms
            .map(|oldest| oldest.saturating_add(config.window_ms));

        if snapshot.admitted {
            return Self {
                allowed: true,
                remaining: config
                    .max_requests
                    .saturating_sub(snapshot.count)
                    .saturating_sub(1),
                limit: config.max_requests,
                retry_after_secs: None,
                reset_at_ms: reset_at_ms.or(Some(now_ms.saturating_add(config.window_ms))),
            };
        }

        let oldest = snapshot.oldest_ms.unwrap_or(now_ms);
        Self {
            allowed: false,
            remaining: 0,
            limit: config.max_requests,
            retry_after_secs: Some(retry_after_secs(oldest, config.window_ms, now_ms)),
            reset_at_ms: Some(oldest.saturating_add(config.window_ms)),
        }
    }
}

/// Whole seconds until `oldest_ms` leaves the window, never less than one.
pub fn retry_after_secs(oldest_ms: u64, window_ms: u64, now_ms: u64) -> u32 {
    let wait_ms = oldest_ms.saturating_add(window_ms).saturating_sub(now_ms);
    wait_ms.div_ceil(1000).clamp(1, u32::MAX as u64) as u32
}

/// Apply one request to an in-memory window.
///
/// Drops timestamps that have left the window, then records `now_ms` only if
/// the window still has room.
pub fn admit(timestamps: &mut Vec<u64>, config: &LimiterConfig, now_ms: u64) -> WindowSnapshot {
    timestamps.retain(|&ts| now_ms.saturating_sub(ts) < config.window_ms);

    let count = timestamps.len() as u32;
    let admitted = count < config.max_requests;
    if admitted {
        timestamps.push(now_ms);
    }

    WindowSnapshot {
        admitted,
        count,
        oldest_ms: timestamps.iter().copied().min(),
    }
}
