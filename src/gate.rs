//! Rate limit gate for request handlers.
//!
//! Handlers call [`check_rate_limit`] before doing any work. On pass they copy
//! the limit headers onto their own response; on reject they return the
//! prepared 429 as is.

use http::header::{HeaderName, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::ratelimit::{client_ip, rate_limit_identifier, user_agent, NamedLimiter};
use crate::security::{SecurityEvent, SecurityEventType, SecurityLogger};

/// Machine-readable error code in the 429 body.
pub const RATE_LIMIT_ERROR: &str = "rateLimit.exceeded";

pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Per-call options for [`check_rate_limit`].
#[derive(Debug, Default, Clone)]
pub struct CheckOptions<'a> {
    /// Narrow the bucket to one account: `"{ip}:{user_id}"`
    pub user_id: Option<&'a str>,
    /// Where to record rejections
    pub logger: Option<&'a SecurityLogger>,
    /// Replaces the default rejection message
    pub message: Option<String>,
}

/// A request that passed the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    pub limit: u32,
    pub remaining: u32,
}

impl PassResult {
    /// Write `X-RateLimit-Limit` and `X-RateLimit-Remaining`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(self.remaining));
    }
}

/// A request the limiter turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub limit: u32,
    pub retry_after_secs: u32,
    pub message: String,
}

impl RateLimitRejection {
    pub fn body(&self) -> serde_json::Value {
        json!({
            "success": false,
            "error": RATE_LIMIT_ERROR,
            "message": self.message,
            "retryAfter": self.retry_after_secs,
        })
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from_static("0"));
        headers
    }

    /// The ready-to-send 429 response.
    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body().to_string());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        *response.headers_mut() = self.headers();
        response
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Pass(PassResult),
    Reject(RateLimitRejection),
}

impl GateDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateDecision::Pass(_))
    }
}

fn default_message(retry_after_secs: u32) -> String {
    format!(
        "Too many requests. Please try again in {} seconds.",
        retry_after_secs
    )
}

/// Check `limiter` for the client behind `headers`.
pub async fn check_rate_limit(
    headers: &HeaderMap,
    limiter: &NamedLimiter,
    options: CheckOptions<'_>,
) -> GateDecision {
    let ip = client_ip(headers);
    let identifier = rate_limit_identifier(&ip, options.user_id);
    let result = limiter.check(&identifier).await;

    if result.allowed {
        return GateDecision::Pass(PassResult {
            limit: result.limit,
            remaining: result.remaining,
        });
    }

    let retry_after_secs = result.retry_after_secs.unwrap_or(1);
    debug!(
        limiter = %limiter.name(),
        identifier = %identifier,
        retry_after_secs,
        "Rejecting rate limited request"
    );

    if let Some(logger) = options.logger {
        let mut event = SecurityEvent::new(SecurityEventType::RateLimitExceeded, ip.clone())
            .user_agent(user_agent(headers))
            .metadata(json!({
                "limiter": limiter.name().as_str(),
                "identifier": identifier,
                "limit": result.limit,
                "retryAfter": retry_after_secs,
            }));
        if let Some(user_id) = options.user_id {
            event = event.user(user_id);
        }
        logger.log(event).await;
    }

    GateDecision::Reject(RateLimitRejection {
        limit: result.limit,
        retry_after_secs,
        message: options
            .message
            .unwrap_or_else(|| default_message(retry_after_secs)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimiterConfig, LimiterName, RateLimiter};
    use crate::security::MemorySecurityLogStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter(max: u32) -> NamedLimiter {
        NamedLimiter::new(
            LimiterName::Login,
            LimiterConfig::new("login", Duration::from_secs(900), max),
            Arc::new(RateLimiter::in_process()),
        )
    }

    fn request_from(ip: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(ip));
        headers.insert("user-agent", HeaderValue::from_static("test-agent"));
        headers
    }

    #[tokio::test]
    async fn test_pass_then_reject() {
        let limiter = limiter(2);
        let headers = request_from("1.2.3.4");

        let first = check_rate_limit(&headers, &limiter, CheckOptions::default()).await;
        assert_eq!(first, GateDecision::Pass(PassResult { limit: 2, remaining: 1 }));
        check_rate_limit(&headers, &limiter, CheckOptions::default()).await;

        match check_rate_limit(&headers, &limiter, CheckOptions::default()).await {
            GateDecision::Reject(rejection) => {
                assert_eq!(rejection.limit, 2);
                assert!(rejection.retry_after_secs >= 1 && rejection.retry_after_secs <= 900);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_id_narrows_bucket() {
        let limiter = limiter(1);
        let headers = request_from("1.2.3.4");

        let alice = CheckOptions {
            user_id: Some("alice"),
            ..CheckOptions::default()
        };
        let bob = CheckOptions {
            user_id: Some("bob"),
            ..CheckOptions::default()
        };

        assert!(check_rate_limit(&headers, &limiter, alice.clone()).await.is_pass());
        assert!(!check_rate_limit(&headers, &limiter, alice).await.is_pass());
        assert!(check_rate_limit(&headers, &limiter, bob).await.is_pass());
    }

    #[tokio::test]
    async fn test_rejection_is_logged() {
        let limiter = limiter(1);
        let headers = request_from("5.6.7.8");
        let store = Arc::new(MemorySecurityLogStore::new());
        let logger = SecurityLogger::new(store.clone());
        let options = CheckOptions {
            logger: Some(&logger),
            ..CheckOptions::default()
        };

        check_rate_limit(&headers, &limiter, options.clone()).await;
        assert!(store.entries().is_empty());

        check_rate_limit(&headers, &limiter, options).await;
        let entries = store.entries_of(SecurityEventType::RateLimitExceeded);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip, "5.6.7.8");
        assert_eq!(entries[0].user_agent.as_deref(), Some("test-agent"));
        assert_eq!(entries[0].metadata["limiter"], "login");
    }

    #[test]
    fn test_rejection_response_shape() {
        let rejection = RateLimitRejection {
            limit: 10,
            retry_after_secs: 42,
            message: default_message(42),
        };
        let response = rejection.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["content-type"], "application/json");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "rateLimit.exceeded");
        assert_eq!(body["retryAfter"], 42);
        assert_eq!(body["message"], "Too many requests. Please try again in 42 seconds.");
    }

    #[tokio::test]
    async fn test_custom_message() {
        let limiter = limiter(0);
        let options = CheckOptions {
            message: Some("Slow down".to_string()),
            ..CheckOptions::default()
        };

        match check_rate_limit(&HeaderMap::new(), &limiter, options).await {
            GateDecision::Reject(rejection) => assert_eq!(rejection.message, "Slow down"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_pass_headers() {
        let mut headers = HeaderMap::new();
        PassResult { limit: 60, remaining: 59 }.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-limit"], "60");
        assert_eq!(headers["x-ratelimit-remaining"], "59");
    }
}
