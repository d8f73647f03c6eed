//! Client identifiers for rate limiting.

use http::HeaderMap;

/// Address used when no proxy header names the client.
pub const LOOPBACK: &str = "127.0.0.1";

/// Client IP as reported by the fronting proxy.
///
/// Takes the first entry of `x-forwarded-for`, then `x-real-ip`, then falls
/// back to the loopback address.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or(LOOPBACK)
        .to_string()
}

/// Rate limit key for a client, optionally narrowed to one account.
pub fn rate_limit_identifier(ip: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user_id) => format!("{}:{}", ip, user_id),
        None => ip.to_string(),
    }
}

/// The `user-agent` header, if present and readable.
pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}
