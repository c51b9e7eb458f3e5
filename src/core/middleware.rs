//! HTTP middleware: administrator authentication and per-IP rate limiting.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, Uri},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter as Governor,
};
use nonzero_ext::nonzero;
use std::sync::Arc;

use crate::api::handlers::AppState;
use crate::core::error::AppError;

// ============================================================================
// Administrator authentication
// ============================================================================

/// Extract the bearer token from `Authorization`, `x-api-key`, or `?token=`.
pub fn extract_token<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    uri.query().and_then(|q| {
        q.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .filter(|t| !t.is_empty())
                .map(|t| t.to_string())
        })
    })
}

/// Require a valid administrator key on the request.
///
/// Looks the token up in the repository; applies to both the proxy endpoints
/// and the admin surface.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(request.headers(), request.uri())
        .ok_or(AppError::Unauthorized)?;

    match state.db.find_admin_key(&token).await {
        Ok(Some(_)) => Ok(next.run(request).await),
        Ok(None) => Err(AppError::Unauthorized),
        Err(e) => {
            tracing::error!("admin key lookup failed: {}", e);
            Err(AppError::Unauthorized)
        }
    }
}

// ============================================================================
// Per-IP rate limiting
// ============================================================================

/// Keyed token-bucket limiter over client IPs.
pub struct IpRateLimiter {
    limiter: Governor<String, DefaultKeyedStateStore<String>, DefaultClock>,
}

impl IpRateLimiter {
    /// Default policy: 10 requests per second with a burst of 20.
    pub fn new() -> Self {
        let quota = Quota::per_second(nonzero!(10u32)).allow_burst(nonzero!(20u32));
        Self {
            limiter: Governor::keyed(quota),
        }
    }

    pub fn check(&self, ip: &str) -> Result<(), AppError> {
        // Bound the key table; idle IPs age out of the store
        if self.limiter.len() > 10_000 {
            self.limiter.retain_recent();
        }
        self.limiter
            .check_key(&ip.to_string())
            .map_err(|_| AppError::RateLimited)
    }
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject requests over the per-IP budget with 429 `rate_limit_error`.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(request.headers());
    if let Err(e) = state.rate_limiter.check(&ip) {
        tracing::warn!(ip = %ip, "rate limit exceeded");
        return Err(e);
    }
    Ok(next.run(request).await)
}

/// Best-effort client IP: `X-Forwarded-For` (first hop), then `X-Real-IP`.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = xff.split(',').next().unwrap_or(xff).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = xri.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    "unknown".to_string()
}

/// User-Agent header value, empty when absent.
pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_token_sources() {
        let uri: Uri = "/v1/chat/completions?token=from-query".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_token(&headers, &uri).unwrap(), "abc");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("xyz"));
        assert_eq!(extract_token(&headers, &uri).unwrap(), "xyz");

        let headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, &uri).unwrap(), "from-query");

        let plain: Uri = "/v1/chat/completions".parse().unwrap();
        assert!(extract_token(&headers, &plain).is_none());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("192.168.1.1"));
        assert_eq!(client_ip(&headers), "10.1.2.3");

        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers), "192.168.1.1");

        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers), "unknown");
    }

    #[test]
    fn test_rate_limiter_burst_then_block() {
        let limiter = IpRateLimiter::new();
        for _ in 0..20 {
            assert!(limiter.check("1.2.3.4").is_ok());
        }
        assert!(limiter.check("1.2.3.4").is_err());
        // Independent buckets per IP
        assert!(limiter.check("5.6.7.8").is_ok());
    }
}
