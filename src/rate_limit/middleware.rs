use crate::rate_limit::limiter::RateLimitDecision;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue};
use std::net::SocketAddr;

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded_for.to_str() {
            if let Some(first) = value.split(',').next().map(str::trim).filter(|ip| !ip.is_empty()) {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Add `X-RateLimit-*` and `Retry-After` headers for a decision
pub fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    // X-RateLimit-Limit: Maximum number of requests allowed in the window
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
    }

    // X-RateLimit-Remaining: Number of requests remaining
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
    }

    // X-RateLimit-Reset: Unix timestamp when the window frees up
    if let Ok(value) = HeaderValue::from_str(&decision.reset_secs().to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
    }

    if !decision.allowed {
        if let Some(retry_after) = decision.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert(HeaderName::from_static("retry-after"), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_from_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.42"));

        assert_eq!(client_ip(&headers, None), "192.168.1.1");
    }

    #[test]
    fn test_client_ip_from_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.42"));

        assert_eq!(client_ip(&headers, None), "203.0.113.42");
    }

    #[test]
    fn test_client_ip_from_peer() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "10.1.2.3");
        assert_eq!(client_ip(&headers, None), "unknown");
    }

    #[test]
    fn test_headers_for_denial() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 30,
            remaining: 0,
            reset_time_ms: 1_700_000_060_000,
            retry_after_ms: Some(42_500),
            reason: None,
            failsafe_mode: false,
            fraud: None,
        };
        let mut headers = HeaderMap::new();
        add_rate_limit_headers(&mut headers, &decision);

        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "30");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1700000060");
        assert_eq!(headers.get("retry-after").unwrap(), "43");
    }
}
