use crate::crypto::constant_time_eq;
use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'self'; frame-ancestors 'none'; object-src 'none'; base-uri 'self'";

const SECURITY_HEADERS: [(&str, &str); 6] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("content-security-policy", CONTENT_SECURITY_POLICY),
];

/// Result of matching the `Origin` header against the allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginCheck {
    Allowed(String),
    /// No `Origin` header: a server-to-server caller
    Absent,
    Denied(String),
}

impl OriginCheck {
    pub fn allowed_origin(&self) -> Option<&str> {
        match self {
            OriginCheck::Allowed(origin) => Some(origin),
            _ => None,
        }
    }
}

/// Exact match only. No prefix matching and no default origin.
pub fn validate_origin(headers: &HeaderMap, allowed_origins: &[String]) -> OriginCheck {
    let Some(value) = headers.get(header::ORIGIN) else {
        return OriginCheck::Absent;
    };
    let origin = match value.to_str() {
        Ok(origin) if !origin.trim().is_empty() => origin.trim(),
        Ok(_) => return OriginCheck::Absent,
        Err(_) => return OriginCheck::Denied("<non-ascii>".to_string()),
    };

    if allowed_origins.iter().any(|allowed| allowed == origin) {
        OriginCheck::Allowed(origin.to_string())
    } else {
        OriginCheck::Denied(origin.to_string())
    }
}

pub fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
}

/// CORS headers for an origin that already passed [`validate_origin`]
pub fn apply_cors_headers(headers: &mut HeaderMap, origin: &str, csrf_header: &str) {
    let Ok(origin) = HeaderValue::from_str(origin) else {
        return;
    };
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    let allow_headers = format!("authorization, content-type, {}", csrf_header);
    if let Ok(value) = HeaderValue::from_str(&allow_headers) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
}

/// Middleware adding the fixed security headers to every response
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    apply_security_headers(response.headers_mut());
    response
}

/// Value of a request cookie
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Double-submit check: header token and cookie token must both be present
/// and equal.
pub fn csrf_matches(headers: &HeaderMap, header_name: &str, cookie_name: &str) -> bool {
    let header_token = headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let cookie_token = cookie_value(headers, cookie_name);

    match (header_token, cookie_token) {
        (Some(header_token), Some(cookie_token)) => constant_time_eq(header_token, &cookie_token),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["https://app.example.com".to_string()]
    }

    #[test]
    fn test_origin_exact_match() {
        let mut headers = HeaderMap::new();
        assert_eq!(validate_origin(&headers, &allowed()), OriginCheck::Absent);

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example.com"));
        assert_eq!(
            validate_origin(&headers, &allowed()),
            OriginCheck::Allowed("https://app.example.com".to_string())
        );

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://app.example.com.evil.io"));
        assert!(matches!(validate_origin(&headers, &allowed()), OriginCheck::Denied(_)));

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://app.example.com"));
        assert!(matches!(validate_origin(&headers, &allowed()), OriginCheck::Denied(_)));
    }

    #[test]
    fn test_security_headers_applied() {
        let mut headers = HeaderMap::new();
        apply_security_headers(&mut headers);
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        let csp = headers.get("content-security-policy").unwrap().to_str().unwrap();
        assert!(csp.contains("frame-ancestors 'none'"));
        assert!(csp.contains("object-src 'none'"));
    }

    #[test]
    fn test_cors_echoes_validated_origin() {
        let mut headers = HeaderMap::new();
        apply_cors_headers(&mut headers, "https://app.example.com", "x-csrf-token");
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example.com"
        );
        assert!(headers
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("x-csrf-token"));
    }

    #[test]
    fn test_csrf_requires_both_tokens() {
        let mut headers = HeaderMap::new();
        assert!(!csrf_matches(&headers, "x-csrf-token", "csrf_token"));

        headers.insert("x-csrf-token", HeaderValue::from_static("abc123"));
        assert!(!csrf_matches(&headers, "x-csrf-token", "csrf_token"));

        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; csrf_token=abc123"));
        assert!(csrf_matches(&headers, "x-csrf-token", "csrf_token"));

        headers.insert(header::COOKIE, HeaderValue::from_static("csrf_token=other"));
        assert!(!csrf_matches(&headers, "x-csrf-token", "csrf_token"));
    }

    #[test]
    fn test_cookie_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("a=1; device_signup=yes"));
        assert_eq!(cookie_value(&headers, "device_signup").as_deref(), Some("yes"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
