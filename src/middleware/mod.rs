//! Cross-cutting HTTP middleware
//!
//! Security headers on every response, CORS driven by the configured
//! origin list, and the fixed-window request limiter in front of the MCP
//! endpoint.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::RateLimitKey;
use crate::error::ApiError;
use crate::AppState;

const CORS_ALLOW_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization, Accept, Mcp-Session-Id";

/// Hardening headers applied to every response.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    response
}

/// CORS per the configured origin list.
///
/// An empty list emits no CORS headers at all, leaving browsers to
/// enforce same-origin. A wildcard allows every origin but never grants
/// credentials; explicit origins are echoed back with credentials.
pub async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let allowed = &state.config.cors_origins;
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response, allowed, origin.as_deref());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(&mut response, allowed, origin.as_deref());
    response
}

fn apply_cors_headers(response: &mut Response, allowed: &[String], origin: Option<&str>) {
    if allowed.is_empty() {
        return;
    }

    let headers = response.headers_mut();
    let wildcard = allowed.iter().any(|o| o == "*");

    if wildcard {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    } else if let Some(origin) = origin {
        if allowed.iter().any(|o| o == origin) {
            if let Ok(value) = HeaderValue::from_str(origin) {
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
            }
        }
    }

    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
}

/// Client address as the server sees it.
///
/// `X-Forwarded-For` is only honoured when the operator explicitly
/// trusts the proxy in front of the gateway.
pub fn client_ip(
    headers: &axum::http::HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `client_ip` for handlers that still hold the whole request.
pub fn client_ip_from_request(request: &Request, trust_proxy: bool) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    client_ip(request.headers(), peer, trust_proxy)
}

/// Fixed-window limiter in front of `/mcp`.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trust_proxy = state.config.trust_proxy;
    let key = match state.config.rate_limit_by {
        RateLimitKey::Global => "default".to_string(),
        RateLimitKey::Ip => client_ip_from_request(&request, trust_proxy),
        RateLimitKey::Token => request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
            .unwrap_or_else(|| client_ip_from_request(&request, trust_proxy)),
    };

    let decision = state.rate_limiter.check(&key);
    if !decision.allowed {
        return Err(ApiError::Throttled {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn response() -> Response {
        StatusCode::OK.into_response()
    }

    #[test]
    fn empty_origin_list_emits_nothing() {
        let mut resp = response();
        apply_cors_headers(&mut resp, &[], Some("https://app.example.com"));
        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .is_none());
    }

    #[test]
    fn wildcard_allows_without_credentials() {
        let mut resp = response();
        apply_cors_headers(&mut resp, &["*".to_string()], Some("https://evil.example"));
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("*"))
        );
        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
            .is_none());
    }

    #[test]
    fn listed_origin_is_echoed_with_credentials() {
        let allowed = vec!["https://app.example.com".to_string()];
        let mut resp = response();
        apply_cors_headers(&mut resp, &allowed, Some("https://app.example.com"));
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .unwrap(),
            "true"
        );

        let mut other = response();
        apply_cors_headers(&mut other, &allowed, Some("https://other.example.com"));
        assert!(other
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[test]
    fn client_ip_falls_back_to_unknown() {
        let request = HttpRequest::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip_from_request(&request, false), "unknown");
    }

    #[test]
    fn forwarded_header_needs_trust() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.2.3, 10.0.0.1"));
        let peer = Some("127.0.0.1:9999".parse().unwrap());

        assert_eq!(client_ip(&headers, peer, true), "10.1.2.3");
        assert_eq!(client_ip(&headers, peer, false), "127.0.0.1");
    }
}
