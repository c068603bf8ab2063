use crate::rate_limit::store::RateLimiterStore;
use crate::rate_limit::{RateLimitBackend, RateLimitDecision, RateLimitHeaders};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// State handed to the rate limit layer.
#[derive(Clone)]
pub struct RateLimitLayerState {
    pub backend: Arc<RateLimitBackend>,
    pub store: RateLimiterStore,
}

/// Rate limiting middleware.
///
/// Runs before authentication: its job is blunting floods and credential
/// stuffing, so it must not depend on a validated identity. Allowed
/// responses carry the `X-RateLimit-*` headers; denials become 429 with a
/// retry hint.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitLayerState>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimitError> {
    if !state.store.is_enabled() {
        return Ok(next.run(request).await);
    }

    let route = request.uri().path().to_string();
    let config = state.store.get_route_config(&route);
    if !config.enabled {
        return Ok(next.run(request).await);
    }

    let caller = caller_key(request.headers());
    // Scope counters per route class so a burst against one endpoint doesn't
    // starve the caller everywhere.
    let key = format!("{route}:{caller}");

    debug!(%route, %caller, "Checking rate limit");

    match state.backend.check(&key, &config).await {
        RateLimitDecision::Allow(headers) => {
            let mut response = next.run(request).await;
            response.headers_mut().extend(headers.to_header_map());
            Ok(response)
        }
        RateLimitDecision::Deny(headers) => {
            warn!(%route, %caller, "Rate limit exceeded");
            Err(RateLimitError::Exceeded(headers))
        }
    }
}

/// Caller identity for rate limiting.
///
/// Priority: explicit API key > bearer-token fingerprint > network address.
/// Omitting credentials falls through to the least favorable identity (a
/// shared, spoofable IP), so stripping headers never relaxes the limit. The
/// bearer token is reduced to a hash prefix; the raw secret is never used as
/// a key.
pub fn caller_key(headers: &HeaderMap) -> String {
    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !api_key.is_empty() {
            return format!("api:{api_key}");
        }
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let token = auth.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if !token.is_empty() {
            return format!("user:{}", token_fingerprint(token));
        }
    }

    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .unwrap_or("unknown");

    format!("ip:{ip}")
}

fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Rate limiting specific errors
#[derive(Debug)]
pub enum RateLimitError {
    Exceeded(RateLimitHeaders),
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match self {
            RateLimitError::Exceeded(headers) => {
                let retry_after = headers.retry_after.unwrap_or(1);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(serde_json::json!({
                        "error": {
                            "message": format!(
                                "Rate limit exceeded. Try again in {retry_after} seconds."
                            ),
                            "type": "rate_limit_error",
                            "code": "rate_limit_exceeded"
                        }
                    })),
                )
                    .into_response();

                response.headers_mut().extend(headers.to_header_map());
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_api_key_takes_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("lk-test-123"));
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer secret-token"),
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5"));

        assert_eq!(caller_key(&headers), "api:lk-test-123");
    }

    #[test]
    fn test_bearer_token_is_fingerprinted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer super-secret-token"),
        );

        let key = caller_key(&headers);
        assert!(key.starts_with("user:"));
        assert_eq!(key.len(), "user:".len() + 16);
        assert!(!key.contains("super-secret-token"));

        // Stable across calls for the same token.
        assert_eq!(key, caller_key(&headers));
    }

    #[test]
    fn test_ip_fallback_uses_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );

        assert_eq!(caller_key(&headers), "ip:203.0.113.5");
    }

    #[test]
    fn test_ip_fallback_uses_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));

        assert_eq!(caller_key(&headers), "ip:198.51.100.7");
    }

    #[test]
    fn test_no_signals_falls_back_to_unknown() {
        let headers = HeaderMap::new();
        assert_eq!(caller_key(&headers), "ip:unknown");
    }

    #[test]
    fn test_exceeded_response_has_headers_and_hint() {
        let error = RateLimitError::Exceeded(RateLimitHeaders {
            limit: 5,
            remaining: 0,
            reset: 1234567890,
            retry_after: Some(42),
        });

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    }
}
