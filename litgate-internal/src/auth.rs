use crate::usage_limit::UserTier;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Headers stamped onto the request once the API key checks out. Downstream
/// layers (the usage meter, handlers) read identity from these instead of
/// re-validating.
pub const USER_ID_HEADER: &str = "x-litgate-user-id";
pub const USER_TIER_HEADER: &str = "x-litgate-user-tier";

/// Account record behind an API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub user_id: String,
    #[serde(default)]
    pub tier: UserTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// Hash API key using SHA256 with "lit-" prefix (matching the key format the
// provisioning service writes).
fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"lit-");
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

// Common error response helper
fn auth_error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "invalid_request_error",
            "code": status.as_u16()
        }
    });
    (status, axum::Json(body)).into_response()
}

/// API key registry. Only key hashes are held; raw secrets never live in
/// process memory beyond the request that carried them.
#[derive(Clone, Default)]
pub struct Auth {
    api_keys: Arc<RwLock<HashMap<String, ApiKeyRecord>>>,
}

impl Auth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record under an already-hashed key (the format
    /// the registry store uses).
    pub fn update_api_key(&self, hashed_key: &str, record: ApiKeyRecord) {
        // In practice, a poisoned RwLock indicates a panic in another thread
        // while holding the lock. This is a catastrophic failure that should
        // not be recovered from.
        #[expect(clippy::expect_used)]
        let mut api_keys = self.api_keys.write().expect("RwLock poisoned");
        api_keys.insert(hashed_key.to_string(), record);
    }

    /// Insert a record under a plaintext key, hashing it first. Used for
    /// config-file seeded keys in dev deployments.
    pub fn seed_plaintext_key(&self, api_key: &str, record: ApiKeyRecord) {
        self.update_api_key(&hash_api_key(api_key), record);
    }

    pub fn delete_api_key(&self, hashed_key: &str) {
        #[expect(clippy::expect_used)]
        let mut api_keys = self.api_keys.write().expect("RwLock poisoned");
        api_keys.remove(hashed_key);
    }

    pub fn validate_api_key(&self, api_key: &str) -> Result<ApiKeyRecord, StatusCode> {
        // Hash the API key before lookup (consistent with storage)
        let hashed_key = hash_api_key(api_key);

        #[expect(clippy::expect_used)]
        let api_keys = self.api_keys.read().expect("RwLock poisoned");
        api_keys
            .get(&hashed_key)
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }

    pub fn key_count(&self) -> usize {
        #[expect(clippy::expect_used)]
        let api_keys = self.api_keys.read().expect("RwLock poisoned");
        api_keys.len()
    }
}

/// Authentication middleware for account-scoped routes.
///
/// Accepts `Authorization: Bearer <key>` or `X-Api-Key: <key>`, validates
/// against the registry, and stamps the identity headers. Any client-sent
/// identity headers are overwritten, never trusted.
pub async fn require_api_key(
    State(auth): State<Auth>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let key = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| {
            let s = s.trim();
            s.strip_prefix("Bearer ").unwrap_or(s).to_string()
        })
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        });

    let key = match key {
        Some(key) if !key.is_empty() => key,
        _ => {
            return Err(auth_error_response(
                StatusCode::UNAUTHORIZED,
                "Missing authorization header",
            ))
        }
    };

    let record = match auth.validate_api_key(&key) {
        Ok(record) => record,
        Err(_) => {
            return Err(auth_error_response(
                StatusCode::UNAUTHORIZED,
                "Invalid API key",
            ))
        }
    };

    if let Ok(header_value) = HeaderValue::from_str(&record.user_id) {
        request.headers_mut().insert(USER_ID_HEADER, header_value);
    } else {
        return Err(auth_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Account id is not header-safe",
        ));
    }

    if let Ok(header_value) = HeaderValue::from_str(&record.tier.to_string()) {
        request.headers_mut().insert(USER_TIER_HEADER, header_value);
    }

    Ok(next.run(request).await)
}
