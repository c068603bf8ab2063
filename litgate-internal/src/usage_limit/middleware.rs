use crate::auth::USER_ID_HEADER;
use crate::usage_limit::{OperationKind, UsageMeter};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

/// The operation kind a gated route charges, by path. Routes not listed here
/// are not metered (they may still be rate limited).
pub fn operation_kind_for_path(path: &str) -> Option<OperationKind> {
    match path {
        "/v1/ai/generate" => Some(OperationKind::AiGeneration),
        "/v1/dm/reply" => Some(OperationKind::DmReply),
        "/v1/money-plays" => Some(OperationKind::MoneyPlay),
        "/v1/images/generate" => Some(OperationKind::ImageGeneration),
        "/v1/posts" => Some(OperationKind::SocialPost),
        "/v1/faces/recognize" => Some(OperationKind::FacialRecognition),
        "/v1/videos/generate" => Some(OperationKind::VideoGeneration),
        _ => None,
    }
}

/// Middleware for checking usage quotas on gated routes.
///
/// Runs after authentication: the check needs an account identity and a
/// tier, not a network address. Order matters on the way out too: the
/// counter increments only when the gated operation actually succeeded, so a
/// failed upstream call costs the user nothing.
pub async fn usage_limit_middleware(
    State(meter): State<Arc<UsageMeter>>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(kind) = operation_kind_for_path(request.uri().path()) else {
        return Ok(next.run(request).await);
    };

    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(user_id) = user_id else {
        // The auth layer rejects unauthenticated calls to gated routes; an
        // absent header here means the route isn't behind auth in this
        // deployment.
        debug!(path = request.uri().path(), "No authenticated user for metered route");
        return Ok(next.run(request).await);
    };

    let check = meter.can_perform_action(&user_id, kind).await;
    if !check.allowed {
        let reason = check
            .reason
            .unwrap_or_else(|| "Usage limit exceeded".to_string());
        warn!(%user_id, %kind, %reason, "Usage quota exceeded");

        let error_body = serde_json::json!({
            "error": {
                "message": format!("Usage quota exceeded: {reason}"),
                "type": "insufficient_quota",
                "code": 402,
                "limit": check.limit,
                "current": check.current,
            }
        });

        return Err((StatusCode::PAYMENT_REQUIRED, axum::Json(error_body)).into_response());
    }

    let response = next.run(request).await;

    if response.status().is_success() {
        if let Err(e) = meter.increment_usage(&user_id, kind).await {
            warn!(%user_id, %kind, "Failed to record usage after successful operation: {e}");
        }
    }

    Ok(response)
}
