use crate::auth::{require_api_key, USER_ID_HEADER};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::rate_limit::middleware::rate_limit_middleware;
use crate::usage_limit::middleware::usage_limit_middleware;
use crate::usage_limit::OperationKind;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

/// Assemble the gateway router.
///
/// Layer order on gated routes is fixed: rate limit (network identity)
/// before auth, auth before the usage meter (account identity), meter before
/// the handler. `/health` sits outside the limiter so probes can't be
/// starved by a flood.
pub fn build_router(state: AppStateData) -> Router {
    let gated = Router::new()
        .route("/v1/ai/generate", post(ai_generate_handler))
        .route("/v1/dm/reply", post(dm_reply_handler))
        .route("/v1/money-plays", post(money_play_handler))
        .route("/v1/images/generate", post(image_generate_handler))
        .route("/v1/posts", post(social_post_handler))
        .route("/v1/faces/recognize", post(face_recognize_handler))
        .route("/v1/videos/generate", post(video_generate_handler))
        .route("/v1/usage", get(usage_stats_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.usage_meter),
            usage_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn_with_state(
            state.rate_limit_layer_state(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(gated)
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Today's usage and limits for the authenticated account, for the profile
/// dashboard.
async fn usage_stats_handler(
    State(state): State<AppStateData>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Error> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            Error::new(ErrorDetails::InvalidRequest {
                message: "Missing authenticated user".to_string(),
            })
        })?;

    let stats = state.usage_meter.usage_stats(user_id).await?;
    Ok(Json(stats))
}

// The gated handlers acknowledge and hand off to the actual operation
// (AI provider, publisher, recognizer) which lives outside this service.
// They exist so the limiter/auth/meter composition has something real to
// wrap.

fn queued(kind: OperationKind) -> Json<serde_json::Value> {
    Json(json!({ "status": "queued", "operation": kind.to_string() }))
}

async fn ai_generate_handler() -> impl IntoResponse {
    queued(OperationKind::AiGeneration)
}

async fn dm_reply_handler() -> impl IntoResponse {
    queued(OperationKind::DmReply)
}

async fn money_play_handler() -> impl IntoResponse {
    queued(OperationKind::MoneyPlay)
}

async fn image_generate_handler() -> impl IntoResponse {
    queued(OperationKind::ImageGeneration)
}

async fn social_post_handler() -> impl IntoResponse {
    queued(OperationKind::SocialPost)
}

async fn face_recognize_handler() -> impl IntoResponse {
    queued(OperationKind::FacialRecognition)
}

async fn video_generate_handler() -> impl IntoResponse {
    queued(OperationKind::VideoGeneration)
}
