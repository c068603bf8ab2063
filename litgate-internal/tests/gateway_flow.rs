//! End-to-end tests for the gated request path: rate limit -> auth -> usage
//! meter -> handler, with the usage increment applied only on success.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use tower::ServiceExt;

use litgate_internal::auth::USER_ID_HEADER;
use litgate_internal::clock::ManualClock;
use litgate_internal::config_parser::Config;
use litgate_internal::endpoints::build_router;
use litgate_internal::gateway_util::AppStateData;
use litgate_internal::usage_limit::middleware::usage_limit_middleware;
use litgate_internal::usage_limit::OperationKind;

const START_MS: u64 = 1_709_251_200_000; // 2024-03-01T00:00:00Z

fn test_config() -> Config {
    toml::from_str(
        r#"
        [rate_limits.default_config]
        limit = 50
        window_ms = 60000

        [rate_limits.routes."/v1/posts"]
        limit = 2
        window_ms = 60000

        [usage_limits.tiers.free]
        ai_generation = 2

        [api_keys.lk-test]
        user_id = "u1"
        "#,
    )
    .unwrap()
}

fn test_state() -> (AppStateData, ManualClock) {
    let clock = ManualClock::new(START_MS);
    let state = AppStateData::with_clock(Arc::new(test_config()), Arc::new(clock.clone())).unwrap();
    (state, clock)
}

fn post_request(path: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(path);
    if let Some(key) = bearer {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn rate_limiting_runs_before_authentication() {
    let (state, _clock) = test_state();
    let router = build_router(state);

    // Unauthenticated requests still consume the caller's window, so
    // credential stuffing can't probe for free.
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_request("/v1/posts", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = router
        .clone()
        .oneshot(post_request("/v1/posts", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("Retry-After"));

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
}

#[tokio::test]
async fn rate_limit_recovers_after_window() {
    let (state, clock) = test_state();
    let router = build_router(state);

    for _ in 0..2 {
        router
            .clone()
            .oneshot(post_request("/v1/posts", None))
            .await
            .unwrap();
    }

    let response = router
        .clone()
        .oneshot(post_request("/v1/posts", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance_ms(60_000);

    let response = router
        .clone()
        .oneshot(post_request("/v1/posts", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn allowed_responses_carry_rate_limit_headers() {
    let (state, _clock) = test_state();
    let router = build_router(state);

    let response = router
        .clone()
        .oneshot(post_request("/v1/ai/generate", Some("lk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "50");
    assert_eq!(
        response.headers().get("X-RateLimit-Remaining").unwrap(),
        "49"
    );
    assert!(response.headers().contains_key("X-RateLimit-Reset"));
}

#[tokio::test]
async fn unauthenticated_gated_request_is_rejected() {
    let (state, _clock) = test_state();
    let router = build_router(state);

    let response = router
        .clone()
        .oneshot(post_request("/v1/ai/generate", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .clone()
        .oneshot(post_request("/v1/ai/generate", Some("lk-wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn quota_exhaustion_returns_payment_required() {
    let (state, _clock) = test_state();
    let router = build_router(state);

    // Free tier is configured with 2 ai_generation per day.
    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_request("/v1/ai/generate", Some("lk-test")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .clone()
        .oneshot(post_request("/v1/ai/generate", Some("lk-test")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "insufficient_quota");
    assert_eq!(body["error"]["limit"], 2);
    assert_eq!(body["error"]["current"], 2);
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("2/2"));
}

#[tokio::test]
async fn quota_resets_on_next_period() {
    let (state, clock) = test_state();
    let router = build_router(state);

    for _ in 0..2 {
        router
            .clone()
            .oneshot(post_request("/v1/ai/generate", Some("lk-test")))
            .await
            .unwrap();
    }

    let response = router
        .clone()
        .oneshot(post_request("/v1/ai/generate", Some("lk-test")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    clock.advance_ms(86_400_000);

    let response = router
        .clone()
        .oneshot(post_request("/v1/ai/generate", Some("lk-test")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_operations_are_not_charged() {
    let (state, _clock) = test_state();

    async fn failing_handler() -> impl IntoResponse {
        StatusCode::BAD_GATEWAY
    }

    // The meter only observes what the middleware tells it; wire the same
    // middleware around a handler whose upstream collaborator fails.
    let router = Router::new()
        .route("/v1/ai/generate", post(failing_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.usage_meter),
            usage_limit_middleware,
        ));

    let request = Request::builder()
        .method("POST")
        .uri("/v1/ai/generate")
        .header(USER_ID_HEADER, "u1")
        .body(Body::empty())
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let check = state
        .usage_meter
        .can_perform_action("u1", OperationKind::AiGeneration)
        .await;
    assert_eq!(check.current, 0, "failed operation must not increment usage");
}

#[tokio::test]
async fn usage_stats_reflect_recorded_operations() {
    let (state, _clock) = test_state();
    let router = build_router(state);

    router
        .clone()
        .oneshot(post_request("/v1/ai/generate", Some("lk-test")))
        .await
        .unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/v1/usage")
        .header("authorization", "Bearer lk-test")
        .body(Body::empty())
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["tier"], "free");
    assert_eq!(body["period_key"], "2024-03-01");
    assert_eq!(body["today"]["ai_generation"], 1);
    assert_eq!(body["limits"]["ai_generation"], 2);
}

#[tokio::test]
async fn health_endpoint_is_not_rate_limited() {
    let config: Config = toml::from_str(
        r#"
        [rate_limits.default_config]
        limit = 1
        window_ms = 60000
        "#,
    )
    .unwrap();
    let state =
        AppStateData::with_clock(Arc::new(config), Arc::new(ManualClock::new(START_MS))).unwrap();
    let router = build_router(state);

    for _ in 0..5 {
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn distinct_callers_have_independent_windows() {
    let (state, _clock) = test_state();
    let router = build_router(state);

    let request_from = |ip: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/posts")
            .header("x-forwarded-for", ip.to_string())
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        router.clone().oneshot(request_from("203.0.113.5")).await.unwrap();
    }
    let response = router
        .clone()
        .oneshot(request_from("203.0.113.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // A different caller is untouched.
    let response = router
        .clone()
        .oneshot(request_from("198.51.100.7"))
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
