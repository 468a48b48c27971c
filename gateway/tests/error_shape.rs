mod common;

use axum::body::to_bytes;
use axum::http::{Request, StatusCode};
use common::test_router;
use gateway::rate_limiter::RateLimitConfig;
use std::collections::HashMap;
use tower::ServiceExt;

#[tokio::test]
async fn missing_authorization_header_is_401() {
    let (app, _org, _key) = test_router(
        "sk_test_token",
        RateLimitConfig { per_minute: 60, per_day: 10_000, burst: 0 },
        HashMap::new(),
    )
    .await;

    let response = app
        .oneshot(Request::builder().uri("/orders/123").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], 401);
}

#[tokio::test]
async fn unknown_bearer_token_is_403() {
    let (app, _org, _key) = test_router(
        "sk_test_token",
        RateLimitConfig { per_minute: 60, per_day: 10_000, burst: 0 },
        HashMap::new(),
    )
    .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/orders/123")
                .header("Authorization", "Bearer sk_does_not_exist")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_service_is_404_and_does_not_touch_rate_limiter() {
    let (app, _org, _key) = test_router(
        "sk_test_token",
        RateLimitConfig { per_minute: 1, per_day: 10_000, burst: 0 },
        HashMap::new(),
    )
    .await;

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/unrouteable/path")
                    .header("Authorization", "Bearer sk_test_token")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // Every call 404s rather than eventually 429ing, proving the
        // rate limiter was never consulted for an unroutable path.
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn health_and_metrics_do_not_require_auth() {
    let (app, _org, _key) = test_router(
        "sk_test_token",
        RateLimitConfig { per_minute: 60, per_day: 10_000, burst: 0 },
        HashMap::new(),
    )
    .await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
