mod common;

use axum::body::to_bytes;
use axum::http::{Request, StatusCode};
use common::test_router;
use gateway::rate_limiter::RateLimitConfig;
use httpmock::prelude::*;
use std::collections::HashMap;
use tower::ServiceExt;

#[tokio::test]
async fn proxies_to_backend_and_sets_rate_limit_headers() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/123/items");
        then.status(200).header("content-type", "application/json").body(r#"{"ok":true}"#);
    });

    let mut backends = HashMap::new();
    backends.insert("orders".to_string(), server.base_url());

    let (app, _org, _key) = test_router(
        "sk_test_token",
        RateLimitConfig { per_minute: 60, per_day: 10_000, burst: 0 },
        backends,
    )
    .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/orders/123/items")
                .header("Authorization", "Bearer sk_test_token")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-ratelimit-limit-minute").unwrap(), "60");
    assert_eq!(response.headers().get("x-ratelimit-remaining-minute").unwrap(), "59");

    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    assert_eq!(&body[..], br#"{"ok":true}"#);
    mock.assert();
}

#[tokio::test]
async fn sixth_request_in_a_minute_is_throttled_with_five_allowed() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/123/items");
        then.status(200).body("ok");
    });

    let mut backends = HashMap::new();
    backends.insert("orders".to_string(), server.base_url());

    let (app, _org, _key) = test_router(
        "sk_test_token",
        RateLimitConfig { per_minute: 5, per_day: 10_000, burst: 0 },
        backends,
    )
    .await;

    for i in 0..5 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/orders/123/items")
                    .header("Authorization", "Bearer sk_test_token")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i} should be allowed");
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/orders/123/items")
                .header("Authorization", "Bearer sk_test_token")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response.headers().get("Retry-After").unwrap().to_str().unwrap().to_string();
    let retry_after: u64 = retry_after.parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    assert_eq!(response.headers().get("x-ratelimit-limit-minute").unwrap(), "5");
    assert_eq!(response.headers().get("x-ratelimit-remaining-minute").unwrap(), "0");
    assert!(response.headers().get("x-ratelimit-limit-day").is_some());
    assert!(response.headers().get("x-ratelimit-remaining-day").is_some());
    assert!(response.headers().get("x-ratelimit-reset-minute").is_some());
    assert!(response.headers().get("x-ratelimit-reset-day").is_some());

    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["details"]["limit_type"], "minute");
}
