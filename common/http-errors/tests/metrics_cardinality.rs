use axum::{http::StatusCode, middleware, routing::get, Router};
use common_http_errors::{http_error_metrics_layer, ApiError};
use tower::ServiceExt;

async fn always_forbidden() -> Result<&'static str, ApiError> {
    Err(ApiError::Forbidden { trace_id: None })
}

#[tokio::test]
async fn metrics_layer_passes_through_status_under_repeated_errors() {
    let app = Router::new()
        .route("/err", get(always_forbidden))
        .layer(middleware::from_fn(http_error_metrics_layer("test-svc")));

    // Hammer the same error code repeatedly; the cardinality guard only
    // matters for *distinct* codes, so this just proves the layer never
    // interferes with normal error responses.
    for _ in 0..50 {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/err")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
