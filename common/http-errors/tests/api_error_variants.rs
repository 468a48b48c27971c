use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::ApiError;
use uuid::Uuid;

#[test]
fn unauthorized_variant() {
    let err = ApiError::Unauthorized { trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "unauthorized");
}

#[test]
fn forbidden_variant() {
    let err = ApiError::Forbidden { trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "forbidden");
}

#[test]
fn unknown_service_variant() {
    let err = ApiError::UnknownService { trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "unknown_service");
}

#[test]
fn rate_limited_variant_sets_retry_after() {
    let err = ApiError::RateLimited {
        trace_id: Some(Uuid::new_v4()),
        limit_type: "minute",
        minute_used: 61,
        day_used: 400,
        reset_at: chrono::Utc::now(),
        retry_after_secs: 12,
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "rate_limited");
    assert_eq!(resp.headers().get("Retry-After").unwrap(), "12");
}

#[test]
fn bad_gateway_variant() {
    let err = ApiError::BadGateway { trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[test]
fn gateway_timeout_variant() {
    let err = ApiError::GatewayTimeout { trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[test]
fn internal_variant() {
    let trace = Some(Uuid::new_v4());
    let err = ApiError::Internal { trace_id: trace, message: Some("boom".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}
