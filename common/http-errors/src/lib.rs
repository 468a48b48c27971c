use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Serialize, Debug)]
struct ErrorBody {
    code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Serialize, Debug)]
struct ErrorEnvelope {
    error: ErrorBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<Uuid>,
    timestamp: DateTime<Utc>,
}

/// Canonical error surface for the request path. Every variant knows its
/// HTTP status and a stable short code used both in `X-Error-Code` and as
/// the Prometheus label recorded by [`http_error_metrics_layer`].
#[derive(Debug)]
pub enum ApiError {
    /// Missing or malformed `Authorization` header.
    Unauthorized { trace_id: Option<Uuid> },
    /// Key not found, revoked, or expired.
    Forbidden { trace_id: Option<Uuid> },
    /// Path prefix does not match any configured backend.
    UnknownService { trace_id: Option<Uuid> },
    /// Rate limit exceeded; carries the fields the response body and
    /// headers need so the middleware doesn't have to reach back in.
    RateLimited {
        trace_id: Option<Uuid>,
        limit_type: &'static str,
        minute_used: i64,
        day_used: i64,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },
    /// Upstream connection failed outright.
    BadGateway { trace_id: Option<Uuid> },
    /// Upstream did not answer within the proxy deadline.
    GatewayTimeout { trace_id: Option<Uuid> },
    /// Auth store, rate-limit store, or anything else unexpected.
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    fn code_str(&self) -> &'static str {
        match self {
            ApiError::Unauthorized { .. } => "unauthorized",
            ApiError::Forbidden { .. } => "forbidden",
            ApiError::UnknownService { .. } => "unknown_service",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::BadGateway { .. } => "bad_gateway",
            ApiError::GatewayTimeout { .. } => "gateway_timeout",
            ApiError::Internal { .. } => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::UnknownService { .. } => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn trace_id(&self) -> Option<Uuid> {
        match self {
            ApiError::Unauthorized { trace_id }
            | ApiError::Forbidden { trace_id }
            | ApiError::UnknownService { trace_id }
            | ApiError::RateLimited { trace_id, .. }
            | ApiError::BadGateway { trace_id }
            | ApiError::GatewayTimeout { trace_id }
            | ApiError::Internal { trace_id, .. } => *trace_id,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized { .. } => "missing or malformed authorization header".into(),
            ApiError::Forbidden { .. } => "api key is invalid, revoked, or expired".into(),
            ApiError::UnknownService { .. } => "no backend configured for this path".into(),
            ApiError::RateLimited { limit_type, .. } => {
                format!("{} rate limit exceeded", limit_type)
            }
            ApiError::BadGateway { .. } => "upstream connection failed".into(),
            ApiError::GatewayTimeout { .. } => "upstream did not respond in time".into(),
            ApiError::Internal { message, .. } => {
                message.clone().unwrap_or_else(|| "internal error".into())
            }
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::RateLimited {
                limit_type,
                minute_used,
                day_used,
                reset_at,
                retry_after_secs,
                ..
            } => Some(serde_json::json!({
                "limit_type": limit_type,
                "minute_used": minute_used,
                "day_used": day_used,
                "reset_at": reset_at,
                "retry_after": retry_after_secs,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.code_str();
        let retry_after = if let ApiError::RateLimited { retry_after_secs, .. } = &self {
            Some(*retry_after_secs)
        } else {
            None
        };
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: status.as_u16(),
                message: self.message(),
                details: self.details(),
            },
            request_id: self.trace_id(),
            timestamp: Utc::now(),
        };

        let mut response = (status, Json(envelope)).into_response();
        if let Ok(val) = HeaderValue::from_str(code_str) {
            response.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(secs) = retry_after {
            if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", val);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// --- Error-code cardinality guard -----------------------------------------
//
// A misbehaving handler that fabricates unique error codes per request
// (e.g. interpolating a request id into the code) would otherwise blow up
// label cardinality on `http_errors_total`. We cap the number of distinct
// codes tracked per service and bucket everything past the cap into
// "other", counting the overflow separately so it is still visible.

const MAX_ERROR_CODES: usize = 40;

static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_errors_total",
        "HTTP error responses by service and error code",
        &["service", "code"]
    )
    .expect("failed to register http_errors_total")
});

static HTTP_ERROR_DISTINCT_CODES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "http_error_distinct_codes",
        "Distinct error codes observed per service, capped at the cardinality guard",
        &["service"]
    )
    .expect("failed to register http_error_distinct_codes")
});

static HTTP_ERROR_CODE_OVERFLOW_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_error_code_overflow_total",
        "Error responses whose code exceeded the per-service cardinality guard",
        &["service"]
    )
    .expect("failed to register http_error_code_overflow_total")
});

static SEEN_CODES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn record_error_code(service: &str, code: &str) {
    let mut seen = SEEN_CODES.lock().expect("seen-codes lock poisoned");
    let key = format!("{service}:{code}");
    let known = seen.contains(&key);
    let label = if known || seen.len() < MAX_ERROR_CODES {
        if !known {
            seen.insert(key);
        }
        code.to_string()
    } else {
        HTTP_ERROR_CODE_OVERFLOW_TOTAL
            .with_label_values(&[service])
            .inc();
        "other".to_string()
    };
    drop(seen);

    HTTP_ERRORS_TOTAL.with_label_values(&[service, &label]).inc();
    let distinct = SEEN_CODES
        .lock()
        .expect("seen-codes lock poisoned")
        .len()
        .min(MAX_ERROR_CODES) as i64;
    HTTP_ERROR_DISTINCT_CODES
        .with_label_values(&[service])
        .set(distinct);
}

/// Middleware that observes the response produced by the rest of the
/// chain and, for any 4xx/5xx, bumps the error-code counter. Install it
/// outermost so it sees the final status code including panics converted
/// by the recovery layer.
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone {
    move |req: Request, next: Next| {
        Box::pin(async move {
            let response = next.run(req).await;
            if response.status().is_client_error() || response.status().is_server_error() {
                let code = response
                    .headers()
                    .get("X-Error-Code")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("http_{}", response.status().as_u16()));
                record_error_code(service, &code);
            }
            response
        })
    }
}

/// Test-only hooks into the cardinality guard, used by this crate's own
/// integration tests and by downstream services that want to assert on
/// the guard without standing up Prometheus scraping.
pub mod test_helpers {
    use super::*;

    pub fn simulate_error_code(code: &str) {
        record_error_code("test-svc", code);
    }

    pub fn distinct_gauge() -> i64 {
        HTTP_ERROR_DISTINCT_CODES.with_label_values(&["test-svc"]).get()
    }

    pub fn overflow_count() -> i64 {
        HTTP_ERROR_CODE_OVERFLOW_TOTAL
            .with_label_values(&["test-svc"])
            .get()
    }
}
