use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use common_usage_events::UsageEvent;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::context::{PanicContextSlot, RequestContext};
use crate::key_cache::{self, LookupOutcome};
use crate::proxy::select_backend;
use crate::rate_limiter::RateLimiterEngine;

/// Outermost layer: converts a panic anywhere downstream into a 500
/// instead of tearing down the connection. A panic after the proxy handler
/// started must still produce exactly one `UsageEvent`, so an empty
/// [`PanicContextSlot`] is inserted into the request before it is run;
/// `auth_and_rate_limit_middleware` fills it in with the request's
/// [`RequestContext`] right before calling the proxy handler. A panic
/// upstream of that point (auth, rate limiting) finds the slot still empty
/// and emits nothing, consistent with "no proxied request occurred".
pub async fn recovery_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let slot: PanicContextSlot = Arc::new(Mutex::new(None));
    req.extensions_mut().insert(slot.clone());

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(panic = %message, "request handler panicked");

            if let Some(ctx) = slot.lock().expect("panic context slot lock poisoned").take() {
                state.usage.record(UsageEvent::new(
                    ctx.request_id,
                    ctx.organization_id.unwrap_or_default(),
                    ctx.api_key_id.unwrap_or_default(),
                    ctx.path,
                    ctx.method,
                    StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    ctx.elapsed_ms(),
                ));
            }

            ApiError::Internal { trace_id: None, message: None }.into_response()
        }
    }
}

/// One structured log line per request, emitted through `tracing` so the
/// JSON shape comes from the subscriber's formatter rather than
/// hand-assembled strings. Fields follow the request-completed log record:
/// method, path, status, duration, response size, caller IP/agent, and
/// (once auth has run) request/organization/target-service identifiers.
pub async fn logging_middleware(connect_info: Option<ConnectInfo<SocketAddr>>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let fallback_ip = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis();
    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let ctx = response.extensions().get::<RequestContext>();
    let request_id = ctx.map(|ctx| ctx.request_id);
    let organization_id = ctx.and_then(|ctx| ctx.organization_id);
    let target_service = ctx.and_then(|ctx| ctx.target_service.clone());
    let client_ip = ctx.map(|ctx| ctx.client_ip.clone()).or(fallback_ip).unwrap_or_else(|| "unknown".to_string());

    info!(
        method = %method,
        path = %path,
        status,
        duration_ms,
        bytes,
        client_ip = %client_ip,
        user_agent = user_agent.as_deref(),
        request_id = request_id.map(|id| id.to_string()),
        organization_id = organization_id.map(|id| id.to_string()),
        target_service = target_service.as_deref(),
        "request completed"
    );

    response
}

/// Authenticates the bearer token against the key cache, resolves the
/// target backend (404 before any quota is consumed), then checks the
/// rate limiter. Populates the [`RequestContext`] extension consumed by
/// [`crate::proxy::proxy_handler`] and stamps `X-RateLimit-*` headers on
/// every response that reaches this far.
pub async fn auth_and_rate_limit_middleware(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let mut ctx = RequestContext::new(method, path.clone(), client_ip);

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized { trace_id: Some(ctx.request_id) })?;

    let digest = key_cache::digest(token);
    let was_cached = {
        let guard = state.key_cache.read().await;
        guard.contains_key(&digest)
    };

    let cached = match key_cache::lookup(
        &state.db_pool,
        &state.key_cache,
        &digest,
        state.config.key_cache_ttl,
        state.config.auth_store_timeout,
    )
    .await
    {
        LookupOutcome::Found(cached) => {
            if was_cached {
                state.metrics.inc_auth_cache_hit();
            } else {
                state.metrics.inc_auth_cache_miss();
            }
            cached
        }
        LookupOutcome::NotFound => {
            return Err(ApiError::Forbidden { trace_id: Some(ctx.request_id) });
        }
        LookupOutcome::Transient => {
            state.metrics.inc_auth_store_error();
            return Err(ApiError::Internal {
                trace_id: Some(ctx.request_id),
                message: Some("key store unavailable".into()),
            });
        }
    };

    ctx.api_key_id = Some(cached.api_key_id);
    ctx.organization_id = Some(cached.organization_id);

    let (service, _base, _rest) = select_backend(&path, &state.config.backend_urls)
        .ok_or(ApiError::UnknownService { trace_id: Some(ctx.request_id) })?;
    ctx.target_service = Some(service.to_string());

    let rl_start = Instant::now();
    let decision = match state.rate_limiter.check(cached.organization_id, cached.rate_limit).await {
        Ok(decision) => {
            state.metrics.observe_rate_limit_latency(rl_start.elapsed().as_secs_f64());
            state.metrics.record_rate_check(decision.allowed);
            if let Some(limit_type) = decision.limit_type {
                state.metrics.record_rate_denial(limit_type);
            }
            Some(decision)
        }
        Err(err) => {
            warn!(?err, "rate limiter unavailable, failing open");
            state.metrics.inc_rate_limit_fail_open();
            None
        }
    };

    if let Some(decision) = &decision {
        if !decision.allowed {
            let limit_type = decision.limit_type.unwrap_or("minute");
            let reset_at = if limit_type == "minute" { decision.minute_reset } else { decision.day_reset };
            let retry_after = (reset_at - chrono::Utc::now()).num_seconds().clamp(1, 86_400) as u64;
            let mut response = ApiError::RateLimited {
                trace_id: Some(ctx.request_id),
                limit_type,
                minute_used: decision.minute_used,
                day_used: decision.day_used,
                reset_at,
                retry_after_secs: retry_after,
            }
            .into_response();
            apply_rate_limit_headers(&mut response, decision);
            return Ok(response);
        }
    }

    if let Some(slot) = request.extensions().get::<crate::context::PanicContextSlot>() {
        *slot.lock().expect("panic context slot lock poisoned") = Some(ctx.clone());
    }

    request.extensions_mut().insert(ctx.clone());
    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);

    if let Some(decision) = decision {
        apply_rate_limit_headers(&mut response, &decision);
    }

    Ok(response)
}

fn apply_rate_limit_headers(response: &mut Response, decision: &crate::rate_limiter::RateDecision) {
    let headers = response.headers_mut();
    let set = |headers: &mut axum::http::HeaderMap, name: &'static str, value: String| {
        if let Ok(val) = HeaderValue::from_str(&value) {
            headers.insert(name, val);
        }
    };
    set(headers, "x-ratelimit-limit-minute", decision.minute_limit.to_string());
    set(headers, "x-ratelimit-limit-day", decision.day_limit.to_string());
    set(headers, "x-ratelimit-remaining-minute", decision.minute_remaining().to_string());
    set(headers, "x-ratelimit-remaining-day", decision.day_remaining().to_string());
    set(headers, "x-ratelimit-reset-minute", decision.minute_reset.to_rfc3339());
    set(headers, "x-ratelimit-reset-day", decision.day_reset.to_rfc3339());
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}
