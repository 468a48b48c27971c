use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use common_usage_events::UsageEvent;
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;

use crate::app_state::AppState;
use crate::context::RequestContext;

/// Splits an inbound path of the form `/<service>/<rest...>` into the
/// configured backend base URL and the remainder to forward. Returns
/// `None` when `<service>` does not match any configured backend, which
/// callers must turn into a 404 *before* consulting the rate limiter.
pub fn select_backend<'a>(
    path: &str,
    backend_urls: &'a HashMap<String, String>,
) -> Option<(&'a str, &'a str, String)> {
    let trimmed = path.trim_start_matches('/');
    let (service, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    backend_urls
        .get_key_value(service)
        .map(|(name, base)| (name.as_str(), base.as_str(), format!("/{rest}")))
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "authorization",
];

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Terminal handler for the proxied API surface. Routing, auth, and rate
/// limiting have already run in the middleware chain by the time this is
/// reached; `target_service` and `organization_id`/`api_key_id` are
/// already populated on the [`RequestContext`] extension.
pub async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .expect("RequestContext must be inserted by the auth/rate-limit middleware");

    let (service, base_url, rest) = match select_backend(&ctx.path, &state.config.backend_urls) {
        Some(found) => found,
        None => return ApiError::UnknownService { trace_id: Some(ctx.request_id) }.into_response(),
    };

    let query = req.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
    let upstream_url = format!("{base_url}{rest}{query}");
    let method = req.method().clone();
    let inbound_headers = forwardable_headers(req.headers());

    let body_bytes = match to_bytes(req.into_body(), 10 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(?err, "failed to buffer inbound request body for proxying");
            return ApiError::Internal { trace_id: Some(ctx.request_id), message: None }.into_response();
        }
    };

    let started = Instant::now();
    let result = forward(
        &state.http_client,
        &upstream_url,
        &method,
        &inbound_headers,
        body_bytes,
        &ctx,
        state.config.proxy_timeout,
    )
    .await;
    state.metrics.observe_proxy_latency(started.elapsed().as_secs_f64());

    let (status, response) = match result {
        Ok(resp) => {
            let status = resp.status();
            (status, resp.into_response())
        }
        Err(ProxyError::Timeout) => {
            (StatusCode::GATEWAY_TIMEOUT, ApiError::GatewayTimeout { trace_id: Some(ctx.request_id) }.into_response())
        }
        Err(ProxyError::Connect) => {
            (StatusCode::BAD_GATEWAY, ApiError::BadGateway { trace_id: Some(ctx.request_id) }.into_response())
        }
    };

    state.metrics.record_proxy_request(service, status);

    let event = UsageEvent::new(
        ctx.request_id,
        ctx.organization_id.unwrap_or_default(),
        ctx.api_key_id.unwrap_or_default(),
        ctx.path.clone(),
        ctx.method.clone(),
        status.as_u16(),
        ctx.elapsed_ms(),
    );
    state.usage.record(event);

    response
}

enum ProxyError {
    Connect,
    Timeout,
}

async fn forward(
    client: &reqwest::Client,
    url: &str,
    method: &Method,
    headers: &HeaderMap,
    body: axum::body::Bytes,
    ctx: &RequestContext,
    timeout: std::time::Duration,
) -> Result<reqwest::Response, ProxyError> {
    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(reqwest_method, url).timeout(timeout).body(body);

    let mut out_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out_headers.append(name, value);
        }
    }
    out_headers.append(
        reqwest::header::HeaderName::from_static("x-forwarded-for"),
        reqwest::header::HeaderValue::from_str(&ctx.client_ip).unwrap_or(reqwest::header::HeaderValue::from_static("unknown")),
    );
    out_headers.append(
        reqwest::header::HeaderName::from_static("x-request-id"),
        reqwest::header::HeaderValue::from_str(&ctx.request_id.to_string()).expect("uuid is valid header value"),
    );
    builder = builder.headers(out_headers);

    match builder.send().await {
        Ok(resp) => Ok(resp),
        Err(err) if err.is_timeout() => Err(ProxyError::Timeout),
        Err(_) => Err(ProxyError::Connect),
    }
}

/// Converts a `reqwest::Response` back into an axum `Response`, streaming
/// the upstream body through unchanged.
trait IntoAxumResponse {
    fn into_response(self) -> Response;
}

impl IntoAxumResponse for reqwest::Response {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        for (name, value) in self.headers().iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder = builder.header(name, value);
            }
        }
        let stream = self.bytes_stream();
        builder
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("orders".to_string(), "http://orders.internal:8080".to_string());
        map
    }

    #[test]
    fn selects_configured_backend_and_strips_prefix() {
        let (service, base, rest) = select_backend("/orders/123/items", &backends()).unwrap();
        assert_eq!(service, "orders");
        assert_eq!(base, "http://orders.internal:8080");
        assert_eq!(rest, "/123/items");
    }

    #[test]
    fn unknown_service_returns_none() {
        assert!(select_backend("/unknown/path", &backends()).is_none());
    }

    #[test]
    fn bare_service_with_no_rest_path() {
        let (service, _base, rest) = select_backend("/orders", &backends()).unwrap();
        assert_eq!(service, "orders");
        assert_eq!(rest, "/");
    }
}
