use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,

    auth_cache_hits: IntCounter,
    auth_cache_misses: IntCounter,
    auth_store_errors: IntCounter,

    rate_limit_checks: IntCounterVec,
    rate_limit_denials: IntCounterVec,
    rate_limit_fail_open: IntCounter,
    rate_limit_latency: Histogram,

    proxy_requests: IntCounterVec,
    proxy_latency: Histogram,

    usage_events_dropped: IntCounter,
    usage_buffer_capacity: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let auth_cache_hits = IntCounter::with_opts(Opts::new(
            "gateway_auth_cache_hits_total",
            "Authentication cache lookups served without a store query",
        ))?;
        let auth_cache_misses = IntCounter::with_opts(Opts::new(
            "gateway_auth_cache_misses_total",
            "Authentication cache lookups that required a store query",
        ))?;
        let auth_store_errors = IntCounter::with_opts(Opts::new(
            "gateway_auth_store_errors_total",
            "Key store queries that failed or timed out during a cache miss",
        ))?;
        registry.register(Box::new(auth_cache_hits.clone()))?;
        registry.register(Box::new(auth_cache_misses.clone()))?;
        registry.register(Box::new(auth_store_errors.clone()))?;

        let rate_limit_checks = IntCounterVec::new(
            Opts::new("gateway_rate_limit_checks_total", "Total rate limit checks"),
            &["result"],
        )?;
        let rate_limit_denials = IntCounterVec::new(
            Opts::new("gateway_rate_limit_denials_total", "Rate limit denials by window"),
            &["limit_type"],
        )?;
        let rate_limit_fail_open = IntCounter::with_opts(Opts::new(
            "gateway_rate_limit_fail_open_total",
            "Requests admitted because the rate limit store was unreachable",
        ))?;
        let rate_limit_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_rate_limiter_decision_seconds",
            "Time spent evaluating the rate limit script",
        ))?;
        registry.register(Box::new(rate_limit_checks.clone()))?;
        registry.register(Box::new(rate_limit_denials.clone()))?;
        registry.register(Box::new(rate_limit_fail_open.clone()))?;
        registry.register(Box::new(rate_limit_latency.clone()))?;

        let proxy_requests = IntCounterVec::new(
            Opts::new("gateway_proxy_requests_total", "Proxied requests by target service and status class"),
            &["service", "status_class"],
        )?;
        let proxy_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_proxy_upstream_seconds",
            "Time spent waiting on the upstream response",
        ))?;
        registry.register(Box::new(proxy_requests.clone()))?;
        registry.register(Box::new(proxy_latency.clone()))?;

        let usage_events_dropped = IntCounter::with_opts(Opts::new(
            "gateway_usage_events_dropped_total",
            "Usage events dropped because the producer buffer was full",
        ))?;
        let usage_buffer_capacity = IntGauge::with_opts(Opts::new(
            "gateway_usage_buffer_capacity",
            "Configured capacity of the usage event producer buffer",
        ))?;
        registry.register(Box::new(usage_events_dropped.clone()))?;
        registry.register(Box::new(usage_buffer_capacity.clone()))?;

        Ok(Self {
            registry,
            auth_cache_hits,
            auth_cache_misses,
            auth_store_errors,
            rate_limit_checks,
            rate_limit_denials,
            rate_limit_fail_open,
            rate_limit_latency,
            proxy_requests,
            proxy_latency,
            usage_events_dropped,
            usage_buffer_capacity,
        })
    }

    pub fn inc_auth_cache_hit(&self) {
        self.auth_cache_hits.inc();
    }

    pub fn inc_auth_cache_miss(&self) {
        self.auth_cache_misses.inc();
    }

    pub fn inc_auth_store_error(&self) {
        self.auth_store_errors.inc();
    }

    pub fn record_rate_check(&self, allowed: bool) {
        let result = if allowed { "allowed" } else { "denied" };
        self.rate_limit_checks.with_label_values(&[result]).inc();
    }

    pub fn record_rate_denial(&self, limit_type: &str) {
        self.rate_limit_denials.with_label_values(&[limit_type]).inc();
    }

    pub fn inc_rate_limit_fail_open(&self) {
        self.rate_limit_fail_open.inc();
    }

    pub fn observe_rate_limit_latency(&self, secs: f64) {
        self.rate_limit_latency.observe(secs);
    }

    pub fn record_proxy_request(&self, service: &str, status: StatusCode) {
        let status_class = match status.as_u16() {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.proxy_requests.with_label_values(&[service, status_class]).inc();
    }

    pub fn observe_proxy_latency(&self, secs: f64) {
        self.proxy_latency.observe(secs);
    }

    pub fn inc_usage_events_dropped(&self) {
        self.usage_events_dropped.inc();
    }

    pub fn set_usage_buffer_capacity(&self, capacity: usize) {
        self.usage_buffer_capacity.set(capacity as i64);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
