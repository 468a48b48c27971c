//! Standalone smoke check: builds a `GatewayMetrics` registry in isolation
//! (no network, no database) and asserts the exposition text contains the
//! metric names operators are expected to alert on. Run with `cargo run
//! --bin metrics_smoke` as a quick sanity check after changing metrics.rs.

use gateway::metrics::GatewayMetrics;

const REQUIRED_METRICS: &[&str] = &[
    "gateway_auth_cache_hits_total",
    "gateway_auth_cache_misses_total",
    "gateway_auth_store_errors_total",
    "gateway_rate_limit_checks_total",
    "gateway_rate_limit_denials_total",
    "gateway_rate_limit_fail_open_total",
    "gateway_proxy_requests_total",
    "gateway_usage_events_dropped_total",
];

fn main() -> anyhow::Result<()> {
    let metrics = GatewayMetrics::new()?;
    // Touch every metric once so it appears in the exposition even before
    // any real traffic has incremented it.
    metrics.inc_auth_cache_hit();
    metrics.inc_auth_cache_miss();
    metrics.inc_auth_store_error();
    metrics.record_rate_check(true);
    metrics.record_rate_denial("minute");
    metrics.inc_rate_limit_fail_open();
    metrics.record_proxy_request("orders", axum::http::StatusCode::OK);
    metrics.inc_usage_events_dropped();

    let response = metrics.render()?;
    let body = response.into_body();
    let bytes = futures::executor::block_on(async { axum::body::to_bytes(body, 1024 * 1024).await })?;
    let text = String::from_utf8(bytes.to_vec())?;

    let mut missing = Vec::new();
    for name in REQUIRED_METRICS {
        if !text.contains(name) {
            missing.push(*name);
        }
    }
    if !missing.is_empty() {
        anyhow::bail!("missing expected metrics: {missing:?}");
    }

    println!("all {} expected metrics present", REQUIRED_METRICS.len());
    Ok(())
}
