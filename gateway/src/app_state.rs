use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::rate_limiter::{RateLimitConfig, RateLimiterEngine};
use crate::usage_producer::UsageProducer;

/// Cached projection of an `api_keys` row joined with its effective
/// `rate_limit_configs` row (or plan-tier default). Keyed by the hex
/// SHA-256 digest of the bearer token in [`AppState::key_cache`].
#[derive(Debug, Clone)]
pub struct CachedKey {
    pub api_key_id: Uuid,
    pub organization_id: Uuid,
    pub rate_limit: RateLimitConfig,
    pub expires_at: DateTime<Utc>,
}

pub type KeyCache = Arc<tokio::sync::RwLock<std::collections::HashMap<String, CachedKey>>>;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub key_cache: KeyCache,
    pub rate_limiter: Arc<dyn RateLimiterEngine>,
    pub metrics: Arc<GatewayMetrics>,
    pub usage: UsageProducer,
    pub config: Arc<GatewayConfig>,
    pub http_client: reqwest::Client,
}
