use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::{CachedKey, KeyCache};
use crate::rate_limiter::RateLimitConfig;

/// Plan-tier defaults applied when an organization has no row in
/// `rate_limit_configs`. Kept as a static table rather than a query so a
/// cache miss never needs a second round-trip to discover defaults.
fn plan_defaults(plan: &str) -> RateLimitConfig {
    match plan {
        "enterprise" => RateLimitConfig { per_minute: 6000, per_day: 5_000_000, burst: 600 },
        "growth" => RateLimitConfig { per_minute: 600, per_day: 500_000, burst: 60 },
        "starter" => RateLimitConfig { per_minute: 120, per_day: 50_000, burst: 12 },
        _ => RateLimitConfig { per_minute: 30, per_day: 5_000, burst: 3 },
    }
}

const KEY_ROW_QUERY: &str = r#"
SELECT
    k.id AS api_key_id,
    k.key_hash,
    k.organization_id,
    o.plan_tier,
    r.per_minute,
    r.per_day,
    r.burst
FROM api_keys k
JOIN organizations o ON o.id = k.organization_id
LEFT JOIN rate_limit_configs r ON r.organization_id = k.organization_id
WHERE k.active
  AND k.revoked_at IS NULL
  AND (k.expires_at IS NULL OR k.expires_at > now())
  AND o.active
"#;

fn row_to_cached_key(row: &sqlx::postgres::PgRow, ttl: Duration) -> CachedKey {
    let plan_tier: String = row.try_get("plan_tier").unwrap_or_else(|_| "free".to_string());
    let rate_limit = match (
        row.try_get::<Option<i32>, _>("per_minute"),
        row.try_get::<Option<i32>, _>("per_day"),
        row.try_get::<Option<i32>, _>("burst"),
    ) {
        (Ok(Some(per_minute)), Ok(Some(per_day)), Ok(burst)) => RateLimitConfig {
            per_minute: per_minute.max(0) as u32,
            per_day: per_day.max(0) as u32,
            burst: burst.unwrap_or(0).max(0) as u32,
        },
        _ => plan_defaults(&plan_tier),
    };
    CachedKey {
        api_key_id: row.get("api_key_id"),
        organization_id: row.get("organization_id"),
        rate_limit,
        expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
    }
}

/// Bulk snapshot of every currently-valid key, used both to warm the
/// cache lazily on miss population and by the periodic refresher.
pub async fn load_all_active(pool: &PgPool, ttl: Duration) -> Result<HashMap<String, CachedKey>> {
    let rows = sqlx::query(KEY_ROW_QUERY).fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| {
            let hash: String = row.get("key_hash");
            (hash, row_to_cached_key(row, ttl))
        })
        .collect())
}

/// Looks up a single key by digest, querying the store on a cache miss
/// within the auth-store deadline. The distinction between "not found"
/// and "store unreachable" matters: the former is a 403, the latter must
/// fail closed with a 500 rather than be mistaken for an invalid key.
pub enum LookupOutcome {
    Found(CachedKey),
    NotFound,
    Transient,
}

pub async fn lookup(
    pool: &PgPool,
    cache: &KeyCache,
    digest: &str,
    ttl: Duration,
    store_timeout: Duration,
) -> LookupOutcome {
    {
        let guard = cache.read().await;
        if let Some(cached) = guard.get(digest) {
            if cached.expires_at > Utc::now() {
                return LookupOutcome::Found(cached.clone());
            }
        }
    }

    let query = format!("{KEY_ROW_QUERY} AND k.key_hash = $1");
    let row = tokio::time::timeout(store_timeout, sqlx::query(&query).bind(digest).fetch_optional(pool)).await;

    match row {
        Ok(Ok(Some(row))) => {
            let cached = row_to_cached_key(&row, ttl);
            cache.write().await.insert(digest.to_string(), cached.clone());
            LookupOutcome::Found(cached)
        }
        Ok(Ok(None)) => LookupOutcome::NotFound,
        Ok(Err(err)) => {
            warn!(?err, "key store query failed during auth cache miss");
            LookupOutcome::Transient
        }
        Err(_) => {
            warn!("key store query exceeded auth store timeout");
            LookupOutcome::Transient
        }
    }
}

/// Background task that replaces the whole cache snapshot every refresh
/// interval. The swap is a single write-lock acquisition, so readers
/// never observe a torn mix of old and new entries.
pub fn spawn_refresher(pool: PgPool, cache: KeyCache, ttl: Duration, refresh_interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match load_all_active(&pool, ttl).await {
                Ok(latest) => {
                    let count = latest.len();
                    let mut guard = cache.write().await;
                    *guard = latest;
                    debug!(count, "refreshed api key cache");
                }
                Err(err) => {
                    warn!(?err, "failed to refresh api key cache; keeping prior snapshot");
                }
            }
        }
    });
}

pub async fn warm(pool: &PgPool, ttl: Duration) -> Result<KeyCache> {
    let initial = load_all_active(pool, ttl)
        .await
        .context("initial api key cache load failed")?;
    Ok(std::sync::Arc::new(tokio::sync::RwLock::new(initial)))
}

pub fn digest(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_hex_encoded() {
        let a = digest("sk_live_abc123");
        let b = digest("sk_live_abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn plan_defaults_are_ordered_by_tier() {
        let free = plan_defaults("free");
        let starter = plan_defaults("starter");
        let growth = plan_defaults("growth");
        let enterprise = plan_defaults("enterprise");
        assert!(free.per_minute < starter.per_minute);
        assert!(starter.per_minute < growth.per_minute);
        assert!(growth.per_minute < enterprise.per_minute);
    }

    #[test]
    fn unknown_plan_falls_back_to_free() {
        assert_eq!(plan_defaults("mystery").per_minute, plan_defaults("free").per_minute);
    }
}
