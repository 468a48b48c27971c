use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Per-organization limits. Absent rows fall back to a plan-tier default
/// supplied by the caller; this type itself carries no notion of plan.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_day: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub minute_used: i64,
    pub day_used: i64,
    pub minute_limit: i64,
    pub day_limit: i64,
    pub minute_reset: DateTime<Utc>,
    pub day_reset: DateTime<Utc>,
    /// Which window caused a denial; `None` when `allowed`.
    pub limit_type: Option<&'static str>,
}

impl RateDecision {
    pub fn minute_remaining(&self) -> i64 {
        (self.minute_limit - self.minute_used).max(0)
    }

    pub fn day_remaining(&self) -> i64 {
        (self.day_limit - self.day_used).max(0)
    }
}

#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, organization_id: Uuid, cfg: RateLimitConfig) -> Result<RateDecision>;
}

/// Atomically increments the minute and day counters for an organization
/// in a single Lua script, and compensates (decrements) any counter that
/// pushed the request over its limit so denied requests don't permanently
/// consume quota for the rest of the window.
const CHECK_SCRIPT: &str = r#"
local minute_count = redis.call('INCR', KEYS[1])
if minute_count == 1 then
    redis.call('EXPIRE', KEYS[1], 60)
end
local day_count = redis.call('INCR', KEYS[2])
if day_count == 1 then
    redis.call('EXPIRE', KEYS[2], 86400)
end

local minute_limit = tonumber(ARGV[1])
local day_limit = tonumber(ARGV[2])
local limit_type = "none"

if minute_count > minute_limit then
    redis.call('DECR', KEYS[1])
    minute_count = minute_count - 1
    limit_type = "minute"
end
if day_count > day_limit then
    redis.call('DECR', KEYS[2])
    day_count = day_count - 1
    if limit_type == "none" then
        limit_type = "day"
    end
end

local minute_ttl = redis.call('TTL', KEYS[1])
local day_ttl = redis.call('TTL', KEYS[2])
return {minute_count, day_count, minute_ttl, day_ttl, limit_type}
"#;

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    script: Arc<Script>,
    prefix: String,
    timeout: Duration,
}

impl RedisRateLimiter {
    pub async fn new(redis_addr: &str, password: Option<&str>, db: i64, timeout: Duration) -> Result<Self> {
        let url = build_redis_url(redis_addr, password, db);
        let client = redis::Client::open(url).context("failed to create redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("failed to create redis connection manager")?;
        Ok(Self {
            manager,
            script: Arc::new(Script::new(CHECK_SCRIPT)),
            prefix: "gateway:rl".to_string(),
            timeout,
        })
    }
}

fn build_redis_url(addr: &str, password: Option<&str>, db: i64) -> String {
    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        return addr.to_string();
    }
    match password {
        Some(pw) if !pw.is_empty() => format!("redis://:{pw}@{addr}/{db}"),
        _ => format!("redis://{addr}/{db}"),
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, organization_id: Uuid, cfg: RateLimitConfig) -> Result<RateDecision> {
        let minute_key = format!("{}:{}:minute", self.prefix, organization_id);
        let day_key = format!("{}:{}:day", self.prefix, organization_id);
        let mut conn = self.manager.clone();
        let minute_allowance = cfg.per_minute as i64 + cfg.burst as i64;
        let day_allowance = cfg.per_day as i64;

        let fut = self
            .script
            .key(&minute_key)
            .key(&day_key)
            .arg(minute_allowance)
            .arg(day_allowance)
            .invoke_async::<_, (i64, i64, i64, i64, String)>(&mut conn);

        let (minute_used, day_used, minute_ttl, day_ttl, limit_type) =
            tokio::time::timeout(self.timeout, fut)
                .await
                .context("rate limiter script timed out")?
                .context("rate limiter script failed")?;

        let now = Utc::now();
        let limit_type = match limit_type.as_str() {
            "minute" => Some("minute"),
            "day" => Some("day"),
            _ => None,
        };

        Ok(RateDecision {
            allowed: limit_type.is_none(),
            minute_used,
            day_used,
            minute_limit: minute_allowance,
            day_limit: day_allowance,
            minute_reset: now + chrono::Duration::seconds(minute_ttl.max(0)),
            day_reset: now + chrono::Duration::seconds(day_ttl.max(0)),
            limit_type,
        })
    }
}

/// Drop-in substitute for tests and local development without a Redis
/// instance. Not safe across process boundaries; single-process only.
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    inner: Arc<Mutex<HashMap<(Uuid, &'static str), (i64, std::time::Instant)>>>,
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    async fn bump(&self, organization_id: Uuid, window: &'static str, window_secs: u64) -> i64 {
        let mut guard = self.inner.lock().await;
        let now = std::time::Instant::now();
        let entry = guard
            .entry((organization_id, window))
            .or_insert((0, now));
        if now.duration_since(entry.1) >= std::time::Duration::from_secs(window_secs) {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0
    }

    async fn unbump(&self, organization_id: Uuid, window: &'static str) {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get_mut(&(organization_id, window)) {
            entry.0 = (entry.0 - 1).max(0);
        }
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, organization_id: Uuid, cfg: RateLimitConfig) -> Result<RateDecision> {
        let minute_allowance = cfg.per_minute as i64 + cfg.burst as i64;
        let day_allowance = cfg.per_day as i64;

        let minute_used = self.bump(organization_id, "minute", 60).await;
        let day_used = self.bump(organization_id, "day", 86_400).await;

        let mut limit_type = None;
        let mut minute_used = minute_used;
        let mut day_used = day_used;
        if minute_used > minute_allowance {
            self.unbump(organization_id, "minute").await;
            minute_used -= 1;
            limit_type = Some("minute");
        }
        if day_used > day_allowance {
            self.unbump(organization_id, "day").await;
            day_used -= 1;
            if limit_type.is_none() {
                limit_type = Some("day");
            }
        }

        let now = Utc::now();
        Ok(RateDecision {
            allowed: limit_type.is_none(),
            minute_used,
            day_used,
            minute_limit: minute_allowance,
            day_limit: day_allowance,
            minute_reset: now + chrono::Duration::seconds(60),
            day_reset: now + chrono::Duration::seconds(86_400),
            limit_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_minute_plus_burst_then_denies() {
        let limiter = InMemoryRateLimiter::new();
        let org = Uuid::new_v4();
        let cfg = RateLimitConfig { per_minute: 2, per_day: 1000, burst: 1 };

        for _ in 0..3 {
            let decision = limiter.check(org, cfg).await.unwrap();
            assert!(decision.allowed);
        }
        let decision = limiter.check(org, cfg).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit_type, Some("minute"));
    }

    #[tokio::test]
    async fn denial_compensates_so_window_is_not_exhausted_permanently() {
        let limiter = InMemoryRateLimiter::new();
        let org = Uuid::new_v4();
        let cfg = RateLimitConfig { per_minute: 1, per_day: 1000, burst: 0 };

        assert!(limiter.check(org, cfg).await.unwrap().allowed);
        let denied = limiter.check(org, cfg).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.minute_used, 1);
    }

    #[tokio::test]
    async fn zero_burst_is_strict_per_minute() {
        let limiter = InMemoryRateLimiter::new();
        let org = Uuid::new_v4();
        let cfg = RateLimitConfig { per_minute: 1, per_day: 1000, burst: 0 };

        assert!(limiter.check(org, cfg).await.unwrap().allowed);
        assert!(!limiter.check(org, cfg).await.unwrap().allowed);
    }
}
