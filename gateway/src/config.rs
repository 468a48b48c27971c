use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Gateway-wide configuration, loaded once at startup from the process
/// environment. Every field has either a required source env var or a
/// sane default; nothing here is re-read per request.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    pub database_url: String,
    pub db_max_connections: u32,

    pub redis_addr: String,
    pub redis_password: Option<String>,
    pub redis_db: i64,

    pub backend_urls: HashMap<String, String>,

    pub kafka_enabled: bool,
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_batch_size: usize,
    pub kafka_flush_interval: Duration,
    pub kafka_buffer_size: usize,

    pub key_cache_ttl: Duration,
    pub key_refresh_interval: Duration,

    pub rate_limit_script_timeout: Duration,
    pub auth_store_timeout: Duration,
    pub proxy_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let host = env::var("GATEWAY_HOST")
            .or_else(|_| env::var("HOST"))
            .unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("GATEWAY_PORT")
            .or_else(|_| env::var("PORT"))
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8080);

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let db_max_connections = env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);

        let redis_addr = env::var("REDIS_ADDR").context("REDIS_ADDR must be set")?;
        let redis_password = env::var("REDIS_PASSWORD").ok();
        let redis_db = env::var("REDIS_DB")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        let backend_urls = parse_backend_urls(
            &env::var("BACKEND_URLS").context("BACKEND_URLS must be set (name=url,...)")?,
        )?;

        let kafka_enabled = env::var("KAFKA_ENABLED")
            .ok()
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let kafka_brokers =
            env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
        let kafka_topic = env::var("KAFKA_TOPIC").unwrap_or_else(|_| "usage-events".to_string());
        let kafka_batch_size = env::var("KAFKA_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(100);
        let kafka_flush_interval_ms = env::var("KAFKA_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(500);
        let kafka_buffer_size = env::var("KAFKA_BUFFER_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1000);

        let key_cache_ttl_secs = env::var("KEY_CACHE_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(900);
        let key_refresh_secs = env::var("KEY_REFRESH_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(key_cache_ttl_secs)
            .max(10);

        let rate_limit_script_timeout_ms = env::var("RATE_LIMIT_SCRIPT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(100);
        let auth_store_timeout_ms = env::var("AUTH_STORE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(2000);
        let proxy_timeout_ms = env::var("PROXY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000);

        Ok(Self {
            host,
            port,
            database_url,
            db_max_connections,
            redis_addr,
            redis_password,
            redis_db,
            backend_urls,
            kafka_enabled,
            kafka_brokers,
            kafka_topic,
            kafka_batch_size,
            kafka_flush_interval: Duration::from_millis(kafka_flush_interval_ms),
            kafka_buffer_size,
            key_cache_ttl: Duration::from_secs(key_cache_ttl_secs.max(1)),
            key_refresh_interval: Duration::from_secs(key_refresh_secs),
            rate_limit_script_timeout: Duration::from_millis(rate_limit_script_timeout_ms),
            auth_store_timeout: Duration::from_millis(auth_store_timeout_ms),
            proxy_timeout: Duration::from_millis(proxy_timeout_ms),
        })
    }
}

fn parse_backend_urls(raw: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, url) = entry
            .split_once('=')
            .with_context(|| format!("invalid BACKEND_URLS entry: {entry}"))?;
        map.insert(name.trim().to_string(), url.trim().trim_end_matches('/').to_string());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_backends() {
        let map = parse_backend_urls("orders=http://orders:8081,payments=http://payments:8082/").unwrap();
        assert_eq!(map.get("orders").unwrap(), "http://orders:8081");
        assert_eq!(map.get("payments").unwrap(), "http://payments:8082");
    }

    #[test]
    fn rejects_entry_without_equals() {
        assert!(parse_backend_urls("orders").is_err());
    }
}
