use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub database_url: String,
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_auto_offset_reset: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub dedup_window: Duration,
    pub http_host: String,
    pub http_port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl ProcessorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        Ok(Self {
            database_url,
            kafka_brokers: env_or("KAFKA_BROKERS", "localhost:9092"),
            kafka_topic: env_or("KAFKA_TOPIC", "usage-events"),
            kafka_group_id: env_or("KAFKA_GROUP_ID", "usage-processor"),
            kafka_auto_offset_reset: env_or("KAFKA_AUTO_OFFSET_RESET", "earliest"),
            batch_size: env_parse("BATCH_SIZE", 1000usize).clamp(1, 10_000),
            batch_timeout: Duration::from_secs(env_parse("BATCH_TIMEOUT", 5u64)),
            dedup_window: Duration::from_secs(env_parse("DEDUP_WINDOW", 300u64)),
            http_host: env_or("HTTP_HOST", "0.0.0.0"),
            http_port: env_parse("HTTP_PORT", 8090u16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_is_clamped_to_a_sane_range() {
        std::env::set_var("DATABASE_URL", "postgres://x");
        std::env::set_var("BATCH_SIZE", "0");
        let cfg = ProcessorConfig::from_env().unwrap();
        assert_eq!(cfg.batch_size, 1);
        std::env::remove_var("BATCH_SIZE");
        std::env::remove_var("DATABASE_URL");
    }
}
