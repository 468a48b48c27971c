use anyhow::Context;
use axum::{middleware as axum_middleware, routing::get, Router};
use gateway::app_state::AppState;
use gateway::config::GatewayConfig;
use gateway::key_cache;
use gateway::metrics::GatewayMetrics;
use gateway::middleware::{auth_and_rate_limit_middleware, health, logging_middleware, metrics_endpoint, recovery_middleware};
use gateway::proxy::proxy_handler;
use gateway::rate_limiter::RedisRateLimiter;
use gateway::usage_producer::UsageProducer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins when present (the tracing-ecosystem convention); otherwise
    // fall back to the gateway's own LOG_LEVEL env var, then "info".
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).json().init();

    let config = Arc::new(GatewayConfig::from_env()?);

    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to key store")?;

    let key_cache = key_cache::warm(&db_pool, config.key_cache_ttl).await?;
    info!(count = key_cache.read().await.len(), "warmed api key cache");
    key_cache::spawn_refresher(db_pool.clone(), key_cache.clone(), config.key_cache_ttl, config.key_refresh_interval);

    let rate_limiter: Arc<dyn gateway::rate_limiter::RateLimiterEngine> = Arc::new(
        RedisRateLimiter::new(
            &config.redis_addr,
            config.redis_password.as_deref(),
            config.redis_db,
            config.rate_limit_script_timeout,
        )
        .await
        .context("failed to connect to rate limit store")?,
    );

    let metrics = Arc::new(GatewayMetrics::new()?);

    let usage = if config.kafka_enabled {
        #[cfg(feature = "kafka-producer")]
        {
            UsageProducer::new_kafka(
                &config.kafka_brokers,
                config.kafka_topic.clone(),
                config.kafka_buffer_size,
                config.kafka_batch_size,
                config.kafka_flush_interval,
                metrics.clone(),
            )
            .context("failed to create kafka usage producer")?
        }
        #[cfg(not(feature = "kafka-producer"))]
        {
            tracing::warn!("KAFKA_ENABLED=true but binary was built without the kafka-producer feature; usage events will be dropped");
            UsageProducer::new_noop(
                config.kafka_buffer_size,
                config.kafka_batch_size,
                config.kafka_flush_interval,
                metrics.clone(),
            )
        }
    } else {
        UsageProducer::new_noop(
            config.kafka_buffer_size,
            config.kafka_batch_size,
            config.kafka_flush_interval,
            metrics.clone(),
        )
    };

    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build upstream http client")?;

    let state = AppState {
        db_pool,
        key_cache,
        rate_limiter,
        metrics,
        usage,
        config: config.clone(),
        http_client,
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let protected = Router::new()
        .route(
            "/*path",
            get(proxy_handler)
                .post(proxy_handler)
                .put(proxy_handler)
                .patch(proxy_handler)
                .delete(proxy_handler),
        )
        .layer(axum_middleware::from_fn_with_state(state.clone(), auth_and_rate_limit_middleware))
        .with_state(state.clone());

    let public = Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(health))
        .route("/health/live", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state.clone());

    let app = public
        .merge(protected)
        .layer(cors)
        .layer(axum_middleware::from_fn(logging_middleware))
        .layer(axum_middleware::from_fn(common_http_errors::http_error_metrics_layer("gateway")))
        .layer(axum_middleware::from_fn_with_state(state.clone(), recovery_middleware));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "starting gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.usage.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining in-flight requests");
}
