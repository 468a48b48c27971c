use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common_usage_events::UsageEvent;
use futures_util::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, TopicPartitionList};
use tracing::{error, info, warn};
use usage_processor::config::ProcessorConfig;
use usage_processor::dedup::DedupGuard;
use usage_processor::metrics::ProcessorMetrics;
use usage_processor::writer;

#[derive(Clone)]
struct HttpState {
    metrics: Arc<ProcessorMetrics>,
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<HttpState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            error!(?err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins when present; otherwise fall back to LOG_LEVEL, then "info".
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .init();

    let config = ProcessorConfig::from_env()?;
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let metrics = Arc::new(ProcessorMetrics::new()?);
    let dedup = DedupGuard::new(config.dedup_window);
    dedup.clone().spawn_sweeper();

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("group.id", &config.kafka_group_id)
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", &config.kafka_auto_offset_reset)
        .create()?;
    consumer.subscribe(&[config.kafka_topic.as_str()])?;

    let http_state = HttpState { metrics: metrics.clone() };
    let http_addr = format!("{}:{}", config.http_host, config.http_port);
    tokio::spawn(async move {
        let app = Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_endpoint))
            .with_state(http_state);
        match tokio::net::TcpListener::bind(&http_addr).await {
            Ok(listener) => {
                info!(addr = %http_addr, "usage-processor http server listening");
                if let Err(err) = axum::serve(listener, app).await {
                    error!(?err, "http server exited");
                }
            }
            Err(err) => error!(?err, addr = %http_addr, "failed to bind http server"),
        }
    });

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let batch_size = config.batch_size;
    let batch_timeout = config.batch_timeout;
    let mut stream = consumer.stream();
    let mut batch: Vec<UsageEvent> = Vec::with_capacity(batch_size);
    let mut offsets = TopicPartitionList::new();
    let mut batch_started_at = Instant::now();
    let mut ticker = tokio::time::interval(batch_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, flushing in-flight batch");
                    flush(&db_pool, &consumer, &mut batch, &mut offsets, &metrics).await;
                    break;
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() && batch_started_at.elapsed() >= batch_timeout {
                    flush(&db_pool, &consumer, &mut batch, &mut offsets, &metrics).await;
                    batch_started_at = Instant::now();
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(m)) => {
                        let topic = m.topic().to_string();
                        if let Ok((_, high)) = consumer.fetch_watermarks(&topic, m.partition(), Duration::from_millis(50)) {
                            metrics.set_consumer_lag(high.saturating_sub(m.offset() + 1));
                        }
                        if let Some(Ok(payload)) = m.payload_view::<str>() {
                            match serde_json::from_str::<UsageEvent>(payload) {
                                Ok(event) => {
                                    if batch.is_empty() {
                                        batch_started_at = Instant::now();
                                    }
                                    if !dedup.check_and_record(event.request_id).await {
                                        batch.push(event);
                                    }
                                    offsets.add_partition_offset(
                                        m.topic(),
                                        m.partition(),
                                        rdkafka::Offset::Offset(m.offset()),
                                    ).ok();
                                }
                                Err(err) => {
                                    warn!(?err, "failed to parse usage event, skipping record");
                                    metrics.inc_parse_error();
                                }
                            }
                        }
                        metrics.set_dedup_map_size(dedup.len().await as i64);
                        if batch.len() >= batch_size {
                            flush(&db_pool, &consumer, &mut batch, &mut offsets, &metrics).await;
                            batch_started_at = Instant::now();
                        }
                    }
                    Some(Err(err)) => warn!(?err, "kafka consumer error"),
                    None => {
                        info!("consumer stream ended");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Writes the accumulated batch and, only on success, commits the offsets
/// that cover it. A failed write leaves offsets uncommitted so the batch is
/// redelivered on the next poll rather than silently lost.
async fn flush(
    db_pool: &sqlx::PgPool,
    consumer: &StreamConsumer,
    batch: &mut Vec<UsageEvent>,
    offsets: &mut TopicPartitionList,
    metrics: &ProcessorMetrics,
) {
    if batch.is_empty() {
        return;
    }
    let start = Instant::now();
    match writer::write_batch(db_pool, batch).await {
        Ok(outcome) => {
            metrics.observe_batch_write_latency(start.elapsed().as_secs_f64());
            metrics.record_batch(outcome.inserted as u64, outcome.duplicates() as u64);
            if let Err(err) = consumer.commit(offsets, CommitMode::Sync) {
                error!(?err, "failed to commit offsets after successful batch write");
            }
            info!(attempted = outcome.attempted, inserted = outcome.inserted, "batch written");
        }
        Err(err) => {
            metrics.inc_batch_write_failure();
            error!(?err, batch_len = batch.len(), "batch write failed, offsets not committed");
        }
    }
    batch.clear();
    *offsets = TopicPartitionList::new();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received sigterm"),
    }
}
