use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct ProcessorMetrics {
    registry: Registry,

    events_ingested: IntCounter,
    events_duplicate: IntCounter,
    events_parse_errors: IntCounter,
    batches_written: IntCounter,
    batch_write_failures: IntCounter,
    batch_write_latency: Histogram,
    consumer_lag: IntGauge,
    dedup_map_size: IntGauge,
}

impl ProcessorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_ingested = IntCounter::with_opts(Opts::new(
            "usage_processor_events_ingested_total",
            "Usage events durably written to the usage store",
        ))?;
        let events_duplicate = IntCounter::with_opts(Opts::new(
            "usage_processor_events_duplicate_total",
            "Usage events skipped because their request_id was already stored",
        ))?;
        let events_parse_errors = IntCounter::with_opts(Opts::new(
            "usage_processor_events_parse_errors_total",
            "Kafka records that failed to deserialize as a usage event",
        ))?;
        registry.register(Box::new(events_ingested.clone()))?;
        registry.register(Box::new(events_duplicate.clone()))?;
        registry.register(Box::new(events_parse_errors.clone()))?;

        let batches_written = IntCounter::with_opts(Opts::new(
            "usage_processor_batches_written_total",
            "Batches successfully committed to the usage store",
        ))?;
        let batch_write_failures = IntCounter::with_opts(Opts::new(
            "usage_processor_batch_write_failures_total",
            "Batches whose transaction failed and were not committed",
        ))?;
        let batch_write_latency = Histogram::with_opts(HistogramOpts::new(
            "usage_processor_batch_write_seconds",
            "Time spent writing a batch to the usage store",
        ))?;
        registry.register(Box::new(batches_written.clone()))?;
        registry.register(Box::new(batch_write_failures.clone()))?;
        registry.register(Box::new(batch_write_latency.clone()))?;

        let consumer_lag = IntGauge::with_opts(Opts::new(
            "usage_processor_consumer_lag",
            "Last observed high-watermark minus current offset",
        ))?;
        let dedup_map_size = IntGauge::with_opts(Opts::new(
            "usage_processor_dedup_map_size",
            "Entries currently held in the in-process dedup guard",
        ))?;
        registry.register(Box::new(consumer_lag.clone()))?;
        registry.register(Box::new(dedup_map_size.clone()))?;

        Ok(Self {
            registry,
            events_ingested,
            events_duplicate,
            events_parse_errors,
            batches_written,
            batch_write_failures,
            batch_write_latency,
            consumer_lag,
            dedup_map_size,
        })
    }

    pub fn record_batch(&self, inserted: u64, duplicates: u64) {
        self.events_ingested.inc_by(inserted);
        self.events_duplicate.inc_by(duplicates);
        self.batches_written.inc();
    }

    pub fn inc_batch_write_failure(&self) {
        self.batch_write_failures.inc();
    }

    pub fn inc_parse_error(&self) {
        self.events_parse_errors.inc();
    }

    pub fn observe_batch_write_latency(&self, secs: f64) {
        self.batch_write_latency.observe(secs);
    }

    pub fn set_consumer_lag(&self, lag: i64) {
        self.consumer_lag.set(lag);
    }

    pub fn set_dedup_map_size(&self, size: i64) {
        self.dedup_map_size.set(size);
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
