use common_usage_events::UsageEvent;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::metrics::GatewayMetrics;

#[cfg(feature = "kafka-producer")]
use rdkafka::producer::{FutureProducer, FutureRecord};

/// Bound on how long `close` waits for the flusher to drain its final
/// batch before giving up and returning anyway.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Non-blocking emitter for [`UsageEvent`]s. `record` is a `try_send`:
/// callers on the request path must never wait on the event bus. A
/// single flusher task owns the receiving end and batches by size or by
/// time, whichever comes first.
#[derive(Clone)]
pub struct UsageProducer {
    tx: mpsc::Sender<UsageEvent>,
    metrics: Arc<GatewayMetrics>,
    /// Join handle for the flusher task, shared across clones so whichever
    /// clone calls `close` can await the same drain regardless of how many
    /// `AppState` copies (one per in-flight request) briefly held a sender.
    flusher: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

enum Sink {
    #[cfg(feature = "kafka-producer")]
    Kafka { producer: FutureProducer, topic: String },
    Noop,
}

impl Sink {
    async fn publish(&self, batch: &[UsageEvent]) {
        match self {
            #[cfg(feature = "kafka-producer")]
            Sink::Kafka { producer, topic } => {
                for event in batch {
                    let payload = match serde_json::to_string(event) {
                        Ok(payload) => payload,
                        Err(err) => {
                            error!(?err, "failed to serialize usage event");
                            continue;
                        }
                    };
                    let key = event.organization_id.to_string();
                    let record = FutureRecord::to(topic).payload(&payload).key(&key);
                    if let Err((err, _)) = producer.send(record, Duration::from_secs(0)).await {
                        error!(?err, request_id = %event.request_id, "failed to publish usage event");
                    }
                }
            }
            Sink::Noop => {
                debug!(count = batch.len(), "usage events dropped: kafka disabled (no-op sink)");
            }
        }
    }
}

impl UsageProducer {
    #[cfg(feature = "kafka-producer")]
    pub fn new_kafka(
        brokers: &str,
        topic: String,
        buffer_size: usize,
        batch_size: usize,
        flush_interval: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> anyhow::Result<Self> {
        let producer: FutureProducer = rdkafka::ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("compression.type", "snappy")
            .create()?;
        Ok(Self::spawn(
            Sink::Kafka { producer, topic },
            buffer_size,
            batch_size,
            flush_interval,
            metrics,
        ))
    }

    pub fn new_noop(buffer_size: usize, batch_size: usize, flush_interval: Duration, metrics: Arc<GatewayMetrics>) -> Self {
        Self::spawn(Sink::Noop, buffer_size, batch_size, flush_interval, metrics)
    }

    fn spawn(
        sink: Sink,
        buffer_size: usize,
        batch_size: usize,
        flush_interval: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<UsageEvent>(buffer_size);
        metrics.set_usage_buffer_capacity(buffer_size);

        let handle = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(batch_size);
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                batch.push(event);
                                if batch.len() >= batch_size {
                                    sink.publish(&batch).await;
                                    batch.clear();
                                }
                            }
                            None => {
                                // Channel closed: drain whatever remains and exit.
                                if !batch.is_empty() {
                                    sink.publish(&batch).await;
                                }
                                debug!("usage producer flusher exiting: channel closed");
                                return;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if !batch.is_empty() {
                            sink.publish(&batch).await;
                            batch.clear();
                        }
                    }
                }
            }
        });

        Self { tx, metrics, flusher: Arc::new(Mutex::new(Some(handle))) }
    }

    /// Enqueues an event without blocking. On a full buffer the event is
    /// dropped and counted; the request path must never stall waiting
    /// for telemetry capacity.
    pub fn record(&self, event: UsageEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(request_id = %event.request_id, "usage event dropped: producer buffer full");
                self.metrics.inc_usage_events_dropped();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("usage event dropped: producer channel closed");
                self.metrics.inc_usage_events_dropped();
            }
        }
    }

    /// Closes the intake side so the flusher task observes `None` and
    /// performs its final drain-and-publish, then waits for that drain to
    /// finish within a bounded deadline so shutdown does not hang on a
    /// stuck publish.
    pub async fn close(self) {
        drop(self.tx);
        let handle = self.flusher.lock().expect("flusher handle lock poisoned").take();
        let Some(handle) = handle else { return };
        if tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE, handle).await.is_err() {
            warn!("usage producer flusher did not finish draining within the shutdown deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::GatewayMetrics;
    use uuid::Uuid;

    #[tokio::test]
    async fn close_drains_pending_events_without_waiting_for_the_flush_ticker() {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        // A long flush interval means the only thing that can possibly
        // drain these events before the process exits is the channel-close
        // branch triggered by `close`, not the ticker.
        let producer = UsageProducer::new_noop(10, 100, Duration::from_secs(30), metrics);
        for _ in 0..3 {
            producer.record(UsageEvent::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                "/orders",
                "GET",
                200,
                5,
            ));
        }

        let started = std::time::Instant::now();
        producer.close().await;
        assert!(started.elapsed() < SHUTDOWN_DRAIN_DEADLINE, "close should return once the flusher drains, not after the deadline");
    }
}
