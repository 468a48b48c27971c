use common_usage_events::UsageEvent;
use sqlx::PgPool;

/// Result of attempting to persist a batch.
pub struct WriteOutcome {
    pub attempted: usize,
    pub inserted: usize,
}

impl WriteOutcome {
    pub fn duplicates(&self) -> usize {
        self.attempted.saturating_sub(self.inserted)
    }
}

/// Bulk-inserts a batch of usage events in a single statement inside one
/// transaction. Rows that collide with an already-ingested `request_id`
/// are silently skipped by `ON CONFLICT ... DO NOTHING`; any other error
/// aborts the transaction so the caller does not commit a Kafka offset for
/// a batch that was never durably written.
pub async fn write_batch(pool: &PgPool, batch: &[UsageEvent]) -> anyhow::Result<WriteOutcome> {
    if batch.is_empty() {
        return Ok(WriteOutcome { attempted: 0, inserted: 0 });
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;

    // sqlx's query! macros need a live database at compile time, which this
    // workspace never has available; a hand-built multi-row VALUES list
    // keeps the batch to one round trip without that requirement.
    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO usage_events (time, request_id, organization_id, api_key_id, endpoint, method, status_code, response_time_ms, billable, weight) ",
    );
    qb.push_values(batch, |mut b, event| {
        b.push_bind(event.time)
            .push_bind(event.request_id)
            .push_bind(event.organization_id)
            .push_bind(event.api_key_id)
            .push_bind(&event.endpoint)
            .push_bind(&event.method)
            .push_bind(event.status_code as i32)
            .push_bind(event.response_time_ms as i32)
            .push_bind(event.billable)
            .push_bind(event.weight as i32);
    });
    qb.push(" ON CONFLICT (request_id) DO NOTHING");

    let result = qb.build().execute(&mut *tx).await?;
    inserted += result.rows_affected() as usize;

    tx.commit().await?;

    Ok(WriteOutcome { attempted: batch.len(), inserted })
}
