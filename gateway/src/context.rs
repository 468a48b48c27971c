use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

/// Per-request ephemeral record threaded through the middleware chain as
/// an axum request extension. Each stage enriches it; none overwrites a
/// field an earlier stage already set.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,

    pub api_key_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub target_service: Option<String>,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_ip: String) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_ip,
            method,
            path,
            start_time: Instant::now(),
            started_at: Utc::now(),
            api_key_id: None,
            organization_id: None,
            target_service: None,
        }
    }

    pub fn elapsed_ms(&self) -> u32 {
        self.start_time.elapsed().as_millis().min(u32::MAX as u128) as u32
    }
}

/// Side channel that lets [`crate::middleware::recovery_middleware`] recover
/// the in-flight [`RequestContext`] across a `catch_unwind` boundary: the
/// panicking future consumes the `Request` it was given, so the context
/// can't be read back off it the way a normal response extension is. The
/// outermost middleware inserts an empty slot before calling `next.run`;
/// `auth_and_rate_limit_middleware` fills it right before handing the
/// request to the proxy handler, so it stays empty (and a panic stays
/// event-less) for any panic upstream of that point.
pub type PanicContextSlot = Arc<Mutex<Option<RequestContext>>>;
