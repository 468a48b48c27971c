use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire record published by the gateway for every proxied request and
/// consumed by the usage processor. `request_id` is the idempotency key
/// across the whole pipeline; the processor's unique constraint on it is
/// what turns at-least-once delivery into effectively-once persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageEvent {
    pub time: DateTime<Utc>,
    pub request_id: Uuid,
    pub organization_id: Uuid,
    pub api_key_id: Uuid,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u32,
    pub billable: bool,
    pub weight: u32,
}

impl UsageEvent {
    /// Status codes 200-499 are billed; 5xx is the gateway's own failure
    /// (or the upstream's) and is never charged to the tenant.
    pub fn billable_for_status(status_code: u16) -> bool {
        (200..500).contains(&status_code)
    }

    pub fn new(
        request_id: Uuid,
        organization_id: Uuid,
        api_key_id: Uuid,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        status_code: u16,
        response_time_ms: u32,
    ) -> Self {
        Self {
            time: Utc::now(),
            request_id,
            organization_id,
            api_key_id,
            endpoint: endpoint.into(),
            method: method.into(),
            status_code,
            response_time_ms,
            billable: Self::billable_for_status(status_code),
            weight: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billable_covers_2xx_through_4xx_only() {
        assert!(UsageEvent::billable_for_status(200));
        assert!(UsageEvent::billable_for_status(404));
        assert!(UsageEvent::billable_for_status(429));
        assert!(!UsageEvent::billable_for_status(500));
        assert!(!UsageEvent::billable_for_status(599));
    }

    #[test]
    fn new_sets_billable_from_status() {
        let evt = UsageEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "/orders",
            "GET",
            503,
            12,
        );
        assert!(!evt.billable);
        assert_eq!(evt.weight, 1);
    }

    #[test]
    fn round_trips_through_json() {
        let evt = UsageEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "/payments",
            "POST",
            200,
            42,
        );
        let encoded = serde_json::to_string(&evt).unwrap();
        let decoded: UsageEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(evt, decoded);
    }
}
