use common_usage_events::UsageEvent;
use uuid::Uuid;

#[test]
fn duplicate_count_is_attempted_minus_inserted() {
    let outcome = usage_processor::writer::WriteOutcome { attempted: 10, inserted: 7 };
    assert_eq!(outcome.duplicates(), 3);
}

#[test]
fn usage_event_constructed_for_batch_is_billable_for_2xx() {
    let event = UsageEvent::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        "/orders/123".to_string(),
        "GET".to_string(),
        200,
        12,
    );
    assert!(event.billable);
}
