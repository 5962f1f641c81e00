//! Integration tests for the at-least-once event publisher.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use medtour_core::event::DomainEvent;
use medtour_core::event_bus::{EventBus, EventBusError};
use medtour_core::event_store::EventStore;
use medtour_core::stream::{AggregateId, Version};
use medtour_runtime::{DeadLetterQueue, EventPublisher, HealthStatus, RetryPolicy};
use medtour_testing::{InMemoryEventStore, RecordingSubscriber};
use std::sync::Arc;
use std::time::Duration;

fn event(id: &str, seq: u64) -> DomainEvent {
    DomainEvent {
        aggregate_id: AggregateId::new(id),
        sequence_number: Version::new(seq),
        event_type: "Test.v1".to_string(),
        payload: vec![],
        occurred_at: Utc::now(),
    }
}

fn fast_retries(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

struct Fixture {
    store: Arc<InMemoryEventStore>,
    subscriber: Arc<RecordingSubscriber>,
    publisher: EventPublisher,
    dlq: DeadLetterQueue,
}

fn fixture(events: Vec<DomainEvent>, max_retries: usize) -> Fixture {
    let store = Arc::new(InMemoryEventStore::with_events(events).unwrap());
    let subscriber = Arc::new(RecordingSubscriber::new("recorder"));
    let dlq = DeadLetterQueue::new(100);
    let publisher = EventPublisher::builder(Arc::clone(&store) as Arc<dyn EventStore>)
        .subscribe(Arc::clone(&subscriber) as _)
        .lanes(3)
        .retry_policy(fast_retries(max_retries))
        .dead_letter_queue(dlq.clone())
        .build();
    Fixture {
        store,
        subscriber,
        publisher,
        dlq,
    }
}

#[tokio::test]
async fn delivers_each_aggregate_in_sequence_order() {
    let events = vec![event("a", 1), event("a", 2), event("b", 1), event("a", 3)];
    let f = fixture(events.clone(), 0);

    f.publisher.publish(&events).unwrap();
    f.publisher.flush().await.unwrap();

    assert_eq!(f.subscriber.sequences_for(&AggregateId::new("a")), vec![1, 2, 3]);
    assert_eq!(f.subscriber.sequences_for(&AggregateId::new("b")), vec![1]);
}

#[tokio::test]
async fn duplicate_publishes_are_delivered_once() {
    let events = vec![event("a", 1), event("a", 2)];
    let f = fixture(events.clone(), 0);

    f.publisher.publish(&events).unwrap();
    f.publisher.publish(&events[..1]).unwrap();
    f.publisher.flush().await.unwrap();

    assert_eq!(f.subscriber.sequences_for(&AggregateId::new("a")), vec![1, 2]);
}

#[tokio::test]
async fn gap_is_filled_from_the_event_store() {
    let events = vec![event("a", 1), event("a", 2), event("a", 3)];
    let f = fixture(events.clone(), 0);

    f.publisher.publish(&events[2..]).unwrap();
    f.publisher.flush().await.unwrap();

    assert_eq!(f.subscriber.sequences_for(&AggregateId::new("a")), vec![1, 2, 3]);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let events = vec![event("a", 1)];
    let f = fixture(events.clone(), 3);
    f.subscriber
        .fail_transiently(&AggregateId::new("a"), Version::new(1), 2);

    f.publisher.publish(&events).unwrap();
    f.publisher.flush().await.unwrap();

    assert_eq!(f.subscriber.sequences_for(&AggregateId::new("a")), vec![1]);
    assert!(f.dlq.is_empty());
}

#[tokio::test]
async fn exhausted_retries_quarantine_and_park_only_that_aggregate() {
    let events = vec![event("a", 1), event("b", 1), event("a", 2)];
    let f = fixture(events.clone(), 2);
    let a = AggregateId::new("a");
    f.subscriber.fail_transiently(&a, Version::new(1), 10);

    f.publisher.publish(&events).unwrap();
    f.publisher.flush().await.unwrap();

    let quarantined = f.dlq.list();
    assert_eq!(quarantined.len(), 2);
    assert_eq!(quarantined[0].event.sequence_number, Version::new(1));
    assert_eq!(quarantined[0].attempts, 3);
    assert_eq!(quarantined[1].event.sequence_number, Version::new(2));
    assert_eq!(quarantined[1].attempts, 0);

    assert!(f.subscriber.sequences_for(&a).is_empty());
    assert_eq!(f.subscriber.sequences_for(&AggregateId::new("b")), vec![1]);
    assert_eq!(f.publisher.health().status, HealthStatus::Degraded);
}

#[tokio::test]
async fn release_redelivers_the_parked_aggregate() {
    let events = vec![event("a", 1), event("a", 2)];
    let f = fixture(events.clone(), 0);
    let a = AggregateId::new("a");
    f.subscriber.fail_permanently(&a, true);

    f.publisher.publish(&events).unwrap();
    f.publisher.flush().await.unwrap();
    assert_eq!(f.dlq.len(), 2);
    assert_eq!(f.dlq.list()[0].attempts, 1);

    f.subscriber.fail_permanently(&a, false);
    assert_eq!(f.publisher.release(&a).unwrap(), 2);
    f.publisher.flush().await.unwrap();

    assert_eq!(f.subscriber.sequences_for(&a), vec![1, 2]);
    assert!(f.dlq.is_empty());
    assert_eq!(f.publisher.health().status, HealthStatus::Healthy);
}

#[tokio::test]
async fn catch_up_replays_the_whole_log() {
    let events = vec![event("a", 1), event("b", 1), event("a", 2)];
    let f = fixture(events, 0);

    assert_eq!(f.publisher.catch_up().await.unwrap(), 3);
    f.publisher.flush().await.unwrap();

    assert_eq!(f.subscriber.received().len(), 3);
    assert_eq!(f.store.len(), 3);
}

#[tokio::test]
async fn every_subscriber_receives_every_event() {
    let events = vec![event("a", 1), event("b", 1)];
    let store = Arc::new(InMemoryEventStore::with_events(events.clone()).unwrap());
    let first = Arc::new(RecordingSubscriber::new("first"));
    let second = Arc::new(RecordingSubscriber::new("second"));
    let publisher = EventPublisher::builder(store)
        .subscribe(Arc::clone(&first) as _)
        .subscribe(Arc::clone(&second) as _)
        .build();

    publisher.publish(&events).unwrap();
    publisher.flush().await.unwrap();

    assert_eq!(first.received().len(), 2);
    assert_eq!(second.received().len(), 2);
}

#[tokio::test]
async fn publish_after_shutdown_is_rejected() {
    let f = fixture(vec![event("a", 1)], 0);

    f.publisher.shutdown(Duration::from_secs(1)).await;

    assert!(matches!(
        f.publisher.publish(&[event("a", 1)]),
        Err(EventBusError::Closed)
    ));
    assert_eq!(f.publisher.health().status, HealthStatus::Unhealthy);
}
