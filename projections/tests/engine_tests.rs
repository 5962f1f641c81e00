//! Integration tests for the projection engine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use medtour_core::event::DomainEvent;
use medtour_core::event_bus::{DeliveryError, EventSubscriber};
use medtour_core::event_store::EventStore;
use medtour_core::projection::{ApplyOutcome, ProjectionError, ReadModel};
use medtour_core::stream::{AggregateId, GlobalPosition, Version};
use medtour_projections::ProjectionEngine;
use medtour_testing::{FaultyEventStore, InMemoryEventStore};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Sequence numbers seen per aggregate, in application order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Trail(BTreeMap<String, Vec<u64>>);

impl ReadModel for Trail {
    const NAME: &'static str = "trail";

    fn apply(&mut self, event: &DomainEvent) -> Result<ApplyOutcome, ProjectionError> {
        if event.event_type == "Skip.v1" {
            return Ok(ApplyOutcome::Ignored);
        }
        self.0
            .entry(event.aggregate_id.to_string())
            .or_default()
            .push(event.sequence_number.value());
        Ok(ApplyOutcome::Applied)
    }
}

fn event(id: &str, seq: u64) -> DomainEvent {
    DomainEvent {
        aggregate_id: AggregateId::new(id),
        sequence_number: Version::new(seq),
        event_type: "Test.v1".to_string(),
        payload: vec![],
        occurred_at: Utc::now(),
    }
}

fn trail(entries: &[(&str, &[u64])]) -> Trail {
    Trail(
        entries
            .iter()
            .map(|(id, seqs)| ((*id).to_string(), seqs.to_vec()))
            .collect(),
    )
}

#[tokio::test]
async fn redelivered_events_are_applied_once() {
    let engine = ProjectionEngine::<Trail>::new(Arc::new(InMemoryEventStore::new()));

    assert_eq!(engine.apply(&event("a", 1)).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(engine.apply(&event("a", 2)).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(engine.apply(&event("a", 1)).await.unwrap(), ApplyOutcome::Duplicate);
    assert_eq!(engine.apply(&event("a", 2)).await.unwrap(), ApplyOutcome::Duplicate);

    assert_eq!(engine.snapshot(), trail(&[("a", &[1, 2])]));
    assert_eq!(engine.high_water_mark(&AggregateId::new("a")), Version::new(2));
}

#[tokio::test]
async fn out_of_order_event_is_refused() {
    let engine = ProjectionEngine::<Trail>::new(Arc::new(InMemoryEventStore::new()));
    engine.apply(&event("a", 1)).await.unwrap();

    let err = engine.apply(&event("a", 3)).await.unwrap_err();

    assert!(matches!(err, ProjectionError::EventProcessing(_)));
    assert_eq!(engine.high_water_mark(&AggregateId::new("a")), Version::new(1));
}

#[tokio::test]
async fn subscriber_reports_gaps_as_transient() {
    let engine = ProjectionEngine::<Trail>::new(Arc::new(InMemoryEventStore::new()));

    let result = engine.handle(&event("a", 2)).await;

    assert!(matches!(result, Err(DeliveryError::Transient(_))));
    assert_eq!(engine.name(), "trail");
}

#[tokio::test]
async fn rebuild_reproduces_the_incremental_view() {
    let events = vec![event("a", 1), event("b", 1), event("a", 2), event("c", 1), event("b", 2)];
    let store = Arc::new(InMemoryEventStore::with_events(events.clone()).unwrap());
    let incremental = ProjectionEngine::<Trail>::new(store.clone());
    for e in &events {
        incremental.apply(e).await.unwrap();
    }

    let rebuilt = ProjectionEngine::<Trail>::new(store).with_batch_size(2);
    let report = rebuilt.rebuild().await.unwrap();

    assert_eq!(rebuilt.snapshot(), incremental.snapshot());
    assert_eq!(report.events_replayed, 5);
    assert_eq!(report.aggregates, 3);
    assert_eq!(report.last_position, GlobalPosition::new(5));
    assert_eq!(rebuilt.stats().last_rebuild, Some(report));
}

#[tokio::test]
async fn rebuild_twice_gives_the_same_view() {
    let store = Arc::new(
        InMemoryEventStore::with_events(vec![event("a", 1), event("a", 2)]).unwrap(),
    );
    let engine = ProjectionEngine::<Trail>::new(store);

    engine.rebuild().await.unwrap();
    let first = engine.snapshot();
    engine.rebuild().await.unwrap();

    assert_eq!(engine.snapshot(), first);
    assert_eq!(first, trail(&[("a", &[1, 2])]));
}

#[tokio::test]
async fn failed_rebuild_keeps_the_previous_view() {
    let inner = Arc::new(
        InMemoryEventStore::with_events(vec![event("a", 1), event("b", 1), event("a", 2)]).unwrap(),
    );
    let faulty = Arc::new(FaultyEventStore::new(inner.clone()));
    let engine = ProjectionEngine::<Trail>::new(faulty.clone()).with_batch_size(1);
    engine.apply(&event("a", 1)).await.unwrap();
    let before = engine.snapshot();

    faulty.fail_read_all_after(Some(GlobalPosition::new(2)));
    let err = engine.rebuild().await.unwrap_err();

    assert!(matches!(err, ProjectionError::Storage(_)));
    assert_eq!(engine.snapshot(), before);
    assert!(engine.stats().last_rebuild.is_none());

    faulty.fail_read_all_after(None);
    engine.rebuild().await.unwrap();
    assert_eq!(engine.snapshot(), trail(&[("a", &[1, 2]), ("b", &[1])]));
}

#[tokio::test]
async fn queries_keep_serving_and_applies_wait_during_rebuild() {
    let inner = Arc::new(
        InMemoryEventStore::with_events(vec![event("a", 1), event("a", 2), event("a", 3)]).unwrap(),
    );
    let slow = Arc::new(FaultyEventStore::new(inner));
    slow.delay_read_all(Duration::from_millis(60));
    let engine = Arc::new(ProjectionEngine::<Trail>::new(slow).with_batch_size(1));
    engine.apply(&event("a", 1)).await.unwrap();

    let rebuilding = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.rebuild().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The old view answers immediately.
    assert_eq!(engine.snapshot(), trail(&[("a", &[1])]));

    // Incremental application is held back until the swap.
    let blocked = tokio::time::timeout(Duration::from_millis(20), engine.apply(&event("z", 1))).await;
    assert!(blocked.is_err());

    rebuilding.await.unwrap().unwrap();
    assert_eq!(engine.apply(&event("z", 1)).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(engine.snapshot(), trail(&[("a", &[1, 2, 3]), ("z", &[1])]));
}

#[tokio::test]
async fn ignored_events_advance_the_high_water_mark() {
    let engine = ProjectionEngine::<Trail>::new(Arc::new(InMemoryEventStore::new()));
    let mut skip = event("a", 1);
    skip.event_type = "Skip.v1".to_string();

    assert_eq!(engine.apply(&skip).await.unwrap(), ApplyOutcome::Ignored);
    assert_eq!(engine.apply(&event("a", 2)).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(engine.snapshot(), trail(&[("a", &[2])]));
}

/// Interleaves per-aggregate histories in an arbitrary order.
fn interleaved() -> impl Strategy<Value = Vec<(usize, u64)>> {
    prop::collection::vec(1_usize..5, 1..4).prop_flat_map(|lengths| {
        let slots: Vec<usize> = lengths
            .iter()
            .enumerate()
            .flat_map(|(agg, len)| std::iter::repeat(agg).take(*len))
            .collect();
        Just(slots).prop_shuffle().prop_map(|order| {
            let mut next = BTreeMap::<usize, u64>::new();
            order
                .into_iter()
                .map(|agg| {
                    let seq = next.entry(agg).or_insert(0);
                    *seq += 1;
                    (agg, *seq)
                })
                .collect()
        })
    })
}

proptest! {
    #[test]
    fn rebuild_equals_incremental_with_redelivery(order in interleaved(), redeliver in any::<bool>()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let events: Vec<DomainEvent> = order
                .iter()
                .map(|(agg, seq)| event(&format!("agg-{agg}"), *seq))
                .collect();
            let store = Arc::new(InMemoryEventStore::with_events(events.clone()).unwrap());

            let live = ProjectionEngine::<Trail>::new(store.clone());
            for e in &events {
                live.apply(e).await.unwrap();
                if redeliver {
                    live.apply(e).await.unwrap();
                }
            }

            let rebuilt = ProjectionEngine::<Trail>::new(store).with_batch_size(3);
            rebuilt.rebuild().await.unwrap();

            prop_assert_eq!(live.snapshot(), rebuilt.snapshot());
            Ok(())
        })?;
    }
}
