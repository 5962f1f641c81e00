//! Test doubles for the event bus side.
//!
//! - [`RecordingSubscriber`]: records every delivery and fails on command
//! - [`RecordingEventBus`]: an [`EventBus`] that only records what was published

use medtour_core::event::DomainEvent;
use medtour_core::event_bus::{DeliveryError, EventBus, EventBusError, EventSubscriber};
use medtour_core::stream::{AggregateId, Version};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Script {
    /// Remaining transient failures per `(aggregate, sequence)`.
    transient: HashMap<(AggregateId, Version), usize>,
    /// Transient failures applied to every event not otherwise scripted.
    transient_each: usize,
    transient_seen: HashMap<(AggregateId, Version), usize>,
    /// Aggregates whose events fail permanently.
    permanent: HashSet<AggregateId>,
}

/// Subscriber that records deliveries and fails when told to.
#[derive(Debug)]
pub struct RecordingSubscriber {
    name: String,
    received: Mutex<Vec<DomainEvent>>,
    script: Mutex<Script>,
}

impl RecordingSubscriber {
    /// Create a subscriber that accepts everything.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
        }
    }

    /// Fail the given event transiently `times` times before accepting it.
    pub fn fail_transiently(&self, aggregate_id: &AggregateId, sequence: Version, times: usize) {
        self.script()
            .transient
            .insert((aggregate_id.clone(), sequence), times);
    }

    /// Fail every event transiently `times` times before accepting it.
    pub fn fail_each_transiently(&self, times: usize) {
        self.script().transient_each = times;
    }

    /// Fail all events of `aggregate_id` permanently, or stop doing so.
    pub fn fail_permanently(&self, aggregate_id: &AggregateId, fail: bool) {
        let mut script = self.script();
        if fail {
            script.permanent.insert(aggregate_id.clone());
        } else {
            script.permanent.remove(aggregate_id);
        }
    }

    /// Every successfully handled event, in delivery order.
    #[must_use]
    pub fn received(&self) -> Vec<DomainEvent> {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Sequence numbers handled for one aggregate, in delivery order.
    #[must_use]
    pub fn sequences_for(&self, aggregate_id: &AggregateId) -> Vec<u64> {
        self.received()
            .iter()
            .filter(|e| &e.aggregate_id == aggregate_id)
            .map(|e| e.sequence_number.value())
            .collect()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn decide(&self, event: &DomainEvent) -> Result<(), DeliveryError> {
        let mut script = self.script();
        if script.permanent.contains(&event.aggregate_id) {
            return Err(DeliveryError::Permanent(format!(
                "{} rejects {}",
                self.name, event.aggregate_id
            )));
        }

        let key = (event.aggregate_id.clone(), event.sequence_number);
        if let Some(remaining) = script.transient.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DeliveryError::Transient("scripted failure".to_string()));
            }
            return Ok(());
        }

        let each = script.transient_each;
        let seen = script.transient_seen.entry(key).or_insert(0);
        if *seen < each {
            *seen += 1;
            return Err(DeliveryError::Transient("scripted failure".to_string()));
        }
        Ok(())
    }
}

impl EventSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>> {
        let decision = self.decide(event);
        if decision.is_ok() {
            self.received
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(event.clone());
        }
        Box::pin(async move { decision })
    }
}

/// Event bus that records published events without delivering them.
#[derive(Debug, Default)]
pub struct RecordingEventBus {
    published: Mutex<Vec<DomainEvent>>,
    closed: AtomicBool,
}

impl RecordingEventBus {
    /// Create an open bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far.
    #[must_use]
    pub fn published(&self) -> Vec<DomainEvent> {
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Make further publishes fail with `EventBusError::Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl EventBus for RecordingEventBus {
    fn publish(&self, events: &[DomainEvent]) -> Result<(), EventBusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        self.published
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::Utc;

    fn event(id: &str, seq: u64) -> DomainEvent {
        DomainEvent {
            aggregate_id: AggregateId::new(id),
            sequence_number: Version::new(seq),
            event_type: "Test.v1".to_string(),
            payload: vec![],
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn scripted_transient_failures_then_success() {
        let subscriber = RecordingSubscriber::new("test");
        let e = event("a", 1);
        subscriber.fail_transiently(&e.aggregate_id, e.sequence_number, 2);

        assert!(subscriber.handle(&e).await.is_err());
        assert!(subscriber.handle(&e).await.is_err());
        assert!(subscriber.handle(&e).await.is_ok());
        assert_eq!(subscriber.sequences_for(&e.aggregate_id), vec![1]);
    }

    #[tokio::test]
    async fn permanent_failures_until_cleared() {
        let subscriber = RecordingSubscriber::new("test");
        let e = event("a", 1);
        subscriber.fail_permanently(&e.aggregate_id, true);
        assert!(matches!(
            subscriber.handle(&e).await,
            Err(DeliveryError::Permanent(_))
        ));
        subscriber.fail_permanently(&e.aggregate_id, false);
        assert!(subscriber.handle(&e).await.is_ok());
    }

    #[test]
    fn recording_bus_closes() {
        let bus = RecordingEventBus::new();
        bus.publish(&[event("a", 1)]).unwrap();
        bus.close();
        assert!(bus.publish(&[event("a", 2)]).is_err());
        assert_eq!(bus.published().len(), 1);
    }
}
