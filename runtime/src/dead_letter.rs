//! Quarantine (dead letter queue) for events a subscriber could not handle.
//!
//! The publisher moves an event here after its retries are exhausted or the
//! subscriber reported a permanent failure, so that later events of unrelated
//! aggregates keep flowing. Entries are kept for operators to inspect and are
//! removed when the aggregate is released for redelivery.
//!
//! # Features
//!
//! - Bounded with configurable capacity (oldest entries dropped when full)
//! - Thread-safe for concurrent access
//! - Metrics tracking for queue size and operations

use chrono::{DateTime, Utc};
use medtour_core::event::DomainEvent;
use medtour_core::stream::AggregateId;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// An event a subscriber gave up on.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedEvent {
    /// Subscriber that failed to handle the event.
    pub subscriber: String,
    /// The event itself.
    pub event: DomainEvent,
    /// Error from the last attempt.
    pub error: String,
    /// Number of delivery attempts made (0 when parked behind an earlier failure).
    pub attempts: usize,
    /// When the event was quarantined.
    pub quarantined_at: DateTime<Utc>,
}

/// Bounded, shared quarantine of failed deliveries.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    queue: Arc<Mutex<VecDeque<QuarantinedEvent>>>,
    max_size: usize,
}

impl DeadLetterQueue {
    /// Create an empty queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Quarantine an event.
    ///
    /// If the queue is full, the oldest entry is dropped. The dropped event is
    /// still recoverable from the event store by releasing its aggregate.
    pub fn push(&self, entry: QuarantinedEvent) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if queue.len() >= self.max_size {
            if let Some(dropped) = queue.pop_front() {
                metrics::counter!("dlq_dropped_total").increment(1);
                tracing::warn!(
                    max_size = self.max_size,
                    aggregate_id = %dropped.event.aggregate_id,
                    sequence = %dropped.event.sequence_number,
                    "Quarantine at capacity, dropping oldest entry"
                );
            }
        }

        tracing::warn!(
            subscriber = %entry.subscriber,
            aggregate_id = %entry.event.aggregate_id,
            sequence = %entry.event.sequence_number,
            attempts = entry.attempts,
            error = %entry.error,
            "Event quarantined"
        );

        queue.push_back(entry);
        crate::metrics::PublisherMetrics::record_quarantine_size(queue.len());
    }

    /// Snapshot of all entries, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<QuarantinedEvent> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return the entries of one aggregate for one subscriber.
    pub fn take(&self, subscriber: &str, aggregate_id: &AggregateId) -> Vec<QuarantinedEvent> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let (taken, kept): (VecDeque<_>, VecDeque<_>) = queue
            .drain(..)
            .partition(|e| e.subscriber == subscriber && &e.event.aggregate_id == aggregate_id);
        *queue = kept;

        crate::metrics::PublisherMetrics::record_quarantine_size(queue.len());
        taken.into()
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medtour_core::stream::Version;

    fn entry(subscriber: &str, aggregate: &str, seq: u64) -> QuarantinedEvent {
        QuarantinedEvent {
            subscriber: subscriber.to_string(),
            event: DomainEvent {
                aggregate_id: AggregateId::new(aggregate),
                sequence_number: Version::new(seq),
                event_type: "Test.v1".to_string(),
                payload: vec![],
                occurred_at: Utc::now(),
            },
            error: "boom".to_string(),
            attempts: 3,
            quarantined_at: Utc::now(),
        }
    }

    #[test]
    fn drops_oldest_at_capacity() {
        let dlq = DeadLetterQueue::new(2);
        dlq.push(entry("s", "a", 1));
        dlq.push(entry("s", "a", 2));
        dlq.push(entry("s", "a", 3));

        let seqs: Vec<u64> = dlq
            .list()
            .iter()
            .map(|e| e.event.sequence_number.value())
            .collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn take_removes_only_matching_entries() {
        let dlq = DeadLetterQueue::new(10);
        dlq.push(entry("read-model", "a", 1));
        dlq.push(entry("read-model", "b", 1));
        dlq.push(entry("notifier", "a", 1));

        let taken = dlq.take("read-model", &AggregateId::new("a"));
        assert_eq!(taken.len(), 1);
        assert_eq!(dlq.len(), 2);
        assert!(dlq.take("read-model", &AggregateId::new("a")).is_empty());
    }
}
