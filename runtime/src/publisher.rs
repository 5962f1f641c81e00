//! At-least-once event publisher.
//!
//! The publisher is the [`EventBus`] implementation used by the command path.
//! `publish` only enqueues; delivery happens on background lanes so that a
//! command never waits for a subscriber.
//!
//! # Delivery model
//!
//! ```text
//!                    ┌─► lane 0 ─► subscriber A
//! publish(events) ───┼─► lane 1 ─► subscriber A      lane = hash(aggregate_id) % lanes
//!                    ├─► lane 0 ─► subscriber B
//!                    └─► lane 1 ─► subscriber B
//! ```
//!
//! - Each subscriber gets its own lanes; a slow subscriber never delays another.
//! - An aggregate is pinned to one lane, so its events are delivered in
//!   sequence order while different aggregates are delivered in parallel.
//! - Each lane remembers the last sequence number delivered per aggregate.
//!   Duplicates are dropped; a gap is filled by loading the missing events
//!   from the event store before the newer event is delivered.
//! - Transient failures are retried with exponential backoff. When retries run
//!   out (or the failure is permanent) the event is quarantined and its
//!   aggregate is parked: later events of that aggregate are quarantined too,
//!   other aggregates are unaffected.
//! - [`EventPublisher::release`] unparks an aggregate and redelivers its
//!   whole history; subscribers dedupe what they already have.

use crate::dead_letter::{DeadLetterQueue, QuarantinedEvent};
use crate::health::HealthCheck;
use crate::metrics::PublisherMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use chrono::Utc;
use futures::TryStreamExt;
use medtour_core::event::DomainEvent;
use medtour_core::event_bus::{DeliveryError, EventBus, EventBusError, EventSubscriber};
use medtour_core::event_store::{EventStore, EventStoreError, stream_all};
use medtour_core::stream::{AggregateId, GlobalPosition, Version};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const CATCH_UP_BATCH: usize = 500;

enum LaneMessage {
    Deliver(DomainEvent),
    Release(AggregateId),
    Flush(oneshot::Sender<()>),
}

struct Route {
    subscriber: String,
    lanes: Vec<mpsc::UnboundedSender<LaneMessage>>,
}

/// Builder for [`EventPublisher`].
///
/// Subscribers are registered explicitly here; the set is fixed once built.
pub struct EventPublisherBuilder {
    store: Arc<dyn EventStore>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    lanes: usize,
    retry_policy: RetryPolicy,
    dead_letters: DeadLetterQueue,
}

impl EventPublisherBuilder {
    /// Register a subscriber.
    #[must_use]
    pub fn subscribe(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Number of parallel delivery lanes per subscriber (at least 1).
    #[must_use]
    pub fn lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes.max(1);
        self
    }

    /// Retry policy for failed deliveries.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Quarantine shared with the rest of the service.
    #[must_use]
    pub fn dead_letter_queue(mut self, dead_letters: DeadLetterQueue) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    /// Spawn the delivery lanes and return the publisher.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> EventPublisher {
        let mut routes = Vec::with_capacity(self.subscribers.len());
        let mut tasks = Vec::new();

        for subscriber in self.subscribers {
            let mut lanes = Vec::with_capacity(self.lanes);
            for index in 0..self.lanes {
                let (tx, rx) = mpsc::unbounded_channel();
                let lane = Lane {
                    index,
                    subscriber: Arc::clone(&subscriber),
                    store: Arc::clone(&self.store),
                    dead_letters: self.dead_letters.clone(),
                    retry_policy: self.retry_policy.clone(),
                    delivered: HashMap::new(),
                    parked: HashMap::new(),
                };
                tasks.push(tokio::spawn(lane.run(rx)));
                lanes.push(tx);
            }
            routes.push(Route {
                subscriber: subscriber.name().to_string(),
                lanes,
            });
        }

        tracing::info!(
            subscribers = routes.len(),
            lanes = self.lanes,
            "Event publisher started"
        );

        EventPublisher {
            store: self.store,
            routes: RwLock::new(routes),
            tasks: Mutex::new(tasks),
            dead_letters: self.dead_letters,
            closed: AtomicBool::new(false),
            lane_count: self.lanes,
        }
    }
}

/// Delivers committed events to registered subscribers.
pub struct EventPublisher {
    store: Arc<dyn EventStore>,
    routes: RwLock<Vec<Route>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dead_letters: DeadLetterQueue,
    closed: AtomicBool,
    lane_count: usize,
}

impl EventPublisher {
    /// Start building a publisher that repairs gaps from `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn EventStore>) -> EventPublisherBuilder {
        EventPublisherBuilder {
            store,
            subscribers: Vec::new(),
            lanes: 4,
            retry_policy: RetryPolicy::default(),
            dead_letters: DeadLetterQueue::default(),
        }
    }

    fn lane_for(&self, aggregate_id: &AggregateId) -> usize {
        let mut hasher = DefaultHasher::new();
        aggregate_id.hash(&mut hasher);
        usize::try_from(hasher.finish() % self.lane_count as u64).unwrap_or(0)
    }

    fn send(&self, message: impl Fn() -> LaneMessage, lane: Option<usize>) -> Result<usize, EventBusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }
        let routes = self
            .routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut sent = 0;
        for route in routes.iter() {
            let targets: Vec<&mpsc::UnboundedSender<LaneMessage>> = match lane {
                Some(index) => route.lanes.get(index).into_iter().collect(),
                None => route.lanes.iter().collect(),
            };
            for tx in targets {
                tx.send(message()).map_err(|_| {
                    EventBusError::PublishFailed(format!(
                        "delivery lane for {} has stopped",
                        route.subscriber
                    ))
                })?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Replay the whole log to every subscriber.
    ///
    /// Used at startup so that events committed while the process was down
    /// (or whose publish was lost) reach subscribers. Returns the number of
    /// events enqueued.
    ///
    /// # Errors
    ///
    /// Returns `EventBusError::PublishFailed` if the log cannot be read, or
    /// `EventBusError::Closed` after shutdown.
    pub async fn catch_up(&self) -> Result<usize, EventBusError> {
        let stream = stream_all(self.store.as_ref(), GlobalPosition::START, CATCH_UP_BATCH)
            .map_err(|e: EventStoreError| EventBusError::PublishFailed(e.to_string()));
        futures::pin_mut!(stream);

        let mut count = 0;
        while let Some(stored) = stream.try_next().await? {
            self.publish(std::slice::from_ref(&stored.event))?;
            count += 1;
        }
        tracing::info!(events = count, "Publisher catch-up enqueued");
        Ok(count)
    }

    /// Unpark an aggregate for every subscriber and redeliver its history.
    ///
    /// Returns the number of quarantined entries that were pending for the
    /// aggregate. Calling it for an aggregate that is not parked is harmless.
    ///
    /// # Errors
    ///
    /// Returns `EventBusError::Closed` after shutdown.
    pub fn release(&self, aggregate_id: &AggregateId) -> Result<usize, EventBusError> {
        let pending = self
            .dead_letters
            .list()
            .iter()
            .filter(|e| &e.event.aggregate_id == aggregate_id)
            .count();

        let lane = self.lane_for(aggregate_id);
        self.send(|| LaneMessage::Release(aggregate_id.clone()), Some(lane))?;

        tracing::info!(aggregate_id = %aggregate_id, pending, "Aggregate released for redelivery");
        Ok(pending)
    }

    /// Wait until every lane has processed everything enqueued before this call.
    ///
    /// # Errors
    ///
    /// Returns `EventBusError::Closed` after shutdown, or
    /// `EventBusError::PublishFailed` if a lane stopped.
    pub async fn flush(&self) -> Result<(), EventBusError> {
        let receivers = Mutex::new(Vec::new());
        self.send(
            || {
                let (tx, rx) = oneshot::channel();
                receivers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(rx);
                LaneMessage::Flush(tx)
            },
            None,
        )?;

        let receivers = receivers
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for rx in receivers {
            rx.await
                .map_err(|_| EventBusError::PublishFailed("delivery lane stopped".to_string()))?;
        }
        Ok(())
    }

    /// The quarantine this publisher writes to.
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Health of the delivery pipeline.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let quarantined = self.dead_letters.len();
        if self.closed.load(Ordering::Acquire) {
            HealthCheck::unhealthy("publisher", "publisher is shut down")
        } else if quarantined > 0 {
            HealthCheck::degraded("publisher", format!("{quarantined} events quarantined"))
                .with_metadata("quarantined", quarantined)
        } else {
            HealthCheck::healthy("publisher")
        }
    }

    /// Stop accepting events and wait for the lanes to drain.
    ///
    /// Lanes still running after `timeout` are aborted. Their undelivered
    /// events remain in the store and are delivered by the next catch-up.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        let drained = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;
        if drained.is_err() {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Delivery lanes did not drain in time, aborting"
            );
            for handle in aborts {
                handle.abort();
            }
        } else {
            tracing::info!("Event publisher stopped");
        }
    }
}

impl EventBus for EventPublisher {
    fn publish(&self, events: &[DomainEvent]) -> Result<(), EventBusError> {
        for event in events {
            let lane = self.lane_for(&event.aggregate_id);
            self.send(|| LaneMessage::Deliver(event.clone()), Some(lane))?;
        }
        Ok(())
    }
}

/// One delivery lane of one subscriber.
struct Lane {
    index: usize,
    subscriber: Arc<dyn EventSubscriber>,
    store: Arc<dyn EventStore>,
    dead_letters: DeadLetterQueue,
    retry_policy: RetryPolicy,
    /// Last sequence number delivered per aggregate. One entry per aggregate
    /// ever routed to this lane, the same order as the read model.
    delivered: HashMap<AggregateId, Version>,
    /// Parked aggregates and the last sequence number quarantined for each.
    parked: HashMap<AggregateId, Version>,
}

impl Lane {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LaneMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                LaneMessage::Deliver(event) => self.on_event(event).await,
                LaneMessage::Release(aggregate_id) => self.on_release(aggregate_id).await,
                LaneMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(
            subscriber = self.subscriber.name(),
            lane = self.index,
            "Delivery lane stopped"
        );
    }

    fn mark(&self, aggregate_id: &AggregateId) -> Version {
        self.delivered
            .get(aggregate_id)
            .copied()
            .unwrap_or(Version::INITIAL)
    }

    async fn on_event(&mut self, event: DomainEvent) {
        let mark = self.mark(&event.aggregate_id);
        let parked = self.parked.contains_key(&event.aggregate_id);

        if !parked && event.sequence_number > mark.next() {
            match self.load_gap(&event.aggregate_id, mark, event.sequence_number).await {
                Ok(missing) => {
                    PublisherMetrics::record_gap_repaired(missing.len());
                    for earlier in missing {
                        self.process(earlier).await;
                    }
                }
                Err(reason) => {
                    self.quarantine(event, reason, 0);
                    return;
                }
            }
        }
        self.process(event).await;
    }

    async fn load_gap(
        &self,
        aggregate_id: &AggregateId,
        mark: Version,
        before: Version,
    ) -> Result<Vec<DomainEvent>, String> {
        let store = self.store.as_ref();
        let loaded = retry_with_predicate(
            &self.retry_policy,
            "load_gap",
            || store.load_events(aggregate_id.clone(), Some(mark.next())),
            |_: &EventStoreError| true,
        )
        .await
        .map_err(|e| format!("gap repair failed: {e}"))?;

        let missing: Vec<DomainEvent> = loaded
            .into_iter()
            .filter(|e| e.sequence_number < before)
            .collect();

        let expected = before.value() - mark.value() - 1;
        if missing.len() as u64 != expected {
            return Err(format!(
                "gap repair found {} of {expected} missing events",
                missing.len()
            ));
        }
        tracing::debug!(
            subscriber = self.subscriber.name(),
            aggregate_id = %aggregate_id,
            from = %mark.next(),
            count = missing.len(),
            "Repaired delivery gap from event store"
        );
        Ok(missing)
    }

    /// Deliver one event that is next in line, or quarantine it if its aggregate is parked.
    async fn process(&mut self, event: DomainEvent) {
        if let Some(&parked_at) = self.parked.get(&event.aggregate_id) {
            if event.sequence_number > parked_at {
                self.quarantine(
                    event,
                    "aggregate parked after an earlier delivery failure".to_string(),
                    0,
                );
            }
            return;
        }

        if event.sequence_number <= self.mark(&event.aggregate_id) {
            tracing::trace!(
                subscriber = self.subscriber.name(),
                aggregate_id = %event.aggregate_id,
                sequence = %event.sequence_number,
                "Skipping already delivered event"
            );
            return;
        }

        let attempts = AtomicUsize::new(0);
        let subscriber = self.subscriber.as_ref();
        let event_ref = &event;
        let result = retry_with_predicate(
            &self.retry_policy,
            "deliver_event",
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                subscriber.handle(event_ref)
            },
            DeliveryError::is_transient,
        )
        .await;
        let attempts = attempts.into_inner();

        match result {
            Ok(()) => {
                PublisherMetrics::record_delivered(subscriber.name());
                self.delivered
                    .insert(event.aggregate_id.clone(), event.sequence_number);
            }
            Err(err) => {
                for _ in 0..attempts {
                    PublisherMetrics::record_failure(subscriber.name());
                }
                self.quarantine(event, err.to_string(), attempts);
            }
        }
    }

    fn quarantine(&mut self, event: DomainEvent, error: String, attempts: usize) {
        let name = self.subscriber.name().to_string();
        PublisherMetrics::record_quarantined(&name);

        let parked_at = self
            .parked
            .entry(event.aggregate_id.clone())
            .or_insert(event.sequence_number);
        if event.sequence_number > *parked_at {
            *parked_at = event.sequence_number;
        }

        self.dead_letters.push(QuarantinedEvent {
            subscriber: name,
            event,
            error,
            attempts,
            quarantined_at: Utc::now(),
        });
    }

    async fn on_release(&mut self, aggregate_id: AggregateId) {
        let name = self.subscriber.name().to_string();
        let taken = self.dead_letters.take(&name, &aggregate_id);
        self.parked.remove(&aggregate_id);
        self.delivered.remove(&aggregate_id);

        let store = self.store.as_ref();
        let history = retry_with_predicate(
            &self.retry_policy,
            "load_released",
            || store.load_events(aggregate_id.clone(), None),
            |_: &EventStoreError| true,
        )
        .await;

        match history {
            Ok(history) => {
                tracing::info!(
                    subscriber = %name,
                    aggregate_id = %aggregate_id,
                    events = history.len(),
                    "Redelivering released aggregate"
                );
                for event in history {
                    self.process(event).await;
                }
            }
            Err(err) => {
                tracing::error!(
                    subscriber = %name,
                    aggregate_id = %aggregate_id,
                    error = %err,
                    "Could not load released aggregate, keeping it parked"
                );
                if let Some(last) = taken.iter().map(|e| e.event.sequence_number).max() {
                    self.parked.insert(aggregate_id, last);
                }
                for entry in taken {
                    self.dead_letters.push(entry);
                }
            }
        }
    }
}
