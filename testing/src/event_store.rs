//! In-memory event stores.
//!
//! - [`InMemoryEventStore`]: a complete, deterministic [`EventStore`]
//! - [`FaultyEventStore`]: wraps a store and injects failures and delays
//! - [`LockstepEventStore`]: holds the first N loads until all N have happened,
//!   so that concurrent commands observe the same version

use medtour_core::event::{DomainEvent, StoredEvent};
use medtour_core::event_store::{EventStore, EventStoreError, validate_batch};
use medtour_core::stream::{AggregateId, GlobalPosition, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Barrier;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

#[derive(Debug, Default)]
struct Log {
    /// Every event in commit order; index `i` holds position `i + 1`.
    events: Vec<StoredEvent>,
    /// Indexes into `events`, per aggregate, in sequence order.
    streams: HashMap<AggregateId, Vec<usize>>,
}

/// Event store backed by a vector behind a lock.
///
/// Appends are serialized by the lock, so global positions are assigned in
/// commit order without gaps.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `events`, appended one by one in order.
    ///
    /// # Errors
    ///
    /// Returns the first append error, e.g. when an aggregate's events are
    /// not numbered contiguously.
    pub fn with_events(events: impl IntoIterator<Item = DomainEvent>) -> Result<Self, EventStoreError> {
        let store = Self::new();
        for event in events {
            let expected = event.sequence_number - 1;
            store.append_now(event.aggregate_id.clone(), expected, vec![event])?;
        }
        Ok(store)
    }

    /// Number of events in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All events in commit order.
    #[must_use]
    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.read().events.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Log> {
        self.log
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn append_now(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> Result<Version, EventStoreError> {
        let mut log = self
            .log
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let current = log
            .streams
            .get(&aggregate_id)
            .map_or(0, Vec::len);
        let current = Version::new(current as u64);
        if current != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual: current,
            });
        }
        validate_batch(&aggregate_id, expected_version, &events)?;

        let mut version = current;
        for event in events {
            let index = log.events.len();
            version = event.sequence_number;
            log.events.push(StoredEvent {
                position: GlobalPosition::new(index as u64 + 1),
                event,
            });
            log.streams.entry(aggregate_id.clone()).or_default().push(index);
        }
        Ok(version)
    }
}

impl EventStore for InMemoryEventStore {
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> BoxFuture<'_, Version> {
        let result = self.append_now(aggregate_id, expected_version, events);
        Box::pin(async move { result })
    }

    fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
    ) -> BoxFuture<'_, Vec<DomainEvent>> {
        let log = self.read();
        let from = from_version.unwrap_or(Version::INITIAL);
        let events = log
            .streams
            .get(&aggregate_id)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&i| &log.events[i].event)
                    .filter(|e| e.sequence_number >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(log);
        Box::pin(async move { Ok(events) })
    }

    fn read_all(&self, after: GlobalPosition, limit: usize) -> BoxFuture<'_, Vec<StoredEvent>> {
        let log = self.read();
        let start = usize::try_from(after.value()).unwrap_or(usize::MAX);
        let page: Vec<StoredEvent> = log
            .events
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect();
        drop(log);
        Box::pin(async move { Ok(page) })
    }
}

/// Wraps a store and injects failures on demand.
///
/// All switches can be flipped while the store is in use.
pub struct FaultyEventStore {
    inner: Arc<dyn EventStore>,
    fail_appends: AtomicBool,
    fail_loads: AtomicBool,
    /// `read_all` fails for pages starting at or after this position (0 = never).
    fail_read_all_from: AtomicU64,
    read_all_delay: Mutex<Duration>,
}

impl FaultyEventStore {
    /// Wrap `inner` with all faults disabled.
    #[must_use]
    pub fn new(inner: Arc<dyn EventStore>) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            fail_read_all_from: AtomicU64::new(0),
            read_all_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every append fail with a database error.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make every `load_events` fail with a database error.
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make `read_all` fail once the reader has moved past `position`.
    ///
    /// `None` disables the fault.
    pub fn fail_read_all_after(&self, position: Option<GlobalPosition>) {
        let raw = position.map_or(0, |p| p.value() + 1);
        self.fail_read_all_from.store(raw, Ordering::SeqCst);
    }

    /// Sleep before serving each `read_all` page.
    pub fn delay_read_all(&self, delay: Duration) {
        *self
            .read_all_delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
    }

    fn injected(operation: &str) -> EventStoreError {
        EventStoreError::DatabaseError(format!("injected {operation} failure"))
    }
}

impl EventStore for FaultyEventStore {
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> BoxFuture<'_, Version> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::injected("append")) });
        }
        self.inner.append_events(aggregate_id, expected_version, events)
    }

    fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
    ) -> BoxFuture<'_, Vec<DomainEvent>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::injected("load")) });
        }
        self.inner.load_events(aggregate_id, from_version)
    }

    fn read_all(&self, after: GlobalPosition, limit: usize) -> BoxFuture<'_, Vec<StoredEvent>> {
        let fail_from = self.fail_read_all_from.load(Ordering::SeqCst);
        let delay = *self
            .read_all_delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail_from != 0 && after.value() + 1 >= fail_from {
                return Err(Self::injected("read_all"));
            }
            self.inner.read_all(after, limit).await
        })
    }
}

/// Holds the first `parties` calls to `load_events` until all of them have loaded.
///
/// Two commands racing on one aggregate through this store are guaranteed to
/// replay the same version before either appends. Later loads pass straight through.
pub struct LockstepEventStore {
    inner: Arc<dyn EventStore>,
    gate: Barrier,
    remaining: AtomicUsize,
}

impl LockstepEventStore {
    /// Wrap `inner`, gating the first `parties` loads.
    #[must_use]
    pub fn new(inner: Arc<dyn EventStore>, parties: usize) -> Self {
        Self {
            inner,
            gate: Barrier::new(parties),
            remaining: AtomicUsize::new(parties),
        }
    }
}

impl EventStore for LockstepEventStore {
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> BoxFuture<'_, Version> {
        self.inner.append_events(aggregate_id, expected_version, events)
    }

    fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
    ) -> BoxFuture<'_, Vec<DomainEvent>> {
        let gated = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            let events = self.inner.load_events(aggregate_id, from_version).await;
            if gated {
                self.gate.wait().await;
            }
            events
        })
    }

    fn read_all(&self, after: GlobalPosition, limit: usize) -> BoxFuture<'_, Vec<StoredEvent>> {
        self.inner.read_all(after, limit)
    }
}
