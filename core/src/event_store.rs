//! Event store trait and related types for event sourcing.
//!
//! The event store is an append-only, per-aggregate ordered ledger and the
//! single source of truth for the write model. It offers exactly three things:
//!
//! - Append events to an aggregate with optimistic concurrency
//! - Load an aggregate's events in order for state reconstruction
//! - Read the whole log in global commit order, in pages, from any position
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `medtour-postgres`): Production implementation
//! - `InMemoryEventStore` (in `medtour-testing`): Fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use medtour_core::event_store::{EventStore, EventStoreError};
//! use medtour_core::stream::{AggregateId, Version};
//!
//! async fn example<S: EventStore>(store: &S) -> Result<(), EventStoreError> {
//!     let id = AggregateId::new("reservation-123");
//!
//!     let history = store.load_events(id.clone(), None).await?;
//!     let current = history.last().map_or(Version::INITIAL, |e| e.sequence_number);
//!
//!     let new_events = vec![/* sequence numbers current+1.. */];
//!     let new_version = store.append_events(id, current, new_events).await?;
//!     Ok(())
//! }
//! ```

use crate::event::{DomainEvent, StoredEvent};
use crate::stream::{AggregateId, GlobalPosition, Version};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error types for event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The aggregate's current version differs from the expected version.
    ///
    /// Another writer appended first. The caller should reload the aggregate,
    /// re-validate its command and retry. Nothing was persisted.
    #[error("Concurrency conflict on {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: AggregateId,
        /// The version the caller expected.
        expected: Version,
        /// The actual current version.
        actual: Version,
    },

    /// The batch handed to `append_events` is malformed: empty, for another
    /// aggregate, or not numbered contiguously from `expected + 1`.
    #[error("Invalid event batch for {aggregate_id}: {reason}")]
    InvalidBatch {
        /// The aggregate the append was addressed to.
        aggregate_id: AggregateId,
        /// What is wrong with the batch.
        reason: String,
    },

    /// Database operation failed. Nothing was persisted.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Failed to encode or decode stored data.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Returns `true` for the optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Event store abstraction for persisting and loading domain events.
///
/// # Concurrency
///
/// Implementations must be safe for concurrent use (`Send + Sync`). Appends
/// to the same aggregate are serialized only by the optimistic version check;
/// appends to different aggregates may proceed in parallel.
///
/// # Atomicity
///
/// `append_events` either persists the whole batch with contiguous sequence
/// numbers or persists nothing.
///
/// # Ordering
///
/// `read_all` returns events in global commit order. A position handed out
/// by `read_all` never later gains a predecessor, so readers can resume from
/// the last position they saw.
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate with optimistic concurrency.
    ///
    /// `events` must be numbered `expected_version + 1, expected_version + 2, …`
    /// and all belong to `aggregate_id`.
    ///
    /// # Returns
    ///
    /// The new version of the aggregate (the last event's sequence number).
    ///
    /// # Errors
    ///
    /// - `EventStoreError::ConcurrencyConflict`: the current version is not `expected_version`
    /// - `EventStoreError::InvalidBatch`: the batch is malformed
    /// - `EventStoreError::DatabaseError`: the write failed
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>>;

    /// Load an aggregate's events in sequence order.
    ///
    /// With `from_version`, only events with a sequence number greater than or
    /// equal to it are returned. An aggregate with no events yields an empty
    /// vector.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::DatabaseError` if the read fails.
    fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>>;

    /// Read at most `limit` events with a global position strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::DatabaseError` if the read fails.
    fn read_all(
        &self,
        after: GlobalPosition,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>>;
}

/// Check that `events` may be appended to `aggregate_id` at `expected_version`.
///
/// Shared by store implementations so that every backend rejects the same
/// malformed batches.
///
/// # Errors
///
/// Returns `EventStoreError::InvalidBatch` describing the first problem found.
pub fn validate_batch(
    aggregate_id: &AggregateId,
    expected_version: Version,
    events: &[DomainEvent],
) -> Result<(), EventStoreError> {
    let invalid = |reason: String| EventStoreError::InvalidBatch {
        aggregate_id: aggregate_id.clone(),
        reason,
    };

    if events.is_empty() {
        return Err(invalid("batch is empty".to_string()));
    }

    let mut expected = expected_version;
    for event in events {
        expected = expected.next();
        if &event.aggregate_id != aggregate_id {
            return Err(invalid(format!(
                "event for {} in batch",
                event.aggregate_id
            )));
        }
        if event.sequence_number != expected {
            return Err(invalid(format!(
                "sequence number {} where {expected} was expected",
                event.sequence_number
            )));
        }
    }
    Ok(())
}

/// Lazily stream the log in global commit order, starting after `after`.
///
/// Pages of `batch_size` events are fetched on demand, so memory use stays
/// bounded regardless of log size. The stream is restartable: pass the last
/// position seen to resume.
pub fn stream_all<S>(
    store: &S,
    after: GlobalPosition,
    batch_size: usize,
) -> impl Stream<Item = Result<StoredEvent, EventStoreError>> + Send + '_
where
    S: EventStore + ?Sized,
{
    let batch_size = batch_size.max(1);
    async_stream::try_stream! {
        let mut cursor = after;
        loop {
            let page = store.read_all(cursor, batch_size).await?;
            let exhausted = page.len() < batch_size;
            for stored in page {
                cursor = stored.position;
                yield stored;
            }
            if exhausted {
                break;
            }
        }
    }
}
