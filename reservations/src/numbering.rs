//! Reservation number allocation.
//!
//! Numbers come from a per-month counter stream in the event store,
//! `reservation-number-YYYYMM`. Allocating appends one
//! `ReservationNumberAllocated.v1` event with an optimistic version check;
//! the new stream version is the number. Two instances racing for the same
//! number conflict, and the loser retries with the next one, so numbers are
//! unique without any process-local counter being authoritative.
//!
//! Numbers burned by a create that is later rejected are not reused, so the
//! sequence may have gaps.

use crate::types::ReservationNumber;
use medtour_core::environment::Clock;
use medtour_core::event::{DomainEvent, Event, EventError};
use medtour_core::event_store::{EventStore, EventStoreError};
use medtour_core::stream::{AggregateId, Version};
use medtour_runtime::RetryPolicy;
use medtour_runtime::retry::retry_with_predicate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Prefix of counter stream ids.
pub const COUNTER_STREAM_PREFIX: &str = "reservation-number-";

/// Appended once per allocated number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationNumberAllocated {
    /// The allocated number.
    pub number: ReservationNumber,
}

impl ReservationNumberAllocated {
    /// Type string of this event.
    pub const EVENT_TYPE: &'static str = "ReservationNumberAllocated.v1";
}

impl Event for ReservationNumberAllocated {
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }
}

/// Why a number could not be allocated.
#[derive(Error, Debug)]
pub enum NumberingError {
    /// Other allocators kept winning.
    #[error("reservation number allocation for {period} kept conflicting")]
    Contended {
        /// The month being allocated.
        period: String,
    },

    /// The event store failed.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// The allocation event could not be encoded.
    #[error(transparent)]
    Encode(#[from] EventError),
}

impl NumberingError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::EventStore(err) if err.is_conflict())
    }
}

/// Allocates unique reservation numbers through the event store.
pub struct ReservationNumberAllocator {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    /// Last version seen per counter stream, so an allocation only reads the tail.
    last_seen: Mutex<HashMap<AggregateId, Version>>,
}

impl ReservationNumberAllocator {
    /// Create an allocator.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            policy: RetryPolicy::builder()
                .max_retries(10)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(50))
                .jitter(true)
                .build(),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the conflict retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Counter stream for a `YYYYMM` period.
    #[must_use]
    pub fn counter_stream(period: &str) -> AggregateId {
        AggregateId::new(format!("{COUNTER_STREAM_PREFIX}{period}"))
    }

    /// Allocate the next number for the current month.
    ///
    /// # Errors
    ///
    /// - `NumberingError::Contended` if conflicts outlast the retry policy
    /// - `NumberingError::EventStore` if the store fails
    pub async fn allocate(&self) -> Result<ReservationNumber, NumberingError> {
        let now = self.clock.now();
        let period = now.format("%Y%m").to_string();
        let stream = Self::counter_stream(&period);

        let result = retry_with_predicate(
            &self.policy,
            "allocate_reservation_number",
            || self.attempt(&stream, &period, now),
            NumberingError::is_conflict,
        )
        .await;

        match result {
            Ok(number) => {
                tracing::debug!(number = %number, "Reservation number allocated");
                Ok(number)
            }
            Err(err) if err.is_conflict() => {
                tracing::warn!(period = %period, "Reservation number allocation exhausted retries");
                Err(NumberingError::Contended { period })
            }
            Err(err) => Err(err),
        }
    }

    async fn attempt(
        &self,
        stream: &AggregateId,
        period: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ReservationNumber, NumberingError> {
        let known = self.known_version(stream);
        let tail = self
            .store
            .load_events(stream.clone(), Some(known.next()))
            .await?;
        let current = tail.last().map_or(known, |e| e.sequence_number);

        let next = current.next();
        let number = ReservationNumber::format(period, next.value());
        let event = DomainEvent::from_event(
            stream.clone(),
            next,
            &ReservationNumberAllocated {
                number: number.clone(),
            },
            now,
        )?;

        match self.store.append_events(stream.clone(), current, vec![event]).await {
            Ok(version) => {
                self.remember(stream, version);
                Ok(number)
            }
            Err(err) => {
                self.remember(stream, current);
                Err(err.into())
            }
        }
    }

    fn known_version(&self, stream: &AggregateId) -> Version {
        self.last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(stream)
            .copied()
            .unwrap_or(Version::INITIAL)
    }

    fn remember(&self, stream: &AggregateId, version: Version) {
        let mut last_seen = self
            .last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = last_seen.entry(stream.clone()).or_insert(version);
        if *entry < version {
            *entry = version;
        }
    }
}
