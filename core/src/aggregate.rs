//! Aggregates: state rebuilt by folding an event history.
//!
//! An aggregate never persists its state. It is reconstructed on every command
//! by replaying its events through the pure [`Aggregate::apply`] fold, and it
//! decides what happens next through [`Aggregate::handle`], which only emits
//! events and never mutates anything.

use crate::event::{DomainEvent, Event, EventError};
use crate::stream::{AggregateId, Version};
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// A command-side entity whose state is the fold of its events.
///
/// `Default` is the state of an aggregate with no events.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Aggregate type name, used in logs and metrics labels.
    const AGGREGATE_TYPE: &'static str;

    /// Commands this aggregate handles.
    type Command: Send + Sync;

    /// Events this aggregate emits and folds.
    type Event: Event + Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Business rule violations reported by `handle`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short command name, used in logs and metrics labels.
    fn command_name(command: &Self::Command) -> &'static str;

    /// Validate `command` against the current state and return the events it produces.
    ///
    /// Must be deterministic in `(self, command, now)`.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` when the command is not allowed in the current state
    /// or its arguments are invalid. No events are produced in that case.
    fn handle(
        &self,
        command: &Self::Command,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self::Event>, Self::Error>;

    /// Fold one event into the state.
    #[must_use]
    fn apply(self, event: &Self::Event) -> Self;
}

/// Errors raised while replaying a stored history.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The history is not a gap-free sequence starting at 1.
    #[error("Out-of-order event for {aggregate_id}: expected sequence {expected}, found {found}")]
    OutOfOrder {
        /// The aggregate being replayed.
        aggregate_id: AggregateId,
        /// The sequence number that should have come next.
        expected: Version,
        /// The sequence number found instead.
        found: Version,
    },

    /// A stored payload did not decode.
    #[error(transparent)]
    Decode(#[from] EventError),
}

/// An aggregate state together with the version it was rebuilt at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hydrated<A> {
    /// The folded state.
    pub state: A,
    /// Sequence number of the last applied event (0 for no events).
    pub version: Version,
}

impl<A: Aggregate> Hydrated<A> {
    /// Fold the next stored event, checking it is the successor of `version`.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::OutOfOrder` when the event does not carry the next
    /// sequence number and `ReplayError::Decode` when its payload is unreadable.
    pub fn fold(self, stored: &DomainEvent) -> Result<Self, ReplayError> {
        let expected = self.version.next();
        if stored.sequence_number != expected {
            return Err(ReplayError::OutOfOrder {
                aggregate_id: stored.aggregate_id.clone(),
                expected,
                found: stored.sequence_number,
            });
        }
        let event: A::Event = stored.decode()?;
        Ok(Self {
            state: self.state.apply(&event),
            version: expected,
        })
    }
}

/// Rebuild an aggregate from its full history.
///
/// An empty history yields `A::default()` at `Version::INITIAL`.
///
/// # Errors
///
/// See [`Hydrated::fold`].
pub fn replay<A: Aggregate>(history: &[DomainEvent]) -> Result<Hydrated<A>, ReplayError> {
    history
        .iter()
        .try_fold(Hydrated::<A>::default(), |hydrated, stored| hydrated.fold(stored))
}
