//! Command dispatching for event-sourced aggregates.
//!
//! For every command the dispatcher:
//!
//! 1. loads the aggregate's history and replays it to `(state, version)`,
//! 2. lets the aggregate validate the command and emit events,
//! 3. numbers the events `version + 1, …` and appends them expecting `version`,
//! 4. on a concurrency conflict goes back to step 1, a bounded number of times,
//! 5. hands the committed events to the event bus without waiting for delivery.
//!
//! No locks are taken: commands on the same aggregate are serialized by the
//! store's optimistic version check alone.

use crate::metrics::{CommandMetrics, EventStoreMetrics};
use crate::retry::{RetryPolicy, retry_with_predicate};
use medtour_core::aggregate::{Aggregate, ReplayError, replay};
use medtour_core::environment::Clock;
use medtour_core::event::{DomainEvent, EventError};
use medtour_core::event_bus::EventBus;
use medtour_core::event_store::{EventStore, EventStoreError};
use medtour_core::stream::{AggregateId, Version};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a command did not commit.
#[derive(Error, Debug)]
pub enum CommandError<E> {
    /// The aggregate refused the command. Never retried.
    #[error("Command rejected: {0}")]
    Rejected(E),

    /// Other writers kept winning; conflict retries are exhausted.
    #[error("Concurrency conflict on {aggregate_id} after {attempts} attempts")]
    Conflict {
        /// The contended aggregate.
        aggregate_id: AggregateId,
        /// Attempts made, including the first.
        attempts: usize,
    },

    /// The event store failed. Nothing was committed.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// The stored history could not be replayed.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// A new event could not be encoded.
    #[error(transparent)]
    Encode(#[from] EventError),
}

impl<E> CommandError<E> {
    fn is_store_conflict(&self) -> bool {
        matches!(self, Self::EventStore(err) if err.is_conflict())
    }

    const fn outcome_label(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::Conflict { .. } => "conflict",
            Self::EventStore(_) | Self::Replay(_) | Self::Encode(_) => "error",
        }
    }
}

/// The result of a committed command.
#[derive(Debug, Clone)]
pub struct CommandOutcome<A> {
    /// Aggregate state after the new events.
    pub state: A,
    /// Aggregate version after the new events.
    pub version: Version,
    /// The committed events, in sequence order.
    pub events: Vec<DomainEvent>,
}

/// Runs commands against one aggregate type.
pub struct CommandDispatcher<A> {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    conflict_policy: RetryPolicy,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for CommandDispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            clock: Arc::clone(&self.clock),
            conflict_policy: self.conflict_policy.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> CommandDispatcher<A> {
    /// Create a dispatcher.
    ///
    /// The default conflict policy retries three times with a short jittered backoff.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            conflict_policy: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(200))
                .jitter(true)
                .build(),
            _aggregate: PhantomData,
        }
    }

    /// Replace the conflict retry policy.
    #[must_use]
    pub fn with_conflict_policy(mut self, policy: RetryPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Rebuild an aggregate from the store without handling a command.
    ///
    /// # Errors
    ///
    /// Returns `CommandError::EventStore` or `CommandError::Replay` if the
    /// history cannot be loaded or replayed.
    pub async fn load(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<(A, Version), CommandError<A::Error>> {
        let history = self.store.load_events(aggregate_id.clone(), None).await?;
        EventStoreMetrics::record_load(history.len());
        let hydrated = replay::<A>(&history)?;
        Ok((hydrated.state, hydrated.version))
    }

    /// Handle `command` for `aggregate_id`, retrying on concurrency conflicts.
    ///
    /// # Errors
    ///
    /// - `CommandError::Rejected`: the aggregate refused the command
    /// - `CommandError::Conflict`: conflict retries were exhausted
    /// - `CommandError::EventStore`, `Replay`, `Encode`: infrastructure failures
    pub async fn execute(
        &self,
        aggregate_id: &AggregateId,
        command: &A::Command,
    ) -> Result<CommandOutcome<A>, CommandError<A::Error>> {
        let command_name = A::command_name(command);
        let started = Instant::now();
        let attempts = AtomicUsize::new(0);

        let result = retry_with_predicate(
            &self.conflict_policy,
            command_name,
            || {
                if attempts.fetch_add(1, Ordering::Relaxed) > 0 {
                    CommandMetrics::record_conflict_retry(A::AGGREGATE_TYPE);
                }
                self.attempt(aggregate_id, command)
            },
            CommandError::<A::Error>::is_store_conflict,
        )
        .await;
        let attempts = attempts.into_inner();

        let result = result.map_err(|err| {
            if err.is_store_conflict() {
                CommandError::Conflict {
                    aggregate_id: aggregate_id.clone(),
                    attempts,
                }
            } else {
                err
            }
        });

        match &result {
            Ok(outcome) => {
                CommandMetrics::record_outcome(A::AGGREGATE_TYPE, command_name, "ok", started.elapsed());
                tracing::info!(
                    aggregate = A::AGGREGATE_TYPE,
                    aggregate_id = %aggregate_id,
                    command = command_name,
                    version = %outcome.version,
                    attempts,
                    "Command committed"
                );
                self.publish(&outcome.events);
            }
            Err(err) => {
                CommandMetrics::record_outcome(
                    A::AGGREGATE_TYPE,
                    command_name,
                    err.outcome_label(),
                    started.elapsed(),
                );
                match err {
                    CommandError::Rejected(reason) => tracing::info!(
                        aggregate_id = %aggregate_id,
                        command = command_name,
                        reason = %reason,
                        "Command rejected"
                    ),
                    CommandError::Conflict { .. } => tracing::warn!(
                        aggregate_id = %aggregate_id,
                        command = command_name,
                        attempts,
                        "Command gave up after repeated conflicts"
                    ),
                    _ => tracing::error!(
                        aggregate_id = %aggregate_id,
                        command = command_name,
                        error = %err,
                        "Command failed"
                    ),
                }
            }
        }

        result
    }

    async fn attempt(
        &self,
        aggregate_id: &AggregateId,
        command: &A::Command,
    ) -> Result<CommandOutcome<A>, CommandError<A::Error>> {
        let (state, version) = self.load(aggregate_id).await?;
        let now = self.clock.now();
        let new_events = state.handle(command, now).map_err(CommandError::Rejected)?;

        if new_events.is_empty() {
            return Ok(CommandOutcome {
                state,
                version,
                events: Vec::new(),
            });
        }

        let mut state = state;
        let mut next = version;
        let mut envelopes = Vec::with_capacity(new_events.len());
        for event in &new_events {
            next = next.next();
            envelopes.push(DomainEvent::from_event(aggregate_id.clone(), next, event, now)?);
            state = state.apply(event);
        }

        let append_started = Instant::now();
        let new_version = self
            .store
            .append_events(aggregate_id.clone(), version, envelopes.clone())
            .await
            .inspect_err(|err| {
                if err.is_conflict() {
                    EventStoreMetrics::record_conflict();
                    tracing::debug!(
                        aggregate_id = %aggregate_id,
                        expected = %version,
                        "Append lost an optimistic concurrency race"
                    );
                }
            })?;
        EventStoreMetrics::record_append(envelopes.len(), append_started.elapsed());

        Ok(CommandOutcome {
            state,
            version: new_version,
            events: envelopes,
        })
    }

    fn publish(&self, events: &[DomainEvent]) {
        if events.is_empty() {
            return;
        }
        if let Err(err) = self.bus.publish(events) {
            // The events are durable; catch-up or gap repair delivers them later.
            tracing::warn!(
                error = %err,
                count = events.len(),
                "Committed events could not be enqueued for publishing"
            );
        }
    }
}
