//! `ProjectionEngine`: keeps a read model consistent with the event log.
//!
//! # Overview
//!
//! The engine owns the serving copy of a [`ReadModel`] and is the only thing
//! that mutates it. It is registered with the publisher as an
//! [`EventSubscriber`], so committed events reach it asynchronously, in
//! sequence order per aggregate, at least once.
//!
//! # Idempotence
//!
//! The store keeps a high-water mark per aggregate next to the view. An event
//! at or below the mark is a duplicate and is skipped; an event that would
//! skip a sequence number is refused so that the view never reflects events
//! out of order.
//!
//! # Rebuild
//!
//! ```text
//!            ┌──────────── gate (write) held for the whole rebuild ───────────┐
//! rebuild ── │ fresh store ◄── fold ◄── stream_all(event store) ── swap in ── │
//!            └────────────────────────────────────────────────────────────────┘
//! apply ──── gate (read) ── fold into serving store
//! queries ── serving store (never blocked by a rebuild)
//! ```
//!
//! A rebuild folds the whole log into a fresh store while the old one keeps
//! serving queries, then swaps it in. If the rebuild fails part-way the fresh
//! store is dropped and the old one stays in place. Incremental application
//! waits for a running rebuild, and rebuilds exclude each other.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use medtour_core::event::DomainEvent;
use medtour_core::event_bus::{DeliveryError, EventSubscriber};
use medtour_core::event_store::{EventStore, stream_all};
use medtour_core::projection::{ApplyOutcome, ProjectionError, ReadModel, Result};
use medtour_core::stream::{AggregateId, GlobalPosition, Version};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

const MAX_ANOMALIES: usize = 1_000;

/// An event the read model could not apply consistently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    /// Aggregate of the offending event.
    pub aggregate_id: AggregateId,
    /// Sequence number of the offending event.
    pub sequence_number: Version,
    /// Type of the offending event.
    pub event_type: String,
    /// What was inconsistent.
    pub reason: String,
}

/// Summary of a completed rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Events folded into the new store.
    pub events_replayed: u64,
    /// Distinct aggregates seen.
    pub aggregates: usize,
    /// Position of the last event folded.
    pub last_position: GlobalPosition,
    /// Anomalies detected while rebuilding.
    pub anomalies: usize,
    /// Wall time of the rebuild.
    pub duration_ms: u64,
    /// When the new store was swapped in.
    pub completed_at: DateTime<Utc>,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectionStats {
    /// Read model name.
    pub read_model: &'static str,
    /// Aggregates reflected in the serving store.
    pub aggregates: usize,
    /// Anomalies currently recorded.
    pub anomalies: usize,
    /// The most recent successful rebuild, if any.
    pub last_rebuild: Option<RebuildReport>,
}

/// A read model together with its per-aggregate high-water marks.
///
/// Marks and view live in one value so that a rebuild swaps both at once.
#[derive(Debug, Default)]
struct ReadModelStore<R> {
    model: R,
    high_water: HashMap<AggregateId, Version>,
}

impl<R: ReadModel> ReadModelStore<R> {
    fn fold(&mut self, event: &DomainEvent) -> Result<ApplyOutcome> {
        let mark = self
            .high_water
            .get(&event.aggregate_id)
            .copied()
            .unwrap_or(Version::INITIAL);

        if event.sequence_number <= mark {
            return Ok(ApplyOutcome::Duplicate);
        }
        if event.sequence_number != mark.next() {
            return Err(ProjectionError::EventProcessing(format!(
                "event {} of {} arrived before {}",
                event.sequence_number,
                event.aggregate_id,
                mark.next()
            )));
        }

        let outcome = self.model.apply(event)?;
        self.high_water
            .insert(event.aggregate_id.clone(), event.sequence_number);
        Ok(outcome)
    }
}

/// Maintains one read model from committed events.
pub struct ProjectionEngine<R: ReadModel> {
    serving: RwLock<ReadModelStore<R>>,
    gate: tokio::sync::RwLock<()>,
    event_store: Arc<dyn EventStore>,
    batch_size: usize,
    anomalies: Mutex<VecDeque<Anomaly>>,
    last_rebuild: Mutex<Option<RebuildReport>>,
}

impl<R: ReadModel> ProjectionEngine<R> {
    /// Create an engine with an empty read model that rebuilds from `event_store`.
    #[must_use]
    pub fn new(event_store: Arc<dyn EventStore>) -> Self {
        Self {
            serving: RwLock::new(ReadModelStore::default()),
            gate: tokio::sync::RwLock::new(()),
            event_store,
            batch_size: 500,
            anomalies: Mutex::new(VecDeque::new()),
            last_rebuild: Mutex::new(None),
        }
    }

    /// Page size used when streaming the log during a rebuild.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Apply one committed event to the serving read model.
    ///
    /// Waits while a rebuild is running.
    ///
    /// # Errors
    ///
    /// - `ProjectionError::EventProcessing` if the event is ahead of the
    ///   aggregate's high-water mark by more than one
    /// - whatever the read model reports for an undecodable event
    pub async fn apply(&self, event: &DomainEvent) -> Result<ApplyOutcome> {
        let _shared = self.gate.read().await;

        let result = self
            .serving
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .fold(event);

        match &result {
            Ok(outcome) => self.record(event, outcome),
            Err(err) => {
                metrics::counter!("projection_events_total", "read_model" => R::NAME, "outcome" => "error")
                    .increment(1);
                tracing::warn!(
                    read_model = R::NAME,
                    aggregate_id = %event.aggregate_id,
                    sequence = %event.sequence_number,
                    error = %err,
                    "Failed to apply event"
                );
            }
        }
        result
    }

    fn record(&self, event: &DomainEvent, outcome: &ApplyOutcome) {
        let label = match outcome {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Ignored => "ignored",
            ApplyOutcome::Anomaly(_) => "anomaly",
        };
        metrics::counter!("projection_events_total", "read_model" => R::NAME, "outcome" => label)
            .increment(1);

        if let ApplyOutcome::Anomaly(reason) = outcome {
            tracing::warn!(
                read_model = R::NAME,
                aggregate_id = %event.aggregate_id,
                sequence = %event.sequence_number,
                event_type = %event.event_type,
                reason = %reason,
                "Projection anomaly, event skipped"
            );
            let mut anomalies = self
                .anomalies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if anomalies.len() >= MAX_ANOMALIES {
                anomalies.pop_front();
            }
            anomalies.push_back(anomaly(event, reason));
        }
    }

    /// Rebuild the read model from the full event log and swap it in.
    ///
    /// Safe to re-run. Queries keep reading the previous store until the swap.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError::Storage` if the log cannot be read and
    /// `ProjectionError::Rebuild` if an event cannot be applied. The previous
    /// store keeps serving in either case.
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let _exclusive = self.gate.write().await;
        let started = Instant::now();
        tracing::info!(read_model = R::NAME, "Rebuilding read model");

        match self.build_fresh().await {
            Ok((fresh, events_replayed, last_position, found)) => {
                let aggregates = fresh.high_water.len();
                *self
                    .serving
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = fresh;

                let report = RebuildReport {
                    events_replayed,
                    aggregates,
                    last_position,
                    anomalies: found.len(),
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    completed_at: Utc::now(),
                };
                *self
                    .anomalies
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = found;
                *self
                    .last_rebuild
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(report.clone());

                metrics::counter!("projection_rebuilds_total", "read_model" => R::NAME, "result" => "ok")
                    .increment(1);
                metrics::histogram!("projection_rebuild_duration_seconds", "read_model" => R::NAME)
                    .record(started.elapsed().as_secs_f64());
                tracing::info!(
                    read_model = R::NAME,
                    events = report.events_replayed,
                    aggregates = report.aggregates,
                    last_position = %report.last_position,
                    duration_ms = report.duration_ms,
                    "Read model rebuilt and swapped in"
                );
                Ok(report)
            }
            Err(err) => {
                metrics::counter!("projection_rebuilds_total", "read_model" => R::NAME, "result" => "failed")
                    .increment(1);
                tracing::error!(
                    read_model = R::NAME,
                    error = %err,
                    "Rebuild failed, previous read model keeps serving"
                );
                Err(err)
            }
        }
    }

    async fn build_fresh(
        &self,
    ) -> Result<(ReadModelStore<R>, u64, GlobalPosition, VecDeque<Anomaly>)> {
        let mut fresh = ReadModelStore::<R>::default();
        let mut found = VecDeque::new();
        let mut replayed = 0_u64;
        let mut last_position = GlobalPosition::START;

        let stream = stream_all(self.event_store.as_ref(), GlobalPosition::START, self.batch_size);
        futures::pin_mut!(stream);

        while let Some(stored) = stream
            .try_next()
            .await
            .map_err(|e| ProjectionError::Storage(format!("reading event log: {e}")))?
        {
            let outcome = fresh.fold(&stored.event).map_err(|e| {
                ProjectionError::Rebuild(format!("applying event at {}: {e}", stored.position))
            })?;
            if let ApplyOutcome::Anomaly(reason) = &outcome {
                if found.len() >= MAX_ANOMALIES {
                    found.pop_front();
                }
                found.push_back(anomaly(&stored.event, reason));
            }
            replayed += 1;
            last_position = stored.position;
        }

        Ok((fresh, replayed, last_position, found))
    }

    /// Run `f` against the serving read model.
    ///
    /// Results are eventually consistent with the event log.
    pub fn read<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        let store = self
            .serving
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&store.model)
    }

    /// Last sequence number reflected for `aggregate_id`.
    #[must_use]
    pub fn high_water_mark(&self, aggregate_id: &AggregateId) -> Version {
        self.serving
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .high_water
            .get(aggregate_id)
            .copied()
            .unwrap_or(Version::INITIAL)
    }

    /// Recorded anomalies, oldest first.
    #[must_use]
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> ProjectionStats {
        ProjectionStats {
            read_model: R::NAME,
            aggregates: self
                .serving
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .high_water
                .len(),
            anomalies: self
                .anomalies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .len(),
            last_rebuild: self
                .last_rebuild
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }
}

impl<R: ReadModel + Clone> ProjectionEngine<R> {
    /// Clone of the serving read model.
    #[must_use]
    pub fn snapshot(&self) -> R {
        self.read(Clone::clone)
    }
}

fn anomaly(event: &DomainEvent, reason: &str) -> Anomaly {
    Anomaly {
        aggregate_id: event.aggregate_id.clone(),
        sequence_number: event.sequence_number,
        event_type: event.event_type.clone(),
        reason: reason.to_string(),
    }
}

impl<R: ReadModel> EventSubscriber for ProjectionEngine<R> {
    fn name(&self) -> &str {
        R::NAME
    }

    fn handle<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), DeliveryError>> + Send + 'a>> {
        Box::pin(async move {
            match self.apply(event).await {
                Ok(_) => Ok(()),
                Err(ProjectionError::Serialization(reason)) => Err(DeliveryError::Permanent(reason)),
                Err(err) => Err(DeliveryError::Transient(err.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// Counts events per aggregate; flags a `Bad.v1` event as an anomaly.
    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    struct Counts(std::collections::BTreeMap<String, u64>);

    impl ReadModel for Counts {
        const NAME: &'static str = "counts";

        fn apply(&mut self, event: &DomainEvent) -> Result<ApplyOutcome> {
            match event.event_type.as_str() {
                "Bad.v1" => Ok(ApplyOutcome::Anomaly("bad event".to_string())),
                "Corrupt.v1" => Err(ProjectionError::Serialization("corrupt".to_string())),
                _ => {
                    *self.0.entry(event.aggregate_id.to_string()).or_default() += 1;
                    Ok(ApplyOutcome::Applied)
                }
            }
        }
    }

    fn event(id: &str, seq: u64, event_type: &str) -> DomainEvent {
        DomainEvent {
            aggregate_id: AggregateId::new(id),
            sequence_number: Version::new(seq),
            event_type: event_type.to_string(),
            payload: vec![],
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn fold_skips_duplicates_and_refuses_gaps() {
        let mut store = ReadModelStore::<Counts>::default();
        assert_eq!(store.fold(&event("a", 1, "T")).unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.fold(&event("a", 1, "T")).unwrap(), ApplyOutcome::Duplicate);
        assert!(store.fold(&event("a", 3, "T")).is_err());
        assert_eq!(store.model.0["a"], 1);
    }

    #[test]
    fn anomalies_still_advance_the_mark() {
        let mut store = ReadModelStore::<Counts>::default();
        assert!(matches!(
            store.fold(&event("a", 1, "Bad.v1")).unwrap(),
            ApplyOutcome::Anomaly(_)
        ));
        assert_eq!(store.high_water[&AggregateId::new("a")], Version::new(1));
    }

    #[test]
    fn failed_apply_does_not_advance_the_mark() {
        let mut store = ReadModelStore::<Counts>::default();
        assert!(store.fold(&event("a", 1, "Corrupt.v1")).is_err());
        assert!(store.high_water.is_empty());
    }
}
