//! Read models built from committed events.
//!
//! # Overview
//!
//! Projections are the **query side of CQRS**. The write side appends events;
//! the read side folds those events into denormalized views that are cheap to
//! query.
//!
//! ```text
//! Write Side:                  Read Side:
//! ┌─────────────────┐         ┌─────────────────┐
//! │  Event Store    │         │  Read model     │
//! │  (events)       │         │  (rows+indexes) │
//! └────────┬────────┘         └─────────────────┘
//!          │                           ▲
//!          │ published                 │ applied by
//!          ▼                           │ projection engine
//! ┌──────────────────────────────────────┐
//! │             Event bus                │
//! └──────────────────────────────────────┘
//! ```
//!
//! A [`ReadModel`] only describes how one event changes the view. Duplicate
//! suppression, ordering, rebuild and serving are the projection engine's
//! job, which keeps read models plain data structures that are easy to test
//! and to compare.

use crate::event::DomainEvent;

/// Errors that can occur during projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Failed to decode an event payload.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Event processing failed.
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// A rebuild did not complete. The previously serving read model is untouched.
    #[error("Rebuild failed: {0}")]
    Rebuild(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// What applying an event did to a read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The view changed.
    Applied,
    /// The event was already reflected (at or below the high-water mark).
    Duplicate,
    /// The event type is not relevant to this view.
    Ignored,
    /// The event could not be applied consistently and was skipped.
    ///
    /// The message describes the inconsistency for operators.
    Anomaly(String),
}

/// A denormalized view folded from events.
///
/// `Default` is the empty view. Implementations should be deterministic:
/// applying the same events in the same order must yield equal views.
pub trait ReadModel: Default + Send + Sync + 'static {
    /// Read model name, used in logs and metrics labels.
    const NAME: &'static str;

    /// Apply one event to the view.
    ///
    /// Called at most once per `(aggregate_id, sequence_number)` and in
    /// sequence order per aggregate.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError::Serialization` if the payload cannot be
    /// decoded. Business inconsistencies are reported as
    /// [`ApplyOutcome::Anomaly`] instead of errors.
    fn apply(&mut self, event: &DomainEvent) -> Result<ApplyOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProjectionError::Rebuild("store unavailable".to_string());
        assert_eq!(err.to_string(), "Rebuild failed: store unavailable");
    }

    #[test]
    fn outcomes_compare() {
        assert_eq!(ApplyOutcome::Applied, ApplyOutcome::Applied);
        assert_ne!(
            ApplyOutcome::Anomaly("a".to_string()),
            ApplyOutcome::Anomaly("b".to_string())
        );
    }
}
