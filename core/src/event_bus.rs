//! Event bus abstraction for delivering committed events to subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Command handler │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  1. Append to   │
//! │   event store   │◄─── Source of truth
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ 2. Publish to   │
//! │    event bus    │◄─── At-least-once delivery
//! └────────┬────────┘
//!          │
//!     ┌────┴─────┐
//!     │          │
//!     ▼          ▼
//! ┌────────┐ ┌──────────┐
//! │ Read   │ │ Notifier │
//! │ model  │ │          │
//! └────────┘ └──────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Store first**: events are published only after the append committed
//! - **At-least-once delivery**: subscribers may see an event more than once
//! - **Idempotency**: subscribers dedupe by `(aggregate_id, sequence_number)`
//! - **Ordered per aggregate**: a subscriber sees one aggregate's events in sequence order
//! - **Decoupled**: `publish` only enqueues; it never waits for subscribers

use crate::event::DomainEvent;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error types for event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// The bus has been shut down and accepts no more events.
    #[error("Event bus is closed")]
    Closed,

    /// Publishing failed for another reason.
    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Why a subscriber could not handle an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// A temporary failure. The event will be redelivered after a backoff.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// The event can never be handled. It is quarantined without further retries.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    /// Returns `true` if retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A consumer of committed events.
///
/// Implementations must be idempotent: the bus guarantees at-least-once
/// delivery and per-aggregate order, not exactly-once delivery.
pub trait EventSubscriber: Send + Sync {
    /// Stable subscriber name, used in logs, metrics and quarantine records.
    fn name(&self) -> &str;

    /// Handle one committed event.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Transient` to ask for a retry, or
    /// `DeliveryError::Permanent` to quarantine the event immediately.
    fn handle<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;
}

/// Publishing side of the bus.
///
/// Subscribers are registered explicitly when the bus is constructed.
pub trait EventBus: Send + Sync {
    /// Enqueue committed events for delivery to every subscriber.
    ///
    /// Returns as soon as the events are queued. Events of one aggregate must
    /// be passed in sequence order.
    ///
    /// # Errors
    ///
    /// Returns `EventBusError::Closed` after shutdown.
    fn publish(&self, events: &[DomainEvent]) -> Result<(), EventBusError>;
}
