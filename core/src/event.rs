//! Event trait and the stored event envelope.
//!
//! Events are facts about things that have happened to an aggregate and are
//! immutable once appended. Domain code works with typed events implementing
//! [`Event`]; the store and everything downstream of it works with the
//! type-erased [`DomainEvent`] envelope.
//!
//! # Design
//!
//! Payloads are serialized with `bincode`. The envelope carries a stable,
//! versioned `event_type` string so that consumers can route on it without
//! decoding the payload, and ignore types they do not understand.
//!
//! # Example
//!
//! ```
//! use medtour_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum CounterEvent {
//!     Incremented { by: u32 },
//! }
//!
//! impl Event for CounterEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             CounterEvent::Incremented { .. } => "Incremented.v1",
//!         }
//!     }
//! }
//! ```

use crate::stream::{AggregateId, GlobalPosition, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// A typed domain event that can be stored and replayed.
///
/// # Event Naming Convention
///
/// `event_type()` returns a stable identifier with a version suffix, for
/// example `"ReservationCreated.v1"`. A schema change gets a new suffix.
///
/// # Serialization
///
/// The default `to_bytes`/`from_bytes` use `bincode` and work for any type
/// implementing `Serialize` and `DeserializeOwned`.
pub trait Event: Send + Sync + 'static {
    /// Returns the versioned event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are not a valid
    /// encoding of this type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: Sized + DeserializeOwned,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// The persisted form of a domain event.
///
/// `sequence_number` is strictly increasing per `aggregate_id`, starts at 1
/// and has no gaps. Once appended, a `DomainEvent` is never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,
    /// Position of this event in the aggregate's history (1-based).
    pub sequence_number: Version,
    /// Versioned event type identifier (e.g. `"ReservationCreated.v1"`).
    pub event_type: String,
    /// Bincode-encoded event body.
    pub payload: Vec<u8>,
    /// When the event happened, as decided by the command handler.
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Wrap a typed event into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the payload cannot be encoded.
    pub fn from_event<E>(
        aggregate_id: AggregateId,
        sequence_number: Version,
        event: &E,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, EventError>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            aggregate_id,
            sequence_number,
            event_type: event.event_type().to_string(),
            payload: event.to_bytes()?,
            occurred_at,
        })
    }

    /// Decode the payload as a typed event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload does not
    /// decode as `E`.
    pub fn decode<E>(&self) -> Result<E, EventError>
    where
        E: Event + DeserializeOwned,
    {
        E::from_bytes(&self.payload)
    }
}

/// A [`DomainEvent`] together with its position in the global commit order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Global commit position assigned by the store.
    pub position: GlobalPosition,
    /// The event itself.
    pub event: DomainEvent,
}
