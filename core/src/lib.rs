//! # MedTour Core
//!
//! Core traits and types for the event-sourced reservation core.
//!
//! The write model persists state exclusively as an ordered, immutable event
//! log; aggregates are rebuilt by replaying that log; read models are folded
//! asynchronously from committed events.
//!
//! ## Core Concepts
//!
//! - **Event**: an immutable fact, stored as a [`event::DomainEvent`] envelope
//! - **Event store**: append-only ledger with optimistic concurrency ([`event_store::EventStore`])
//! - **Aggregate**: state rebuilt by the pure fold [`aggregate::Aggregate::apply`]
//! - **Event bus**: at-least-once, per-aggregate ordered delivery ([`event_bus::EventBus`])
//! - **Read model**: denormalized view folded from events ([`projection::ReadModel`])
//! - **Environment**: injected dependencies such as the [`environment::Clock`]
//!
//! ## Data Flow
//!
//! ```text
//! Command → Aggregate (replay) → new events → EventStore::append_events
//!         → EventBus::publish → projection engine → read model → queries
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod projection;
pub mod stream;

/// Environment traits for dependency injection.
///
/// Handlers take time from an injected clock instead of calling `Utc::now()`
/// so that tests are deterministic.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait for getting current time.
    pub trait Clock: Send + Sync {
        /// Get the current time.
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
