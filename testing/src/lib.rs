//! # MedTour Testing
//!
//! Testing utilities for the reservation core.
//!
//! This crate provides:
//! - An in-memory [`EventStore`](medtour_core::event_store::EventStore) plus
//!   fault-injecting and lockstep wrappers
//! - A controllable clock
//! - Recording subscribers and event buses
//!
//! ## Example
//!
//! ```ignore
//! use medtour_testing::{InMemoryEventStore, RecordingEventBus, test_clock};
//!
//! #[tokio::test]
//! async fn confirm_flow() {
//!     let store = Arc::new(InMemoryEventStore::new());
//!     let bus = Arc::new(RecordingEventBus::new());
//!     let dispatcher = CommandDispatcher::<Reservation>::new(store, bus, Arc::new(test_clock()));
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use medtour_core::environment::Clock;

pub mod event_store;
pub mod subscribers;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Clock that returns a fixed time until advanced.
    ///
    /// Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a clock frozen at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self
                .time
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self
                .time
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// A clock frozen at 2025-01-01T00:00:00Z.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

pub use event_store::{FaultyEventStore, InMemoryEventStore, LockstepEventStore};
pub use mocks::{FixedClock, test_clock};
pub use subscribers::{RecordingEventBus, RecordingSubscriber};
