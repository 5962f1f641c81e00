//! # MedTour Runtime
//!
//! Runtime services for the event-sourced reservation core.
//!
//! ## Core Components
//!
//! - **Command dispatcher**: replay, validate, append, retry on conflict ([`dispatcher`])
//! - **Event publisher**: at-least-once, per-aggregate ordered delivery ([`publisher`])
//! - **Quarantine**: dead letter queue for events a subscriber gave up on ([`dead_letter`])
//! - **Retry**: exponential backoff with classified errors ([`retry`])
//! - **Observability**: health checks and Prometheus metrics ([`health`], [`metrics`])
//!
//! ## Example
//!
//! ```ignore
//! use medtour_runtime::{CommandDispatcher, EventPublisher};
//!
//! let publisher = Arc::new(
//!     EventPublisher::builder(Arc::clone(&store))
//!         .subscribe(read_model_engine)
//!         .lanes(4)
//!         .build(),
//! );
//! let dispatcher = CommandDispatcher::<Reservation>::new(store, publisher, clock);
//! let outcome = dispatcher.execute(&aggregate_id, &command).await?;
//! ```

pub mod dead_letter;
pub mod dispatcher;
pub mod health;
pub mod metrics;
pub mod publisher;
pub mod retry;

pub use dead_letter::{DeadLetterQueue, QuarantinedEvent};
pub use dispatcher::{CommandDispatcher, CommandError, CommandOutcome};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use publisher::{EventPublisher, EventPublisherBuilder};
pub use retry::RetryPolicy;
