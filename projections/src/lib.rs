//! Projection engine for MedTour read models.
//!
//! # Overview
//!
//! [`ProjectionEngine`] turns any [`ReadModel`](medtour_core::projection::ReadModel)
//! into a subscriber of the event publisher:
//! - **Idempotent apply**: per-aggregate high-water marks stored with the view
//! - **Rebuild**: fold the whole event log into a fresh store, swap it in on success
//! - **Serving**: queries read the current store and are never blocked by a rebuild
//!
//! ```ignore
//! let engine = Arc::new(ProjectionEngine::<ReservationView>::new(store.clone()));
//! let publisher = EventPublisher::builder(store)
//!     .subscribe(engine.clone())
//!     .build();
//!
//! let pending = engine.read(|view| view.by_status(Status::Pending).len());
//! ```

pub mod engine;

pub use engine::{Anomaly, ProjectionEngine, ProjectionStats, RebuildReport};
