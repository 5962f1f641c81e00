//! Axum integration for the MedTour reservation core.
//!
//! The HTTP layer is a thin imperative shell around the command dispatcher
//! and the read side:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         HTTP shell (Axum)               │  ← JSON, status codes
//! │  - Request parsing                      │  ← Request ids, tracing
//! │  - Error mapping                        │  ← Consistency headers
//! ├─────────────────────────────────────────┤
//! │         Reservation core                │
//! │  - Commands → events (write side)       │
//! │  - Projections → queries (read side)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! This crate holds the pieces that do not depend on the reservation domain:
//! [`AppError`] for JSON error responses, the request-id/tracing middleware,
//! and the health handlers.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod middleware;

pub use error::AppError;
pub use handlers::health::{ReadinessProbe, health_check, health_ready};
pub use middleware::{READ_CONSISTENCY_HEADER, REQUEST_ID_HEADER, eventually_consistent, observed};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
