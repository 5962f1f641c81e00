//! MedTour reservation service.
//!
//! Event-sourced reservations with a CQRS read side:
//!
//! ```text
//! Write side:
//!   HTTP ─► ReservationService ─► CommandDispatcher ─► Reservation (handle/apply)
//!                                        │
//!                                        ▼
//!                                   EventStore  (append with expected version)
//!                                        │
//!                                        ▼ publish
//!                                  EventPublisher
//!                                   │          │
//! Read side:                        ▼          ▼
//!                        ProjectionEngine   ConfirmationNotifier
//!                               │
//!                               ▼
//!                     ReservationReadModel ◄── ReservationQueries ◄── HTTP
//! ```
//!
//! # Reservation lifecycle
//!
//! `NONE → PENDING → CONFIRMED → CANCELLED`, with `PENDING → CANCELLED`
//! allowed directly. Anything else is an invalid state transition.
//!
//! # Consistency
//!
//! Commands are strongly consistent: each one reloads the reservation from
//! its events and appends with an optimistic version check. Queries read the
//! projection and lag the write side by however long delivery takes.

pub mod aggregate;
pub mod api;
pub mod app;
pub mod config;
pub mod notifier;
pub mod numbering;
pub mod queries;
pub mod read_model;
pub mod service;
pub mod types;

pub use aggregate::{NewReservation, Reservation, ReservationCommand, ReservationError, ReservationEvent};
pub use app::AppState;
pub use config::Config;
pub use queries::ReservationQueries;
pub use read_model::{ReservationFilter, ReservationReadModel, ReservationView};
pub use service::{CommandReceipt, CreateReservation, ReservationService, ServiceError};
pub use types::{HospitalId, ProcedureType, ReservationNumber, ReservationStatus, UserId, ValidationError};
