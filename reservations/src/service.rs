//! Command handlers for reservations.
//!
//! One method per command. Each validates its input, runs the command
//! through the dispatcher (load, decide, append with optimistic concurrency,
//! publish) and returns the committed version and status.

use crate::aggregate::{NewReservation, Reservation, ReservationCommand, ReservationError};
use crate::numbering::{COUNTER_STREAM_PREFIX, NumberingError, ReservationNumberAllocator};
use crate::types::{ReservationNumber, ReservationStatus, ValidationError, new_reservation_id};
use chrono::NaiveDate;
use medtour_core::environment::Clock;
use medtour_core::stream::{AggregateId, Version};
use medtour_runtime::{CommandDispatcher, CommandError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Raw fields of a create request.
#[derive(Clone, Debug)]
pub struct CreateReservation {
    /// Patient.
    pub user_id: String,
    /// Hospital.
    pub hospital_id: String,
    /// Procedure code.
    pub procedure_type: String,
    /// Day of the procedure.
    pub reservation_date: NaiveDate,
}

/// What a committed command produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReceipt {
    /// The reservation.
    pub reservation_id: AggregateId,
    /// Its number, set on create.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_number: Option<ReservationNumber>,
    /// Version after the command.
    pub version: Version,
    /// Status after the command.
    pub status: ReservationStatus,
}

/// Why a reservation command did not commit.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The request is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The reservation is in the wrong state, or does not exist.
    #[error("cannot {command} a reservation in state {state}")]
    InvalidTransition {
        /// The refused command.
        command: &'static str,
        /// Wire name of the current state, `NONE` if absent.
        state: &'static str,
    },

    /// Concurrent writers kept winning.
    #[error("{0}")]
    Conflict(String),

    /// The event store or an encoder failed. Nothing was committed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<CommandError<ReservationError>> for ServiceError {
    fn from(err: CommandError<ReservationError>) -> Self {
        match err {
            CommandError::Rejected(ReservationError::Validation(e)) => Self::Validation(e),
            CommandError::Rejected(ReservationError::InvalidStateTransition { command, state }) => {
                Self::InvalidTransition {
                    command,
                    state: ReservationStatus::label(state),
                }
            }
            err @ CommandError::Conflict { .. } => Self::Conflict(err.to_string()),
            err => Self::Storage(err.to_string()),
        }
    }
}

impl From<NumberingError> for ServiceError {
    fn from(err: NumberingError) -> Self {
        match err {
            NumberingError::Contended { .. } => Self::Conflict(err.to_string()),
            NumberingError::EventStore(_) | NumberingError::Encode(_) => Self::Storage(err.to_string()),
        }
    }
}

/// Reservation command API.
#[derive(Clone)]
pub struct ReservationService {
    dispatcher: CommandDispatcher<Reservation>,
    numbers: Arc<ReservationNumberAllocator>,
    clock: Arc<dyn Clock>,
}

impl ReservationService {
    /// Create the service.
    #[must_use]
    pub fn new(
        dispatcher: CommandDispatcher<Reservation>,
        numbers: Arc<ReservationNumberAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            numbers,
            clock,
        }
    }

    /// Create a reservation under a fresh id.
    ///
    /// The request is validated before a number is allocated, so malformed
    /// requests never consume numbers.
    ///
    /// # Errors
    ///
    /// `ServiceError::Validation` for bad input; `Conflict` or `Storage` if the
    /// number or the event could not be committed.
    pub async fn create(&self, request: CreateReservation) -> Result<CommandReceipt, ServiceError> {
        let details = NewReservation::parse(
            &request.user_id,
            &request.hospital_id,
            &request.procedure_type,
            request.reservation_date,
        )?;
        details.check_date(self.clock.now())?;

        let number = self.numbers.allocate().await?;
        let id = new_reservation_id();
        let outcome = self
            .dispatcher
            .execute(
                &id,
                &ReservationCommand::Create {
                    details,
                    number: number.clone(),
                },
            )
            .await?;

        Ok(CommandReceipt {
            reservation_id: id,
            reservation_number: Some(number),
            version: outcome.version,
            status: ReservationStatus::Pending,
        })
    }

    /// Confirm a pending reservation.
    ///
    /// # Errors
    ///
    /// `ServiceError::InvalidTransition` unless the reservation is pending;
    /// `Validation` for a blank `confirmed_by`.
    pub async fn confirm(&self, id: &str, confirmed_by: &str) -> Result<CommandReceipt, ServiceError> {
        let command = ReservationCommand::Confirm {
            confirmed_by: confirmed_by.to_string(),
        };
        self.run(id, &command).await
    }

    /// Cancel a pending or confirmed reservation.
    ///
    /// # Errors
    ///
    /// `ServiceError::InvalidTransition` if it is already cancelled or does
    /// not exist; `Validation` for a blank or oversized reason.
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<CommandReceipt, ServiceError> {
        let command = ReservationCommand::Cancel {
            reason: reason.to_string(),
        };
        self.run(id, &command).await
    }

    /// Current state straight from the event store, bypassing the read model.
    ///
    /// # Errors
    ///
    /// `ServiceError::Storage` if the history cannot be loaded.
    pub async fn load(&self, id: &AggregateId) -> Result<(Reservation, Version), ServiceError> {
        Ok(self.dispatcher.load(id).await?)
    }

    async fn run(&self, id: &str, command: &ReservationCommand) -> Result<CommandReceipt, ServiceError> {
        let id = parse_id(id)?;
        let outcome = self.dispatcher.execute(&id, command).await?;
        Ok(CommandReceipt {
            reservation_id: id,
            reservation_number: None,
            version: outcome.version,
            status: outcome.state.status.unwrap_or(ReservationStatus::Pending),
        })
    }
}

fn parse_id(id: &str) -> Result<AggregateId, ValidationError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ValidationError::Empty {
            field: "reservationId",
        });
    }
    // Number counters live in the same store namespace.
    if id.starts_with(COUNTER_STREAM_PREFIX) {
        return Err(ValidationError::Invalid {
            field: "reservationId",
            reason: "not a reservation".to_string(),
        });
    }
    Ok(AggregateId::new(id))
}
