//! The reservation aggregate.
//!
//! ```text
//!   NONE ──Create──► PENDING ──Confirm──► CONFIRMED
//!                       │                     │
//!                       └──Cancel──► CANCELLED ◄──Cancel──┘
//! ```
//!
//! `CANCELLED` is terminal. A `CONFIRMED` reservation can still be cancelled
//! but not confirmed again.

use crate::types::{
    HospitalId, MAX_REASON_LEN, ProcedureType, ReservationNumber, ReservationStatus, UserId,
    ValidationError, validated_text,
};
use chrono::{DateTime, NaiveDate, Utc};
use medtour_core::aggregate::Aggregate;
use medtour_core::event::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validated details of a new reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    /// Patient.
    pub user_id: UserId,
    /// Hospital.
    pub hospital_id: HospitalId,
    /// Procedure code.
    pub procedure_type: ProcedureType,
    /// Day of the procedure.
    pub reservation_date: NaiveDate,
}

impl NewReservation {
    /// Validate raw request fields.
    ///
    /// # Errors
    ///
    /// Returns the first `ValidationError` found.
    pub fn parse(
        user_id: &str,
        hospital_id: &str,
        procedure_type: &str,
        reservation_date: NaiveDate,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            user_id: UserId::parse(user_id)?,
            hospital_id: HospitalId::parse(hospital_id)?,
            procedure_type: ProcedureType::parse(procedure_type)?,
            reservation_date,
        })
    }

    /// Reject dates before the current UTC day.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::DateInPast`.
    pub fn check_date(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let today = now.date_naive();
        if self.reservation_date < today {
            return Err(ValidationError::DateInPast {
                date: self.reservation_date,
                today,
            });
        }
        Ok(())
    }
}

/// Commands accepted by a reservation.
#[derive(Clone, Debug)]
pub enum ReservationCommand {
    /// Create the reservation with a pre-allocated number.
    Create {
        /// What is being reserved.
        details: NewReservation,
        /// Number allocated for it.
        number: ReservationNumber,
    },
    /// Confirm a pending reservation.
    Confirm {
        /// Who confirmed it.
        confirmed_by: String,
    },
    /// Cancel a pending or confirmed reservation.
    Cancel {
        /// Why it was cancelled.
        reason: String,
    },
}

/// Events emitted by a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationEvent {
    /// The reservation exists, pending confirmation.
    Created {
        /// Human-facing number.
        number: ReservationNumber,
        /// What was reserved.
        details: NewReservation,
    },
    /// The reservation was confirmed.
    Confirmed {
        /// Who confirmed it.
        confirmed_by: String,
    },
    /// The reservation was cancelled.
    Cancelled {
        /// Why it was cancelled.
        reason: String,
    },
}

impl ReservationEvent {
    /// Type string of [`ReservationEvent::Created`].
    pub const CREATED: &'static str = "ReservationCreated.v1";
    /// Type string of [`ReservationEvent::Confirmed`].
    pub const CONFIRMED: &'static str = "ReservationConfirmed.v1";
    /// Type string of [`ReservationEvent::Cancelled`].
    pub const CANCELLED: &'static str = "ReservationCancelled.v1";

    /// Whether `event_type` names a reservation event.
    #[must_use]
    pub fn is_reservation_event(event_type: &str) -> bool {
        matches!(event_type, Self::CREATED | Self::CONFIRMED | Self::CANCELLED)
    }
}

impl Event for ReservationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => Self::CREATED,
            Self::Confirmed { .. } => Self::CONFIRMED,
            Self::Cancelled { .. } => Self::CANCELLED,
        }
    }
}

/// Why a reservation refused a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// The command carried invalid data.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The command is not allowed in the current state.
    #[error("cannot {command} a reservation in state {}", state_name(.state))]
    InvalidStateTransition {
        /// The refused command.
        command: &'static str,
        /// Current status, `None` if the reservation does not exist.
        state: Option<ReservationStatus>,
    },
}

#[allow(clippy::ref_option)]
fn state_name(state: &Option<ReservationStatus>) -> &'static str {
    ReservationStatus::label(*state)
}

/// Reservation state rebuilt from its events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reservation {
    /// `None` until created.
    pub status: Option<ReservationStatus>,
    /// Human-facing number, once created.
    pub number: Option<ReservationNumber>,
    /// What was reserved, once created.
    pub details: Option<NewReservation>,
    /// Set by confirmation.
    pub confirmed_by: Option<String>,
    /// Set by cancellation.
    pub cancellation_reason: Option<String>,
}

impl Aggregate for Reservation {
    const AGGREGATE_TYPE: &'static str = "reservation";

    type Command = ReservationCommand;
    type Event = ReservationEvent;
    type Error = ReservationError;

    fn command_name(command: &ReservationCommand) -> &'static str {
        match command {
            ReservationCommand::Create { .. } => "create",
            ReservationCommand::Confirm { .. } => "confirm",
            ReservationCommand::Cancel { .. } => "cancel",
        }
    }

    fn handle(
        &self,
        command: &ReservationCommand,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationEvent>, ReservationError> {
        let refuse = || ReservationError::InvalidStateTransition {
            command: Self::command_name(command),
            state: self.status,
        };

        match command {
            ReservationCommand::Create { details, number } => {
                details.check_date(now)?;
                if self.status.is_some() {
                    return Err(refuse());
                }
                Ok(vec![ReservationEvent::Created {
                    number: number.clone(),
                    details: details.clone(),
                }])
            }
            ReservationCommand::Confirm { confirmed_by } => {
                let confirmed_by = validated_text("confirmedBy", confirmed_by, None)?;
                match self.status {
                    Some(ReservationStatus::Pending) => {
                        Ok(vec![ReservationEvent::Confirmed { confirmed_by }])
                    }
                    _ => Err(refuse()),
                }
            }
            ReservationCommand::Cancel { reason } => {
                let reason = validated_text("reason", reason, Some(MAX_REASON_LEN))?;
                match self.status {
                    Some(ReservationStatus::Pending | ReservationStatus::Confirmed) => {
                        Ok(vec![ReservationEvent::Cancelled { reason }])
                    }
                    _ => Err(refuse()),
                }
            }
        }
    }

    fn apply(mut self, event: &ReservationEvent) -> Self {
        match event {
            ReservationEvent::Created { number, details } => {
                self.status = Some(ReservationStatus::Pending);
                self.number = Some(number.clone());
                self.details = Some(details.clone());
            }
            ReservationEvent::Confirmed { confirmed_by } => {
                self.status = Some(ReservationStatus::Confirmed);
                self.confirmed_by = Some(confirmed_by.clone());
            }
            ReservationEvent::Cancelled { reason } => {
                self.status = Some(ReservationStatus::Cancelled);
                self.cancellation_reason = Some(reason.clone());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn now() -> DateTime<Utc> {
        "2025-01-01T09:00:00Z".parse().unwrap()
    }

    fn details(date: &str) -> NewReservation {
        NewReservation::parse("u-1", "h-1", "mri", date.parse().unwrap()).unwrap()
    }

    fn create() -> ReservationCommand {
        ReservationCommand::Create {
            details: details("2025-02-01"),
            number: ReservationNumber::format("202501", 1),
        }
    }

    fn confirm() -> ReservationCommand {
        ReservationCommand::Confirm {
            confirmed_by: "agent-7".to_string(),
        }
    }

    fn cancel() -> ReservationCommand {
        ReservationCommand::Cancel {
            reason: "patient request".to_string(),
        }
    }

    fn run(commands: &[ReservationCommand]) -> (Reservation, Vec<Result<(), ReservationError>>) {
        let mut state = Reservation::default();
        let mut results = Vec::new();
        for command in commands {
            match state.handle(command, now()) {
                Ok(events) => {
                    state = events.iter().fold(state, |s, e| s.apply(e));
                    results.push(Ok(()));
                }
                Err(err) => results.push(Err(err)),
            }
        }
        (state, results)
    }

    #[test]
    fn create_confirm_cancel() {
        let (state, results) = run(&[create(), confirm(), cancel()]);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(state.status, Some(ReservationStatus::Cancelled));
        assert_eq!(state.confirmed_by.as_deref(), Some("agent-7"));
        assert_eq!(state.details.unwrap().procedure_type.as_str(), "MRI");
    }

    #[test]
    fn pending_can_be_cancelled_directly() {
        let (state, results) = run(&[create(), cancel()]);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(state.status, Some(ReservationStatus::Cancelled));
    }

    #[test]
    fn cancelled_is_terminal() {
        let (_, results) = run(&[create(), cancel(), confirm(), cancel()]);
        assert_eq!(
            results[2],
            Err(ReservationError::InvalidStateTransition {
                command: "confirm",
                state: Some(ReservationStatus::Cancelled),
            })
        );
        assert!(matches!(
            results[3],
            Err(ReservationError::InvalidStateTransition { command: "cancel", .. })
        ));
    }

    #[test]
    fn second_confirm_is_rejected() {
        let (_, results) = run(&[create(), confirm(), confirm()]);
        assert!(matches!(
            results[2],
            Err(ReservationError::InvalidStateTransition {
                state: Some(ReservationStatus::Confirmed),
                ..
            })
        ));
    }

    #[test]
    fn commands_on_missing_reservation_report_none() {
        let err = Reservation::default().handle(&confirm(), now()).unwrap_err();
        assert_eq!(err.to_string(), "cannot confirm a reservation in state NONE");
    }

    #[test]
    fn create_twice_is_rejected() {
        let (_, results) = run(&[create(), create()]);
        assert!(matches!(
            results[1],
            Err(ReservationError::InvalidStateTransition { command: "create", .. })
        ));
    }

    #[test]
    fn past_dates_are_invalid_but_today_is_fine() {
        let past = ReservationCommand::Create {
            details: details("2024-12-31"),
            number: ReservationNumber::format("202501", 1),
        };
        assert!(matches!(
            Reservation::default().handle(&past, now()),
            Err(ReservationError::Validation(ValidationError::DateInPast { .. }))
        ));

        let today = ReservationCommand::Create {
            details: details("2025-01-01"),
            number: ReservationNumber::format("202501", 1),
        };
        assert!(Reservation::default().handle(&today, now()).is_ok());
    }

    #[test]
    fn blank_reason_and_confirmer_are_invalid() {
        let (pending, _) = run(&[create()]);
        let blank = ReservationCommand::Confirm {
            confirmed_by: " ".to_string(),
        };
        assert!(matches!(
            pending.handle(&blank, now()),
            Err(ReservationError::Validation(ValidationError::Empty { field: "confirmedBy" }))
        ));

        let long = ReservationCommand::Cancel {
            reason: "x".repeat(501),
        };
        assert!(matches!(
            pending.handle(&long, now()),
            Err(ReservationError::Validation(ValidationError::TooLong { field: "reason", .. }))
        ));
    }

    #[test]
    fn events_carry_versioned_types_and_decode() {
        let event = ReservationEvent::Confirmed {
            confirmed_by: "agent-7".to_string(),
        };
        assert_eq!(event.event_type(), "ReservationConfirmed.v1");
        let bytes = event.to_bytes().unwrap();
        assert_eq!(ReservationEvent::from_bytes(&bytes).unwrap(), event);
        assert!(ReservationEvent::is_reservation_event("ReservationCreated.v1"));
        assert!(!ReservationEvent::is_reservation_event("ReservationNumberAllocated.v1"));
    }
}
