//! Domain types for the reservation service.
//!
//! Identifiers and value objects shared by the aggregate, the read model and
//! the HTTP API. Every value object validates on construction, so a value
//! that exists is a valid one.

use chrono::NaiveDate;
use medtour_core::stream::AggregateId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted procedure type.
pub const MAX_PROCEDURE_TYPE_LEN: usize = 64;

/// Longest accepted cancellation reason.
pub const MAX_REASON_LEN: usize = 500;

/// A command or request field failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is blank.
    #[error("{field} must not be empty")]
    Empty {
        /// Field name as seen by clients.
        field: &'static str,
    },

    /// A field exceeds its maximum length.
    #[error("{field} must be at most {max} characters")]
    TooLong {
        /// Field name as seen by clients.
        field: &'static str,
        /// Maximum length in characters.
        max: usize,
    },

    /// The reservation date is before today.
    #[error("reservationDate {date} is before {today}")]
    DateInPast {
        /// Requested date.
        date: NaiveDate,
        /// Current date according to the service clock.
        today: NaiveDate,
    },

    /// A field could not be parsed.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// Field name as seen by clients.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn required(field: &'static str, value: &str, max: Option<usize>) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if let Some(max) = max {
        if trimmed.chars().count() > max {
            return Err(ValidationError::TooLong { field, max });
        }
    }
    Ok(trimmed.to_string())
}

/// Generate a fresh reservation aggregate id.
#[must_use]
pub fn new_reservation_id() -> AggregateId {
    AggregateId::new(Uuid::new_v4().to_string())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap an identifier. Surrounding whitespace is trimmed.
            ///
            /// # Errors
            ///
            /// Returns `ValidationError::Empty` for a blank value.
            pub fn parse(value: &str) -> Result<Self, ValidationError> {
                required($field, value, None).map(Self)
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// The patient who owns a reservation.
    UserId,
    "userId"
);

string_id!(
    /// The hospital performing the procedure.
    HospitalId,
    "hospitalId"
);

/// Medical procedure code, stored upper-cased.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcedureType(String);

impl ProcedureType {
    /// Validate and normalize a procedure type.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Empty` or `ValidationError::TooLong`.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        required("procedureType", value, Some(MAX_PROCEDURE_TYPE_LEN)).map(|v| Self(v.to_uppercase()))
    }

    /// The normalized code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcedureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an existing reservation.
///
/// `NONE` (no events yet) is not a status; it is the absence of one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Created, awaiting confirmation.
    Pending,
    /// Confirmed by the hospital or an agent.
    Confirmed,
    /// Cancelled. Terminal.
    Cancelled,
}

impl ReservationStatus {
    /// Upper-case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Wire name of an optional status, `NONE` when absent.
    #[must_use]
    pub const fn label(status: Option<Self>) -> &'static str {
        match status {
            Some(status) => status.as_str(),
            None => "NONE",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ValidationError::Invalid {
                field: "status",
                reason: format!("unknown status {other:?}"),
            }),
        }
    }
}

/// Human-facing reservation number, `RSV-YYYYMM-NNNNN`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationNumber(String);

impl ReservationNumber {
    /// Format the `sequence`-th number of the month `period` (`YYYYMM`).
    ///
    /// Sequences above 99999 widen the last segment.
    #[must_use]
    pub fn format(period: &str, sequence: u64) -> Self {
        Self(format!("RSV-{period}-{sequence:05}"))
    }

    /// The number as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a free-text field such as `confirmedBy` or `reason`.
///
/// # Errors
///
/// Returns `ValidationError::Empty` or `ValidationError::TooLong`.
pub fn validated_text(field: &'static str, value: &str, max: Option<usize>) -> Result<String, ValidationError> {
    required(field, value, max)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn procedure_type_is_trimmed_and_upper_cased() {
        assert_eq!(ProcedureType::parse("  knee-mri ").unwrap().as_str(), "KNEE-MRI");
    }

    #[test]
    fn procedure_type_length_is_bounded() {
        assert!(ProcedureType::parse(&"x".repeat(64)).is_ok());
        assert_eq!(
            ProcedureType::parse(&"x".repeat(65)),
            Err(ValidationError::TooLong { field: "procedureType", max: 64 })
        );
        assert_eq!(
            ProcedureType::parse("   "),
            Err(ValidationError::Empty { field: "procedureType" })
        );
    }

    #[test]
    fn ids_reject_blank_values() {
        assert_eq!(UserId::parse(""), Err(ValidationError::Empty { field: "userId" }));
        assert_eq!(HospitalId::parse(" h-1 ").unwrap().as_str(), "h-1");
    }

    #[test]
    fn status_round_trips_through_wire_names() {
        for status in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ReservationStatus>().unwrap(), status);
        }
        assert_eq!("confirmed".parse::<ReservationStatus>().unwrap(), ReservationStatus::Confirmed);
        assert!("SHIPPED".parse::<ReservationStatus>().is_err());
        assert_eq!(ReservationStatus::label(None), "NONE");
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&ReservationStatus::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
    }

    #[test]
    fn reservation_numbers_are_zero_padded() {
        assert_eq!(ReservationNumber::format("202501", 7).as_str(), "RSV-202501-00007");
        assert_eq!(ReservationNumber::format("202501", 123_456).as_str(), "RSV-202501-123456");
    }
}
