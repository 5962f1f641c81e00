//! Aggregate identification and versioning types.
//!
//! This module defines strong types for aggregate identification (`AggregateId`),
//! per-aggregate ordering (`Version`) and global commit ordering (`GlobalPosition`)
//! used throughout the event store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Error type for `AggregateId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid aggregate ID: {0}")]
pub struct ParseAggregateIdError(String);

/// Unique identifier for an aggregate instance (its event stream).
///
/// Every event in the store belongs to exactly one aggregate, and the
/// aggregate's events form a gap-free sequence starting at 1.
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty or blank strings)
/// - `From::from()` and `new()`: No validation (for application-controlled ids)
///
/// # Examples
///
/// ```
/// use medtour_core::stream::AggregateId;
///
/// let id = AggregateId::new("reservation-12345");
/// assert_eq!(id.as_str(), "reservation-12345");
///
/// let parsed: AggregateId = "reservation-abc".parse().unwrap();
/// assert_eq!(parsed, AggregateId::new("reservation-abc"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateId(String);

impl AggregateId {
    /// Create a new `AggregateId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the aggregate ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `AggregateId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AggregateId {
    type Err = ParseAggregateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseAggregateIdError(
                "Aggregate ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for AggregateId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-aggregate version number used for optimistic concurrency control.
///
/// An aggregate with no events is at version 0 (`Version::INITIAL`). Each
/// appended event takes the next sequence number, so an aggregate's version
/// always equals the sequence number of its last event.
///
/// - Appends carry the version the caller observed when it loaded the aggregate
/// - If the stored version differs, the append fails and nothing is written
///
/// # Examples
///
/// ```
/// use medtour_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert!(v0.is_initial());
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of an aggregate that has no events yet.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns `true` if this is the version of an aggregate with no events.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<u64> for Version {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0.saturating_sub(rhs))
    }
}

/// Position of an event in the global commit order of the store.
///
/// Positions are assigned at append time and increase with commit order
/// across all aggregates. `GlobalPosition::START` precedes every event, so
/// reading "after" it yields the whole log.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    /// The position before the first event.
    pub const START: Self = Self(0);

    /// Create a new `GlobalPosition`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw position.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GlobalPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod aggregate_id_tests {
        use super::*;

        #[test]
        fn new_and_accessors() {
            let id = AggregateId::new("reservation-1");
            assert_eq!(id.as_str(), "reservation-1");
            assert_eq!(id.to_string(), "reservation-1");
            assert_eq!(id.clone().into_inner(), "reservation-1");
            assert_eq!(AggregateId::from("reservation-1"), id);
        }

        #[test]
        fn parse_rejects_blank() {
            assert!("".parse::<AggregateId>().is_err());
            assert!("   ".parse::<AggregateId>().is_err());
            assert!("r-1".parse::<AggregateId>().is_ok());
        }
    }

    mod version_tests {
        use super::*;

        #[test]
        fn initial_and_next() {
            assert!(Version::INITIAL.is_initial());
            assert_eq!(Version::INITIAL.next(), Version::new(1));
            assert!(!Version::new(1).is_initial());
        }

        #[test]
        fn arithmetic() {
            assert_eq!(Version::new(3) + 2, Version::new(5));
            assert_eq!(Version::new(3) - 5, Version::INITIAL);
            assert_eq!(u64::from(Version::new(7)), 7);
        }

        #[test]
        fn ordering() {
            assert!(Version::new(1) < Version::new(2));
            assert!(GlobalPosition::START < GlobalPosition::new(1));
        }
    }
}
