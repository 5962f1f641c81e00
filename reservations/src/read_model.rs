//! The reservation read model.
//!
//! One row per reservation with secondary indexes by user, hospital and
//! status. The projection engine feeds it committed events once each, in
//! sequence order per reservation; everything here is a plain fold.

use crate::aggregate::ReservationEvent;
use crate::types::{HospitalId, ReservationNumber, ReservationStatus, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use medtour_core::event::DomainEvent;
use medtour_core::projection::{ApplyOutcome, ProjectionError, ReadModel, Result};
use medtour_core::stream::{AggregateId, Version};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Default page size of [`ReservationReadModel::search`].
pub const DEFAULT_LIMIT: usize = 50;

/// Largest accepted page size.
pub const MAX_LIMIT: usize = 500;

/// Denormalized view of one reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    /// Aggregate id.
    pub reservation_id: AggregateId,
    /// Human-facing number.
    pub reservation_number: ReservationNumber,
    /// Patient.
    pub user_id: UserId,
    /// Hospital.
    pub hospital_id: HospitalId,
    /// Upper-cased procedure code.
    pub procedure_type: String,
    /// Day of the procedure.
    pub reservation_date: NaiveDate,
    /// Current status.
    pub status: ReservationStatus,
    /// When the reservation was created.
    pub created_at: DateTime<Utc>,
    /// When it was confirmed.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Who confirmed it.
    pub confirmed_by: Option<String>,
    /// When it was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Why it was cancelled.
    pub cancellation_reason: Option<String>,
    /// Sequence number of the last event folded into this row.
    pub version: Version,
}

/// Criteria for [`ReservationReadModel::search`]. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    /// Only this patient's reservations.
    pub user_id: Option<UserId>,
    /// Only this hospital's reservations.
    pub hospital_id: Option<HospitalId>,
    /// Only reservations in this status.
    pub status: Option<ReservationStatus>,
    /// Inclusive lower bound on the reservation date.
    pub date_from: Option<NaiveDate>,
    /// Inclusive upper bound on the reservation date.
    pub date_to: Option<NaiveDate>,
    /// Page size, [`DEFAULT_LIMIT`] when unset, capped at [`MAX_LIMIT`].
    pub limit: Option<usize>,
    /// Rows to skip.
    pub offset: usize,
}

/// All reservations, indexed for the query API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReservationReadModel {
    rows: HashMap<AggregateId, ReservationView>,
    by_user: HashMap<UserId, BTreeSet<AggregateId>>,
    by_hospital: HashMap<HospitalId, BTreeSet<AggregateId>>,
    by_status: HashMap<ReservationStatus, BTreeSet<AggregateId>>,
}

impl ReadModel for ReservationReadModel {
    const NAME: &'static str = "reservations";

    fn apply(&mut self, event: &DomainEvent) -> Result<ApplyOutcome> {
        if !ReservationEvent::is_reservation_event(&event.event_type) {
            return Ok(ApplyOutcome::Ignored);
        }

        let decoded: ReservationEvent = event
            .decode()
            .map_err(|e| ProjectionError::Serialization(e.to_string()))?;

        match decoded {
            ReservationEvent::Created { number, details } => {
                if self.rows.contains_key(&event.aggregate_id) {
                    return Ok(ApplyOutcome::Anomaly(format!(
                        "reservation {} created twice (sequence {})",
                        event.aggregate_id, event.sequence_number
                    )));
                }
                let row = ReservationView {
                    reservation_id: event.aggregate_id.clone(),
                    reservation_number: number,
                    user_id: details.user_id,
                    hospital_id: details.hospital_id,
                    procedure_type: details.procedure_type.as_str().to_string(),
                    reservation_date: details.reservation_date,
                    status: ReservationStatus::Pending,
                    created_at: event.occurred_at,
                    confirmed_at: None,
                    confirmed_by: None,
                    cancelled_at: None,
                    cancellation_reason: None,
                    version: event.sequence_number,
                };
                self.index(&row);
                self.rows.insert(event.aggregate_id.clone(), row);
                Ok(ApplyOutcome::Applied)
            }
            ReservationEvent::Confirmed { confirmed_by } => Ok(self.transition(event, |row| {
                row.status = ReservationStatus::Confirmed;
                row.confirmed_at = Some(event.occurred_at);
                row.confirmed_by = Some(confirmed_by);
            })),
            ReservationEvent::Cancelled { reason } => Ok(self.transition(event, |row| {
                row.status = ReservationStatus::Cancelled;
                row.cancelled_at = Some(event.occurred_at);
                row.cancellation_reason = Some(reason);
            })),
        }
    }
}

fn remove_from<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<AggregateId>>,
    key: &K,
    id: &AggregateId,
) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl ReservationReadModel {
    fn transition(
        &mut self,
        event: &DomainEvent,
        change: impl FnOnce(&mut ReservationView),
    ) -> ApplyOutcome {
        let id = &event.aggregate_id;
        let Some(row) = self.rows.get_mut(id) else {
            return ApplyOutcome::Anomaly(format!("{} for unknown reservation {id}", event.event_type));
        };
        if row.version >= event.sequence_number {
            return ApplyOutcome::Anomaly(format!(
                "{} at sequence {} but row is at {}",
                event.event_type, event.sequence_number, row.version
            ));
        }

        let previous = row.status;
        change(row);
        row.version = event.sequence_number;
        let current = row.status;

        if previous != current {
            remove_from(&mut self.by_status, &previous, id);
            self.by_status.entry(current).or_default().insert(id.clone());
        }
        ApplyOutcome::Applied
    }

    fn index(&mut self, row: &ReservationView) {
        let id = &row.reservation_id;
        self.by_user
            .entry(row.user_id.clone())
            .or_default()
            .insert(id.clone());
        self.by_hospital
            .entry(row.hospital_id.clone())
            .or_default()
            .insert(id.clone());
        self.by_status
            .entry(row.status)
            .or_default()
            .insert(id.clone());
    }

    /// Number of reservations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no reservations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One reservation.
    #[must_use]
    pub fn get(&self, id: &AggregateId) -> Option<&ReservationView> {
        self.rows.get(id)
    }

    /// Reservations matching `filter`, oldest first.
    ///
    /// Ties on `created_at` are broken by reservation id so pages are stable.
    #[must_use]
    pub fn search(&self, filter: &ReservationFilter) -> Vec<ReservationView> {
        let candidates: Box<dyn Iterator<Item = &ReservationView>> =
            match (&filter.user_id, &filter.hospital_id, filter.status) {
                (Some(user), _, _) => Box::new(self.lookup(self.by_user.get(user))),
                (None, Some(hospital), _) => Box::new(self.lookup(self.by_hospital.get(hospital))),
                (None, None, Some(status)) => Box::new(self.lookup(self.by_status.get(&status))),
                (None, None, None) => Box::new(self.rows.values()),
            };

        let mut matches: Vec<&ReservationView> = candidates
            .filter(|row| filter.user_id.as_ref().is_none_or(|u| &row.user_id == u))
            .filter(|row| filter.hospital_id.as_ref().is_none_or(|h| &row.hospital_id == h))
            .filter(|row| filter.status.is_none_or(|s| row.status == s))
            .filter(|row| filter.date_from.is_none_or(|d| row.reservation_date >= d))
            .filter(|row| filter.date_to.is_none_or(|d| row.reservation_date <= d))
            .collect();

        matches.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.reservation_id.cmp(&b.reservation_id))
        });

        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        matches
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Count of reservations per status.
    #[must_use]
    pub fn status_counts(&self) -> HashMap<ReservationStatus, usize> {
        self.by_status
            .iter()
            .map(|(status, ids)| (*status, ids.len()))
            .collect()
    }

    fn lookup<'a>(
        &'a self,
        ids: Option<&'a BTreeSet<AggregateId>>,
    ) -> impl Iterator<Item = &'a ReservationView> + 'a {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.rows.get(id))
    }
}
