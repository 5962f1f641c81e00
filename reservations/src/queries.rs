//! Read-only queries over the reservation read model.
//!
//! Every answer reflects the events the projection engine has applied so
//! far, which may trail the write side by a few events.

use crate::read_model::{ReservationFilter, ReservationReadModel, ReservationView};
use crate::types::{HospitalId, ReservationStatus, UserId};
use medtour_core::stream::AggregateId;
use medtour_projections::ProjectionEngine;
use std::sync::Arc;

/// Query facade handed to the HTTP layer.
#[derive(Clone)]
pub struct ReservationQueries {
    engine: Arc<ProjectionEngine<ReservationReadModel>>,
}

impl ReservationQueries {
    /// Wrap the engine that maintains the read model.
    #[must_use]
    pub const fn new(engine: Arc<ProjectionEngine<ReservationReadModel>>) -> Self {
        Self { engine }
    }

    /// One reservation, `None` if the read model has not seen it.
    #[must_use]
    pub fn by_id(&self, id: &AggregateId) -> Option<ReservationView> {
        self.engine.read(|model| model.get(id).cloned())
    }

    /// First page of a patient's reservations.
    #[must_use]
    pub fn by_user(&self, user_id: &UserId) -> Vec<ReservationView> {
        self.search(&ReservationFilter {
            user_id: Some(user_id.clone()),
            ..ReservationFilter::default()
        })
    }

    /// First page of a hospital's reservations.
    #[must_use]
    pub fn by_hospital(&self, hospital_id: &HospitalId) -> Vec<ReservationView> {
        self.search(&ReservationFilter {
            hospital_id: Some(hospital_id.clone()),
            ..ReservationFilter::default()
        })
    }

    /// First page of reservations in `status`.
    #[must_use]
    pub fn by_status(&self, status: ReservationStatus) -> Vec<ReservationView> {
        self.search(&ReservationFilter {
            status: Some(status),
            ..ReservationFilter::default()
        })
    }

    /// Reservations matching every set criterion of `filter`.
    #[must_use]
    pub fn search(&self, filter: &ReservationFilter) -> Vec<ReservationView> {
        self.engine.read(|model| model.search(filter))
    }
}
