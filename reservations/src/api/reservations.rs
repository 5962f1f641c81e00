//! Reservation endpoints.
//!
//! - `POST /reservations`: create (201)
//! - `POST /reservations/:id/confirm`: confirm a pending reservation
//! - `POST /reservations/:id/cancel`: cancel a pending or confirmed reservation
//! - `GET /reservations/:id`: one reservation from the read model
//! - `GET /reservations?user_id=&hospital_id=&status=&date_from=&date_to=&limit=&offset=`: search
//!
//! Commands answer from the write side with the committed version. Queries
//! answer from the read model and may trail recent commands.

use crate::app::AppState;
use crate::read_model::{ReservationFilter, ReservationView};
use crate::service::{CommandReceipt, CreateReservation};
use crate::types::{HospitalId, ReservationStatus, UserId, ValidationError};
use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::NaiveDate;
use medtour_core::stream::AggregateId;
use medtour_web::{AppError, WebResult};
use serde::{Deserialize, Serialize};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to create a reservation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationRequest {
    /// Patient id
    pub user_id: String,
    /// Hospital id
    pub hospital_id: String,
    /// Procedure code, e.g. "MRI"
    pub procedure_type: String,
    /// Day of the procedure, `YYYY-MM-DD`
    pub reservation_date: String,
}

/// Request to confirm a reservation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmReservationRequest {
    /// Who confirms (agent or hospital staff id)
    pub confirmed_by: String,
}

/// Request to cancel a reservation.
#[derive(Debug, Deserialize)]
pub struct CancelReservationRequest {
    /// Why the reservation is cancelled
    pub reason: String,
}

/// Search parameters.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    /// Filter by patient
    pub user_id: Option<String>,
    /// Filter by hospital
    pub hospital_id: Option<String>,
    /// Filter by status (case-insensitive)
    pub status: Option<String>,
    /// Earliest reservation date, inclusive
    pub date_from: Option<NaiveDate>,
    /// Latest reservation date, inclusive
    pub date_to: Option<NaiveDate>,
    /// Page size
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: Option<usize>,
}

/// Search results.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    /// Matching reservations, oldest first
    pub reservations: Vec<ReservationView>,
    /// Number of reservations in this page
    pub count: usize,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> WebResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a reservation.
///
/// ```bash
/// curl -X POST http://localhost:8080/reservations \
///   -H "Content-Type: application/json" \
///   -d '{"userId":"u-1","hospitalId":"h-1","procedureType":"MRI","reservationDate":"2025-03-01"}'
/// ```
///
/// ```json
/// {"reservationId":"7d6c…","reservationNumber":"RSV-202501-00001","version":1,"status":"PENDING"}
/// ```
///
/// # Errors
///
/// - 422 `VALIDATION_ERROR` for malformed or past-dated requests
/// - 409 `CONFLICT` if number allocation kept conflicting
/// - 503 if the event store is unavailable
pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<CreateReservationRequest>, JsonRejection>,
) -> WebResult<(StatusCode, Json<CommandReceipt>)> {
    let request = body(payload)?;
    let reservation_date = request
        .reservation_date
        .trim()
        .parse::<NaiveDate>()
        .map_err(|e| ValidationError::Invalid {
            field: "reservationDate",
            reason: e.to_string(),
        })
        .map_err(|e| AppError::validation(e.to_string()))?;

    let receipt = state
        .service
        .create(CreateReservation {
            user_id: request.user_id,
            hospital_id: request.hospital_id,
            procedure_type: request.procedure_type,
            reservation_date,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Confirm a pending reservation.
///
/// # Errors
///
/// - 409 `INVALID_STATE_TRANSITION` unless the reservation is pending
///   (including when it does not exist)
/// - 409 `CONFLICT` if concurrent writers kept winning
/// - 422 `VALIDATION_ERROR` for a blank `confirmedBy`
pub async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ConfirmReservationRequest>, JsonRejection>,
) -> WebResult<Json<CommandReceipt>> {
    let request = body(payload)?;
    Ok(Json(state.service.confirm(&id, &request.confirmed_by).await?))
}

/// Cancel a pending or confirmed reservation.
///
/// # Errors
///
/// - 409 `INVALID_STATE_TRANSITION` if already cancelled or unknown
/// - 422 `VALIDATION_ERROR` for a blank or oversized reason
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CancelReservationRequest>, JsonRejection>,
) -> WebResult<Json<CommandReceipt>> {
    let request = body(payload)?;
    Ok(Json(state.service.cancel(&id, &request.reason).await?))
}

/// One reservation from the read model.
///
/// # Errors
///
/// 404 if the read model has no such reservation (yet).
#[allow(clippy::unused_async)]
pub async fn by_id(State(state): State<AppState>, Path(id): Path<String>) -> WebResult<Json<ReservationView>> {
    state
        .queries
        .by_id(&AggregateId::new(id.as_str()))
        .map(Json)
        .ok_or_else(|| AppError::not_found("Reservation", &id))
}

/// Search reservations.
///
/// # Errors
///
/// 422 for an unknown status or a blank id filter.
#[allow(clippy::unused_async)]
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> WebResult<Json<SearchResponse>> {
    let filter = filter(params).map_err(|e| AppError::validation(e.to_string()))?;
    let reservations = state.queries.search(&filter);
    Ok(Json(SearchResponse {
        count: reservations.len(),
        reservations,
    }))
}

fn filter(params: SearchParams) -> Result<ReservationFilter, ValidationError> {
    Ok(ReservationFilter {
        user_id: params.user_id.as_deref().map(UserId::parse).transpose()?,
        hospital_id: params.hospital_id.as_deref().map(HospitalId::parse).transpose()?,
        status: params
            .status
            .as_deref()
            .map(str::parse::<ReservationStatus>)
            .transpose()?,
        date_from: params.date_from,
        date_to: params.date_to,
        limit: params.limit,
        offset: params.offset.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn search_params_become_a_filter() {
        let filter = filter(SearchParams {
            user_id: Some(" u-1 ".to_string()),
            status: Some("confirmed".to_string()),
            limit: Some(10),
            ..SearchParams::default()
        })
        .unwrap();

        assert_eq!(filter.user_id.unwrap().as_str(), "u-1");
        assert_eq!(filter.status, Some(ReservationStatus::Confirmed));
        assert_eq!(filter.limit, Some(10));
        assert_eq!(filter.offset, 0);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let result = filter(SearchParams {
            status: Some("SHIPPED".to_string()),
            ..SearchParams::default()
        });
        assert!(result.is_err());
    }
}
