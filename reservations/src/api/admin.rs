//! Operator endpoints.
//!
//! - `POST /admin/read-model/rebuild`: rebuild the read model from the log
//! - `GET /admin/read-model/stats`: projection statistics and anomalies
//! - `GET /admin/quarantine`: events a subscriber gave up on
//! - `POST /admin/quarantine/:aggregate_id/release`: unpark an aggregate and redeliver it

use crate::app::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use medtour_core::projection::ProjectionError;
use medtour_core::stream::AggregateId;
use medtour_projections::{Anomaly, ProjectionStats, RebuildReport};
use medtour_runtime::QuarantinedEvent;
use medtour_web::{AppError, WebResult};
use serde::Serialize;

/// Read model statistics.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Engine counters and the last rebuild
    #[serde(flatten)]
    pub stats: ProjectionStats,
    /// Recorded anomalies, oldest first
    pub anomaly_log: Vec<Anomaly>,
}

/// Result of a release.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    /// The released aggregate
    pub aggregate_id: AggregateId,
    /// Quarantined entries that were pending for it
    pub pending: usize,
}

/// Rebuild the read model. Safe to repeat.
///
/// # Errors
///
/// 503 if the log could not be read, 500 if an event could not be applied.
/// The previous read model keeps serving in both cases.
pub async fn rebuild(State(state): State<AppState>) -> WebResult<Json<RebuildReport>> {
    let report = state.projection.rebuild().await.map_err(|e| match e {
        ProjectionError::Storage(_) => {
            AppError::unavailable("event log unavailable, previous view still serving").with_source(e.into())
        }
        other => AppError::from(anyhow::Error::from(other)),
    })?;
    Ok(Json(report))
}

/// Projection statistics.
#[allow(clippy::unused_async)]
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.projection.stats(),
        anomaly_log: state.projection.anomalies(),
    })
}

/// Quarantined events, oldest first.
#[allow(clippy::unused_async)]
pub async fn quarantine(State(state): State<AppState>) -> Json<Vec<QuarantinedEvent>> {
    Json(state.publisher.dead_letters().list())
}

/// Unpark an aggregate and redeliver its history to every subscriber.
///
/// # Errors
///
/// 503 if the publisher is shut down.
#[allow(clippy::unused_async)]
pub async fn release(
    State(state): State<AppState>,
    Path(aggregate_id): Path<String>,
) -> WebResult<Json<ReleaseResponse>> {
    let aggregate_id = AggregateId::new(aggregate_id);
    let pending = state
        .publisher
        .release(&aggregate_id)
        .map_err(|e| AppError::unavailable("event delivery is stopped").with_source(e.into()))?;
    Ok(Json(ReleaseResponse {
        aggregate_id,
        pending,
    }))
}
