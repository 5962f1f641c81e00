//! HTTP API.
//!
//! - `reservations`: commands and queries on reservations
//! - `events`: the ordered event feed
//! - `admin`: rebuild, quarantine and read-model statistics
//!
//! Query routes read the projection and are marked eventually consistent.

pub mod admin;
pub mod events;
pub mod reservations;

use crate::app::AppState;
use crate::service::ServiceError;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use medtour_web::{AppError, eventually_consistent, health_check, health_ready, observed};

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::Validation(e) => Self::validation(e.to_string()),
            ServiceError::InvalidTransition { .. } => Self::invalid_transition(err.to_string()),
            ServiceError::Conflict(message) => Self::conflict(message.clone()),
            ServiceError::Storage(message) => {
                Self::unavailable("the event store is unavailable").with_source(anyhow::anyhow!(message.clone()))
            }
        }
    }
}

/// Build the complete router.
pub fn router(state: AppState) -> Router {
    let commands = Router::new()
        .route("/reservations", post(reservations::create))
        .route("/reservations/:id/confirm", post(reservations::confirm))
        .route("/reservations/:id/cancel", post(reservations::cancel));

    let queries = eventually_consistent(
        Router::new()
            .route("/reservations", get(reservations::search))
            .route("/reservations/:id", get(reservations::by_id)),
    );

    let operations = Router::new()
        .route("/events", get(events::feed))
        .route("/admin/read-model/rebuild", post(admin::rebuild))
        .route("/admin/read-model/stats", get(admin::stats))
        .route("/admin/quarantine", get(admin::quarantine))
        .route("/admin/quarantine/:aggregate_id/release", post(admin::release))
        .route("/health", get(health_check))
        .route("/health/ready", get(health_ready::<AppState>))
        .route("/metrics", get(metrics));

    observed(
        Router::new()
            .merge(commands)
            .merge(queries)
            .merge(operations)
            .with_state(state),
    )
}

/// Prometheus text exposition, 404 when no recorder is installed.
#[allow(clippy::unused_async)]
async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics are disabled").into_response(),
    }
}
