//! Health check endpoints.
//!
//! Used by load balancers and monitoring systems to verify service health.

use axum::{Json, extract::State, http::StatusCode};
use medtour_runtime::HealthReport;
use std::future::Future;

/// Liveness endpoint.
///
/// Returns 200 OK while the process is serving requests. Dependencies are
/// not checked.
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Application state that can report its readiness.
pub trait ReadinessProbe: Clone + Send + Sync + 'static {
    /// Probe every component and summarize.
    fn readiness(&self) -> impl Future<Output = HealthReport> + Send;
}

/// Readiness endpoint.
///
/// # Status Codes
///
/// - 200 OK: Healthy or Degraded
/// - 503 Service Unavailable: Unhealthy
///
/// ```text
/// GET /health/ready
/// ```
///
/// ```json
/// {
///   "status": "degraded",
///   "checks": [{ "component": "publisher", "status": "degraded", "message": "2 events quarantined" }],
///   "timestamp": "2025-01-01T00:00:00Z"
/// }
/// ```
pub async fn health_ready<S: ReadinessProbe>(
    State(state): State<S>,
) -> (StatusCode, Json<HealthReport>) {
    let report = state.readiness().await;

    let status = if report.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(report))
}
