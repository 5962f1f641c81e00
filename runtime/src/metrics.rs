//! Prometheus metrics for observability and monitoring.
//!
//! Metrics are recorded through the `metrics` facade everywhere in the
//! workspace; this module installs the Prometheus recorder, describes the
//! metric families and offers small typed recorders for the hot paths:
//! - Event store appends and loads
//! - Command handling outcomes and conflict retries
//! - Publisher deliveries, retries and quarantines
//!
//! # Example
//!
//! ```rust,no_run
//! use medtour_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::install()?;
//!
//! // Serve `metrics.render()` from a `/metrics` endpoint.
//! let text = metrics.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors that can occur when installing the metrics recorder.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to configure the Prometheus exporter.
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the global recorder.
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Handle to the installed Prometheus recorder.
#[derive(Clone)]
pub struct PrometheusMetrics {
    handle: PrometheusHandle,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Install the Prometheus recorder as the global `metrics` recorder.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError` if the exporter cannot be configured or a
    /// recorder is already installed.
    pub fn install() -> Result<Self, MetricsError> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        tracing::info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    /// Render all metrics in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn register_metrics() {
    // Event store
    describe_counter!(
        "event_store_events_appended_total",
        "Total number of events appended to the event store"
    );
    describe_counter!(
        "event_store_events_loaded_total",
        "Total number of events loaded from the event store"
    );
    describe_counter!(
        "event_store_conflicts_total",
        "Appends rejected by the optimistic concurrency check"
    );
    describe_histogram!(
        "event_store_append_duration_seconds",
        "Time taken to append events"
    );

    // Commands
    describe_counter!(
        "commands_handled_total",
        "Commands handled, labelled by aggregate, command and outcome"
    );
    describe_counter!(
        "command_conflict_retries_total",
        "Command attempts retried after a concurrency conflict"
    );
    describe_histogram!(
        "command_duration_seconds",
        "Time taken to handle a command including retries"
    );

    // Publisher
    describe_counter!(
        "publisher_events_delivered_total",
        "Events successfully delivered, labelled by subscriber"
    );
    describe_counter!(
        "publisher_delivery_failures_total",
        "Failed delivery attempts, labelled by subscriber"
    );
    describe_counter!(
        "publisher_events_quarantined_total",
        "Events moved to quarantine, labelled by subscriber"
    );
    describe_counter!(
        "publisher_gaps_repaired_total",
        "Events loaded from the store to fill a delivery gap"
    );
    describe_gauge!("quarantine_size", "Events currently held in quarantine");

    // Projections
    describe_counter!(
        "projection_events_total",
        "Events seen by the projection engine, labelled by read model and outcome"
    );
    describe_counter!(
        "projection_rebuilds_total",
        "Read model rebuilds, labelled by read model and result"
    );
    describe_histogram!(
        "projection_rebuild_duration_seconds",
        "Time taken to rebuild a read model"
    );
}

#[allow(clippy::cast_possible_truncation)]
const fn as_count(count: usize) -> u64 {
    count as u64
}

/// Event store metrics recorder.
pub struct EventStoreMetrics;

impl EventStoreMetrics {
    /// Record a successful append.
    pub fn record_append(count: usize, duration: Duration) {
        counter!("event_store_events_appended_total").increment(as_count(count));
        histogram!("event_store_append_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an aggregate load.
    pub fn record_load(count: usize) {
        counter!("event_store_events_loaded_total").increment(as_count(count));
    }

    /// Record an append rejected by the version check.
    pub fn record_conflict() {
        counter!("event_store_conflicts_total").increment(1);
    }
}

/// Command handling metrics recorder.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Record the final outcome of a command.
    pub fn record_outcome(
        aggregate: &'static str,
        command: &'static str,
        outcome: &'static str,
        duration: Duration,
    ) {
        counter!(
            "commands_handled_total",
            "aggregate" => aggregate,
            "command" => command,
            "outcome" => outcome
        )
        .increment(1);
        histogram!("command_duration_seconds", "aggregate" => aggregate)
            .record(duration.as_secs_f64());
    }

    /// Record a retry after a conflict.
    pub fn record_conflict_retry(aggregate: &'static str) {
        counter!("command_conflict_retries_total", "aggregate" => aggregate).increment(1);
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a successful delivery.
    pub fn record_delivered(subscriber: &str) {
        counter!("publisher_events_delivered_total", "subscriber" => subscriber.to_string())
            .increment(1);
    }

    /// Record a failed delivery attempt.
    pub fn record_failure(subscriber: &str) {
        counter!("publisher_delivery_failures_total", "subscriber" => subscriber.to_string())
            .increment(1);
    }

    /// Record a quarantined event.
    pub fn record_quarantined(subscriber: &str) {
        counter!("publisher_events_quarantined_total", "subscriber" => subscriber.to_string())
            .increment(1);
    }

    /// Record events loaded to repair a gap.
    pub fn record_gap_repaired(count: usize) {
        counter!("publisher_gaps_repaired_total").increment(as_count(count));
    }

    /// Record the current quarantine size.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_quarantine_size(size: usize) {
        gauge!("quarantine_size").set(size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_are_noops_without_recorder() {
        EventStoreMetrics::record_append(2, Duration::from_millis(3));
        EventStoreMetrics::record_conflict();
        CommandMetrics::record_outcome("reservation", "confirm", "ok", Duration::ZERO);
        PublisherMetrics::record_delivered("read-model");
        PublisherMetrics::record_quarantine_size(0);
    }
}
