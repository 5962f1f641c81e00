//! Application wiring.
//!
//! Every long-lived component is constructed once here and passed around
//! explicitly:
//!
//! ```text
//! EventStore ◄── CommandDispatcher ──publish──► EventPublisher ──► ProjectionEngine
//!     ▲                                              │           └► ConfirmationNotifier
//!     └── ReservationNumberAllocator                 └── gap repair reads the store
//! ```

use crate::config::{Config, DatabaseConfig};
use crate::notifier::{ConfirmationNotifier, NotificationGateway};
use crate::numbering::ReservationNumberAllocator;
use crate::queries::ReservationQueries;
use crate::read_model::ReservationReadModel;
use crate::service::ReservationService;
use anyhow::Context;
use medtour_core::environment::Clock;
use medtour_core::event_bus::EventBus;
use medtour_core::event_store::EventStore;
use medtour_core::stream::GlobalPosition;
use medtour_postgres::PostgresEventStore;
use medtour_projections::ProjectionEngine;
use medtour_runtime::metrics::PrometheusMetrics;
use medtour_runtime::{
    CommandDispatcher, DeadLetterQueue, EventPublisher, HealthCheck, HealthReport, RetryPolicy,
};
use medtour_testing::InMemoryEventStore;
use medtour_web::ReadinessProbe;
use std::sync::Arc;
use std::time::Duration;

/// Shared handles for request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Command side.
    pub service: ReservationService,
    /// Query side.
    pub queries: ReservationQueries,
    /// Engine maintaining the read model.
    pub projection: Arc<ProjectionEngine<ReservationReadModel>>,
    /// Delivery pipeline.
    pub publisher: Arc<EventPublisher>,
    /// The event log.
    pub event_store: Arc<dyn EventStore>,
    /// Prometheus recorder, when installed.
    pub metrics: Option<PrometheusMetrics>,
}

impl AppState {
    /// Wire all components on top of `event_store`.
    ///
    /// Spawns the publisher's delivery lanes, so it must run inside a Tokio
    /// runtime. Nothing is replayed yet; see [`AppState::start`].
    #[must_use]
    pub fn assemble<G>(
        config: &Config,
        event_store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        gateway: G,
    ) -> Self
    where
        G: NotificationGateway + 'static,
    {
        let projection = Arc::new(
            ProjectionEngine::<ReservationReadModel>::new(Arc::clone(&event_store))
                .with_batch_size(config.projection.rebuild_batch_size),
        );
        let notifier = Arc::new(ConfirmationNotifier::new(gateway, clock.now()));

        let delivery = &config.delivery;
        let publisher = Arc::new(
            EventPublisher::builder(Arc::clone(&event_store))
                .subscribe(projection.clone())
                .subscribe(notifier)
                .lanes(delivery.lanes)
                .retry_policy(
                    RetryPolicy::builder()
                        .max_retries(delivery.max_retries)
                        .initial_delay(Duration::from_millis(delivery.initial_delay_ms))
                        .max_delay(Duration::from_millis(delivery.max_delay_ms))
                        .jitter(true)
                        .build(),
                )
                .dead_letter_queue(DeadLetterQueue::new(delivery.quarantine_capacity))
                .build(),
        );

        let bus: Arc<dyn EventBus> = publisher.clone();
        let dispatcher = CommandDispatcher::new(Arc::clone(&event_store), bus, Arc::clone(&clock))
            .with_conflict_policy(
                RetryPolicy::builder()
                    .max_retries(config.commands.max_conflict_retries)
                    .initial_delay(Duration::from_millis(5))
                    .max_delay(Duration::from_millis(200))
                    .jitter(true)
                    .build(),
            );
        let numbers = Arc::new(ReservationNumberAllocator::new(
            Arc::clone(&event_store),
            Arc::clone(&clock),
        ));

        Self {
            service: ReservationService::new(dispatcher, numbers, clock),
            queries: ReservationQueries::new(projection.clone()),
            projection,
            publisher,
            event_store,
            metrics: None,
        }
    }

    /// Attach an installed Prometheus recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: PrometheusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the read model from the log and optionally catch subscribers up.
    ///
    /// # Errors
    ///
    /// Fails if the initial rebuild or the catch-up cannot read the log.
    pub async fn start(&self, config: &Config) -> anyhow::Result<()> {
        let report = self
            .projection
            .rebuild()
            .await
            .context("initial read model rebuild failed")?;
        tracing::info!(
            events = report.events_replayed,
            aggregates = report.aggregates,
            "Read model ready"
        );

        if config.delivery.catch_up_on_start {
            let enqueued = self
                .publisher
                .catch_up()
                .await
                .context("publisher catch-up failed")?;
            tracing::info!(events = enqueued, "Subscribers catching up");
        }
        Ok(())
    }

    /// Stop delivery, waiting up to `timeout` for the lanes to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        self.publisher.shutdown(timeout).await;
    }

    async fn event_store_health(&self) -> HealthCheck {
        match self.event_store.read_all(GlobalPosition::START, 1).await {
            Ok(_) => HealthCheck::healthy("event_store"),
            Err(err) => HealthCheck::unhealthy("event_store", err.to_string()),
        }
    }

    fn projection_health(&self) -> HealthCheck {
        let stats = self.projection.stats();
        let check = if stats.anomalies > 0 {
            HealthCheck::degraded(
                "read_model",
                format!("{} anomalies recorded", stats.anomalies),
            )
        } else {
            HealthCheck::healthy("read_model")
        };
        check
            .with_metadata("aggregates", stats.aggregates)
            .with_metadata("anomalies", stats.anomalies)
    }
}

impl ReadinessProbe for AppState {
    async fn readiness(&self) -> HealthReport {
        HealthReport::new(vec![
            self.event_store_health().await,
            self.publisher.health(),
            self.projection_health(),
        ])
    }
}

/// Open the configured event store: Postgres when a URL is set, else in memory.
///
/// # Errors
///
/// Fails if Postgres is unreachable or its migrations do not apply.
pub async fn open_event_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn EventStore>> {
    let Some(url) = &config.url else {
        tracing::warn!("DATABASE_URL not set, events are kept in memory only");
        return Ok(Arc::new(InMemoryEventStore::new()));
    };

    let store = PostgresEventStore::from_url(url, config.max_connections)
        .await
        .context("connecting to the event store")?;
    store
        .migrate()
        .await
        .context("running event store migrations")?;
    tracing::info!(max_connections = config.max_connections, "Postgres event store ready");
    Ok(Arc::new(store))
}
