//! MedTour reservation HTTP server.

use medtour_core::environment::SystemClock;
use medtour_reservations::api;
use medtour_reservations::app::{AppState, open_event_store};
use medtour_reservations::config::Config;
use medtour_reservations::notifier::LoggingNotificationGateway;
use medtour_runtime::metrics::PrometheusMetrics;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "medtour_reservations=info,medtour_runtime=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MedTour reservation server");

    let config = Config::from_env()?;
    info!(
        bind = %config.bind_address(),
        postgres = config.database.url.is_some(),
        lanes = config.delivery.lanes,
        "Configuration loaded"
    );

    let event_store = open_event_store(&config.database).await?;

    let mut state = AppState::assemble(
        &config,
        event_store,
        Arc::new(SystemClock),
        LoggingNotificationGateway,
    );
    if config.server.metrics_enabled {
        match PrometheusMetrics::install() {
            Ok(metrics) => state = state.with_metrics(metrics),
            Err(e) => warn!(error = %e, "Metrics disabled"),
        }
    }

    state.start(&config).await?;

    let app = api::router(state.clone());
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining event delivery");
    state.shutdown(config.shutdown_timeout()).await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
