use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use telemetry_gateway::adapters::{sqlite, FirestoreClient, MqttAdapter, SqliteRepository};
use telemetry_gateway::config::AppConfig;
use telemetry_gateway::service::listener::run_ingest_loop;
use telemetry_gateway::service::{AlertEngine, IngestService, SyncDispatcher};
use telemetry_gateway::telemetry::{init_telemetry, shutdown_telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 0. Configuration (loads .env first)
    let config = AppConfig::load().context("failed to load configuration")?;

    // 1. Logging / tracing
    init_telemetry("telemetry-gateway", config.otlp_endpoint.as_deref())?;
    info!("Starting edge telemetry gateway...");

    // 1b. Metrics
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .idle_timeout(metrics_util::MetricKindMask::ALL, Some(Duration::from_secs(60)))
        .install()
        .context("failed to install Prometheus recorder")?;
    info!("Prometheus metrics listening on 0.0.0.0:{}", config.metrics_port);

    // 2. Local store
    let pool = sqlite::connect(&config.database_url, 4).await?;
    let repo = Arc::new(SqliteRepository::new(pool));
    info!(database = %config.database_url, "local store ready");

    // 3. Remote store client, built once and handed to the dispatcher
    let remote = Arc::new(FirestoreClient::new(&config.remote()).context("remote store client")?);

    // 4. MQTT
    let (mqtt_client, eventloop) = MqttAdapter::build(&config);

    let ingest = Arc::new(IngestService::new(
        repo.clone(),
        repo.clone(),
        AlertEngine::new(repo.clone()),
        config.telemetry_topic.clone(),
        config.source_tag.clone(),
    ));
    let dispatcher = SyncDispatcher::new(repo.clone(), remote, config.dispatcher());

    // 5. Background loops
    let cancel = CancellationToken::new();

    let ingest_handle = tokio::spawn({
        let cancel = cancel.clone();
        let topic = config.telemetry_topic.clone();
        async move {
            if let Err(e) = run_ingest_loop(eventloop, mqtt_client, ingest, topic, cancel).await {
                error!("ingest loop error: {:?}", e);
            }
        }
    });

    let dispatcher_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { dispatcher.run(cancel).await }
    });

    info!("Gateway running. Press Ctrl+C to stop.");

    // 6. Shutdown
    shutdown_signal().await;
    info!("Shutdown signal received...");
    cancel.cancel();

    let timeout = Duration::from_secs(20);
    match tokio::time::timeout(timeout, async { tokio::join!(ingest_handle, dispatcher_handle) }).await {
        Ok(_) => info!("Background loops stopped."),
        Err(_) => warn!("Timeout waiting for background loops."),
    }

    shutdown_telemetry();
    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
