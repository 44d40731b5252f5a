//! Vigil service entry point.
//!
//! Loads configuration, wires the entity store, artifact store, frame
//! sources and metadata queue into a [`ServiceContext`], starts the
//! configured streams and runs until SIGINT/SIGTERM.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with VIGIL_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_analytics::{DatabaseConfig, EntityStore, MemoryEntityStore};
use vigil_ingest::config::{LoggingConfig, VigilConfig};
use vigil_ingest::context::{artifact_store, ServiceContext};
use vigil_ingest::source::DefaultConnector;
use vigil_pipeline::{MemoryQueue, QueueBackend};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "vigil-ingest",
        version = env!("CARGO_PKG_VERSION"),
        streams = config.streams.len(),
        detection_mode = ?config.detection.mode,
        "Starting Vigil service"
    );

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    let store = build_store(&config.database).await?;
    let artifacts = artifact_store(&config.segments)
        .await
        .context("Failed to initialize artifact store")?;
    let connector = DefaultConnector::new(&config.rtsp, config.sessions.connect_timeout())
        .context("Failed to initialize frame sources")?;

    let context = Arc::new(ServiceContext::new(
        config.clone(),
        store,
        artifacts,
        Arc::new(connector),
    ));
    let shutdown = CancellationToken::new();

    let ingest_handle = spawn_ingest(&context, shutdown.clone())?;
    let health_handle = tokio::spawn(run_health_monitor(
        Arc::clone(&context),
        Duration::from_secs(config.metrics.health_interval_secs.max(1)),
        shutdown.clone(),
    ));

    let started = context.start_configured_streams().await;
    info!(started, configured = config.streams.len(), "Vigil service started");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    shutdown.cancel();
    context.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(5), ingest_handle).await.is_err() {
        warn!("Metadata ingest did not stop in time");
    }
    health_handle.abort();

    log_final_stats(&context);
    info!("Shutdown complete");
    Ok(())
}

/// Load configuration, falling back to the environment alone.
fn load_config() -> Result<VigilConfig> {
    // Try loading from files first, fall back to environment
    let config = VigilConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        VigilConfig::from_env()
    })?;

    Ok(config)
}

/// Filter directives applied on top of `RUST_LOG`.
fn log_directives(level: &str) -> Vec<String> {
    let level = match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    vec![
        format!("vigil_ingest={level}"),
        format!("vigil_analytics={level}"),
        format!("vigil_pipeline={level}"),
        "gstreamer=warn".to_string(),
        "sqlx=warn".to_string(),
    ]
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for directive in log_directives(&config.level) {
        filter = filter.add_directive(directive.parse()?);
    }

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Postgres when a database URL is configured, memory otherwise.
async fn build_store(config: &DatabaseConfig) -> Result<Arc<dyn EntityStore>> {
    match config.url.as_deref() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            let store = vigil_analytics::PgEntityStore::connect(url, config)
                .await
                .context("Failed to initialize entity store")?;
            if config.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => anyhow::bail!("database.url is set but the postgres feature is disabled"),
        None => {
            warn!("No database configured, using in-memory entity store");
            Ok(Arc::new(MemoryEntityStore::new()))
        }
    }
}

/// Spawn the metadata ingest adapter on the configured queue backend.
fn spawn_ingest(context: &Arc<ServiceContext>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    let queue = &context.config().queue;

    match queue.backend {
        QueueBackend::Memory => {
            warn!("Using in-memory metadata queue; no external detections will arrive");
            let memory = MemoryQueue::new();
            let source = memory.subscribe(queue.topics.metadata_raw.clone());
            let mut adapter = context.ingest_adapter(source, Arc::new(memory));
            Ok(tokio::spawn(async move { adapter.run(shutdown).await }))
        }
        #[cfg(feature = "kafka")]
        QueueBackend::Kafka => {
            let source = vigil_pipeline::KafkaSource::new(queue.kafka.clone(), vec![queue.topics.metadata_raw.clone()]);
            let publisher = vigil_pipeline::KafkaPublisher::new(&queue.kafka)
                .context("Failed to initialize Kafka publisher")?;
            let mut adapter = context.ingest_adapter(source, Arc::new(publisher));
            Ok(tokio::spawn(async move { adapter.run(shutdown).await }))
        }
        #[cfg(not(feature = "kafka"))]
        QueueBackend::Kafka => anyhow::bail!("queue backend kafka requires the kafka feature"),
    }
}

/// Periodically log session and subscriber health.
async fn run_health_monitor(context: Arc<ServiceContext>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let streams = context.active_streams();
        let connections = context.connection_stats();
        info!(
            active_streams = streams.len(),
            subscribers = connections.total_connections,
            global_subscribers = connections.global_subscribers,
            "Service health"
        );

        for stream in streams {
            debug!(
                camera_id = %stream.camera_id,
                state = %stream.state,
                frame_count = stream.frame_count,
                segment_count = stream.segment_count,
                error_count = stream.error_count,
                "Stream stats"
            );
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(context: &ServiceContext) {
    let connections = context.connection_stats();
    let remaining = context.active_streams();
    if !remaining.is_empty() {
        error!(streams = remaining.len(), "Streams still active after shutdown");
    }
    info!(
        subscribers = connections.total_connections,
        camera_subscriptions = connections.camera_subscriptions.len(),
        "Final subscriber stats"
    );
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directives_parse() {
        for level in ["trace", "DEBUG", "info", "bogus"] {
            for directive in log_directives(level) {
                assert!(directive.parse::<tracing_subscriber::filter::Directive>().is_ok());
            }
        }
        assert_eq!(log_directives("bogus")[0], "vigil_ingest=info");
        assert_eq!(log_directives("DEBUG")[0], "vigil_ingest=debug");
    }

    #[tokio::test]
    async fn test_store_without_database_url() {
        let store = build_store(&DatabaseConfig::default()).await.unwrap();
        assert!(store.camera("missing").await.unwrap().is_none());
    }
}
