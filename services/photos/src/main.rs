use anyhow::{Context, Result};
use photos_service::backup::target_from_config;
use photos_service::config::{Config, LogFormat};
use photos_service::{start_api_server, AppState, PhotoSink, Pipeline};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, config.service.log_format);

    let version = config.version().context("Failed to read service version")?;

    info!(
        service = %config.service.name,
        version = %version,
        "Starting PhotoPi photos service"
    );

    // Initialize metrics
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    ensure_dir(&config.storage.photos_path)?;
    ensure_dir(&config.storage.show_path)?;

    let target = target_from_config(&config.backup)
        .await
        .context("Failed to initialize backup target")?;

    let pipeline = Arc::new(Pipeline::start(
        &config.pipeline,
        &config.storage.show_path,
        target,
    ));

    let api_state = AppState {
        pipeline: pipeline.clone() as Arc<dyn PhotoSink>,
        photos_path: config.storage.photos_path.clone(),
        upload_tag: config.api.upload_tag.clone(),
        version,
    };

    info!("Photos service started successfully");

    // Serve until a shutdown signal arrives
    start_api_server(api_state, &config.api, &config.storage, shutdown_signal()).await?;

    info!("Shutting down photos service");

    pipeline.shutdown().await;

    let stats = pipeline.snapshot();
    if stats.backup.failed > 0 {
        warn!(
            dropped = stats.backup.failed,
            "Some photos were not handed to staging and remain in the upload directory"
        );
    }

    info!(?stats, "Photos service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Unable to create directory {}", path.display()))?;
        info!(path = %path.display(), "Created directory");
    }
    Ok(())
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
