//! GPU exporter - per-pod GPU usage for Prometheus
//!
//! Runs as a DaemonSet on each GPU node: watches the node's GPU pods, maps
//! them to processes through the cgroup hierarchy and attributes the
//! driver's per-process usage to pods and containers.

use anyhow::{Context, Result};
use clap::Parser;
use exporter_lib::{
    api::{self, AppState},
    device::{GpuDriver, NvmlDriver},
    health::{components, HealthRegistry},
    kubepods::PodWatcher,
    observability::{ExporterMetrics, StructuredLogger},
    ptree::{CgroupScanner, ProcessTree},
    Exporter, GpuMetrics,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = config::Cli::parse();
    let config = config::ExporterConfig::load(&cli).context("Failed to load configuration")?;
    let settings = config.exporter_settings();
    info!(
        node_name = %config.node_name,
        cgroup_root = %config.cgroup_root,
        "Exporter configured"
    );

    let health_registry = HealthRegistry::new();
    for component in [
        components::TREE_SCANNER,
        components::EXPORTER,
        components::GPU_DRIVER,
        components::POD_WATCHER,
    ] {
        health_registry.register(component).await;
    }

    let exporter_metrics = ExporterMetrics::new();
    let registry = prometheus::default_registry().clone();
    let gpu_metrics =
        Arc::new(GpuMetrics::register(&registry).context("Failed to register GPU metrics")?);

    // The driver may come up after the exporter; NvmlDriver retries on use
    let driver: Arc<dyn GpuDriver> = match NvmlDriver::init() {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            warn!(error = %e, "GPU driver unavailable, will retry every cycle");
            health_registry
                .set_degraded(components::GPU_DRIVER, e.to_string())
                .await;
            Arc::new(NvmlDriver::new())
        }
    };

    let scanner = Arc::new(CgroupScanner::new(&config.cgroup_root));
    let tree = Arc::new(
        ProcessTree::new(scanner, config.interval())
            .with_metrics(exporter_metrics)
            .with_health(health_registry.clone()),
    );

    let labels = settings.names.labels.clone();
    let exporter = Arc::new(Exporter::new(
        settings,
        tree.clone(),
        driver,
        gpu_metrics,
        health_registry.clone(),
    ));

    let watcher = PodWatcher::try_default(&config.node_name, labels.clone())
        .await
        .context("Failed to create Kubernetes client")?
        .with_health(health_registry.clone());

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(EXPORTER_VERSION, config.interval_secs, &labels);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let tree_handle = tokio::spawn(tree.run(shutdown_tx.subscribe()));
    let watcher_handle = tokio::spawn(watcher.run(exporter.clone(), shutdown_tx.subscribe()));
    let exporter_handle = tokio::spawn(exporter.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(AppState::new(health_registry.clone(), registry));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for (name, handle) in [
        ("process tree", tree_handle),
        ("pod watcher", watcher_handle),
        ("exporter", exporter_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    api_handle
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or, on unix, SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
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
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
