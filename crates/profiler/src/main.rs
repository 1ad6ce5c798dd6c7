//! Pod Profiler - workload resource capture service
//!
//! Polls the metrics API for every pod of the configured workloads, appends
//! the readings to per-pod CSV logs and serves them over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use pod_profiler::{api, config::Cli};
use profiler_lib::{
    capture::{KubeTargetResolver, MetricsServerSource},
    health::HealthRegistry,
    observability::{ProfilerMetrics, StructuredLogger},
    orchestrator::Orchestrator,
    settings::{ConfigProvider, ConfigWatcher, FileConfigProvider},
    ProfilerError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PROFILER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Quiet period that collapses a burst of file events into one reload
const RELOAD_SETTLE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    info!(namespace = %cli.namespace, "Starting pod-profiler");

    let provider = Arc::new(
        FileConfigProvider::discover(cli.namespace.clone(), cli.config.as_deref())
            .context("failed to locate configuration")?,
    );
    let config = provider.load().context("failed to load configuration")?;
    config.dump();

    let profile = config.platform.profile();
    info!(
        platform = %profile.platform,
        regions = profile.regions.len(),
        autoscaling_api_version = %profile.autoscaling_api_version,
        "Platform profile selected"
    );

    let logger = StructuredLogger::new(&config.namespace);
    logger.log_startup(
        PROFILER_VERSION,
        profile.platform.as_str(),
        &config.results_path.display().to_string(),
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let resolver = Arc::new(KubeTargetResolver::new(client.clone(), &config.namespace));
    let source = Arc::new(MetricsServerSource::new(client, &config.namespace));

    let health_registry = HealthRegistry::new();
    let metrics = ProfilerMetrics::new();
    let http_port = config.http_port;

    let (orchestrator, handle) = Orchestrator::new(
        config,
        provider.clone(),
        resolver,
        source,
        health_registry.clone(),
    );
    let orchestrator_task = tokio::spawn(orchestrator.run());

    match handle.start().await {
        Ok(()) => {}
        Err(e @ ProfilerError::Storage { .. }) => {
            return Err(e).context("cannot write results");
        }
        Err(e) => warn!(error = %e, "Started with partial coverage"),
    }

    // Dropping the watcher handle stops file notifications
    let _watcher = match provider.path() {
        Some(path) => match ConfigWatcher::new(path).start() {
            Ok((watcher, changes)) => {
                tokio::spawn(handle.clone().follow_config_changes(changes, RELOAD_SETTLE));
                Some(watcher)
            }
            Err(e) => {
                warn!(error = %e, "Configuration changes will not be picked up");
                None
            }
        },
        None => None,
    };

    let app_state = Arc::new(api::AppState::new(
        health_registry,
        metrics,
        handle.config_updates(),
    ));
    let api_task = tokio::spawn(api::serve(http_port, app_state));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        served = api_task => {
            match served {
                Ok(Ok(())) => warn!("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
            logger.log_shutdown("API server stopped");
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Orchestrator already stopped");
    }
    if let Err(e) = orchestrator_task.await {
        error!(error = %e, "Orchestrator task failed");
    }

    info!("Shutdown complete");
    Ok(())
}
