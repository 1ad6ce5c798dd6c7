//! Capture orchestration
//!
//! The [`Orchestrator`] owns the active configuration snapshot and every
//! [`CaptureUnit`] built from it. A single coordinating loop applies one
//! [`Directive`] at a time; callers hold an [`OrchestratorHandle`] and wait
//! for each directive to be acknowledged. Errors raised by capture units travel
//! on a separate channel drained by its own task, so reporting an error can
//! never block the loop that applies directives.

use crate::capture::{
    report, write_index, CaptureContext, CaptureSettings, CaptureUnit, ErrorReport, SampleSource,
    TargetResolver, WrittenTimestamps,
};
use crate::error::{ProfilerError, Result};
use crate::health::{components, HealthRegistry};
use crate::observability::{ProfilerMetrics, StructuredLogger};
use crate::settings::{ConfigProvider, ProfilerConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Reports buffered between capture units and the error drain
const ERROR_BUFFER: usize = 256;

/// Lifecycle requests applied by the coordinating loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Start,
    Stop,
    /// Stop, re-read configuration, start
    Reload,
    /// Stop and exit the coordinating loop
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
}

struct Envelope {
    directive: Directive,
    reply: oneshot::Sender<Result<()>>,
}

pub struct Orchestrator {
    provider: Arc<dyn ConfigProvider>,
    resolver: Arc<dyn TargetResolver>,
    source: Arc<dyn SampleSource>,
    config: watch::Sender<Arc<ProfilerConfig>>,
    state: watch::Sender<OrchestratorState>,
    directives: mpsc::Receiver<Envelope>,
    errors_tx: mpsc::Sender<ErrorReport>,
    errors_rx: Option<mpsc::Receiver<ErrorReport>>,
    units: Vec<CaptureUnit>,
    /// Survives reloads so a restarted pod does not repeat its last row
    written: WrittenTimestamps,
    health: HealthRegistry,
    metrics: ProfilerMetrics,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn new(
        initial: ProfilerConfig,
        provider: Arc<dyn ConfigProvider>,
        resolver: Arc<dyn TargetResolver>,
        source: Arc<dyn SampleSource>,
        health: HealthRegistry,
    ) -> (Self, OrchestratorHandle) {
        let logger = StructuredLogger::new(initial.namespace.clone());
        let (config_tx, config_rx) = watch::channel(Arc::new(initial));
        let (state_tx, state_rx) = watch::channel(OrchestratorState::Idle);
        let (directive_tx, directive_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);

        let orchestrator = Self {
            provider,
            resolver,
            source,
            config: config_tx,
            state: state_tx,
            directives: directive_rx,
            errors_tx,
            errors_rx: Some(errors_rx),
            units: Vec::new(),
            written: WrittenTimestamps::default(),
            health,
            metrics: ProfilerMetrics::new(),
            logger,
        };

        let handle = OrchestratorHandle {
            directives: directive_tx,
            config: config_rx,
            state: state_rx,
        };

        (orchestrator, handle)
    }

    /// Run the coordinating loop until a shutdown directive arrives or every
    /// handle is dropped
    pub async fn run(mut self) {
        self.health.register(components::ORCHESTRATOR).await;
        self.health.register(components::STORAGE).await;

        let drain = self.errors_rx.take().map(|errors| {
            tokio::spawn(drain_errors(
                errors,
                self.health.clone(),
                self.logger.clone(),
            ))
        });

        info!("Orchestrator started");

        while let Some(Envelope { directive, reply }) = self.directives.recv().await {
            debug!(?directive, "Applying directive");

            let result = match directive {
                Directive::Start => self.start_captures().await,
                Directive::Stop => {
                    self.stop_captures().await;
                    Ok(())
                }
                Directive::Reload => self.reload().await,
                Directive::Shutdown => {
                    self.stop_captures().await;
                    let _ = reply.send(Ok(()));
                    break;
                }
            };

            if let Err(e) = &result {
                warn!(?directive, error = %e, "Directive completed with error");
            }
            let _ = reply.send(result);
        }

        self.stop_captures().await;
        self.logger.log_shutdown("orchestrator stopped");

        let stop_timeout = self.config.borrow().stop_timeout();
        drop(self);
        if let Some(drain) = drain {
            if tokio::time::timeout(stop_timeout, drain).await.is_err() {
                warn!("Error drain did not finish after shutdown");
            }
        }
    }

    fn current_config(&self) -> Arc<ProfilerConfig> {
        self.config.borrow().clone()
    }

    async fn start_captures(&mut self) -> Result<()> {
        if *self.state.borrow() == OrchestratorState::Running {
            debug!("Captures already running, ignoring start");
            return Ok(());
        }

        let config = self.current_config();
        let results = &config.results_path;

        if let Err(e) = std::fs::create_dir_all(results) {
            let err = ProfilerError::storage(results, e);
            self.health
                .set_unhealthy(components::STORAGE, err.to_string())
                .await;
            error!(error = %err, "Cannot create results directory");
            return Err(err);
        }
        self.health.set_healthy(components::STORAGE).await;

        let ctx = CaptureContext {
            resolver: self.resolver.clone(),
            source: self.source.clone(),
            settings: CaptureSettings::from(config.as_ref()),
            errors: self.errors_tx.clone(),
            metrics: self.metrics.clone(),
            written: self.written.clone(),
        };

        let mut seen = HashSet::new();
        let selectors: Vec<&str> = config
            .pod_labels
            .iter()
            .map(|s| s.trim())
            .filter(|s| seen.insert(*s))
            .collect();

        // A pod matched by several workloads is captured by the first one only
        let mut claimed = HashSet::new();
        for selector in &selectors {
            match CaptureUnit::create_claiming(selector, results.clone(), ctx.clone(), &mut claimed)
                .await
            {
                Ok(unit) => self.units.push(unit),
                Err(e) => {
                    warn!(selector = %selector, error = %e, "Skipping workload");
                    report(&self.errors_tx, ErrorReport::capture(*selector, e)).await;
                }
            }
        }

        if let Err(e) = write_index(results) {
            self.metrics.inc_storage_errors();
            report(&self.errors_tx, ErrorReport::global(e)).await;
        }

        for unit in &mut self.units {
            if let Err(e) = unit.start() {
                report(&self.errors_tx, ErrorReport::capture(unit.selector(), e)).await;
                continue;
            }
            self.health
                .register(&components::capture(unit.selector()))
                .await;
            self.logger
                .log_capture_started(unit.selector(), unit.processes().count());
        }

        self.metrics.set_capture_units(self.units.len() as i64);
        self.state.send_replace(OrchestratorState::Running);
        self.health.set_healthy(components::ORCHESTRATOR).await;
        self.health.set_ready(true).await;

        info!(
            units = self.units.len(),
            selectors = selectors.len(),
            results_path = %results.display(),
            "Captures started"
        );

        if self.units.is_empty() && !selectors.is_empty() {
            return Err(ProfilerError::discovery(
                selectors.join(","),
                "no workload could be resolved",
            ));
        }
        Ok(())
    }

    /// Stop every unit and wait for its tasks, sharing one deadline
    async fn stop_captures(&mut self) {
        if self.units.is_empty() && *self.state.borrow() == OrchestratorState::Idle {
            return;
        }

        for unit in &mut self.units {
            unit.stop();
        }

        let deadline = Instant::now() + self.current_config().stop_timeout();
        for mut unit in self.units.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let clean = unit.wait_stopped(remaining).await;
            self.logger.log_capture_stopped(unit.selector(), clean);
        }

        self.health.clear_captures().await;
        self.metrics.set_capture_units(0);
        self.state.send_replace(OrchestratorState::Idle);
        info!("Captures stopped");
    }

    async fn reload(&mut self) -> Result<()> {
        self.metrics.inc_reloads();
        self.stop_captures().await;

        match self.provider.load() {
            Ok(config) => {
                config.dump();
                self.logger.log_config_reloaded(&config.pod_labels, true);
                self.config.send_replace(Arc::new(config));
            }
            Err(e) => {
                self.logger
                    .log_config_reloaded(&self.current_config().pod_labels, false);
                report(&self.errors_tx, ErrorReport::global(e)).await;
            }
        }

        self.start_captures().await
    }
}

/// Sole reader of the error channel
async fn drain_errors(
    mut errors: mpsc::Receiver<ErrorReport>,
    health: HealthRegistry,
    logger: StructuredLogger,
) {
    while let Some(ErrorReport { selector, error }) = errors.recv().await {
        logger.log_capture_error(selector.as_deref(), &error);

        let component = match (&selector, &error) {
            (Some(selector), _) => components::capture(selector),
            (None, ProfilerError::Storage { .. }) => components::STORAGE.to_string(),
            (None, _) => components::ORCHESTRATOR.to_string(),
        };
        health.set_degraded(&component, error.to_string()).await;
    }
}

/// Cloneable front end of a running [`Orchestrator`]
#[derive(Clone)]
pub struct OrchestratorHandle {
    directives: mpsc::Sender<Envelope>,
    config: watch::Receiver<Arc<ProfilerConfig>>,
    state: watch::Receiver<OrchestratorState>,
}

impl OrchestratorHandle {
    /// Send a directive and wait until it has been applied
    pub async fn send(&self, directive: Directive) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.directives
            .send(Envelope { directive, reply })
            .await
            .map_err(|_| orchestrator_gone())?;
        response.await.map_err(|_| orchestrator_gone())?
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Directive::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Directive::Stop).await
    }

    pub async fn reload(&self) -> Result<()> {
        self.send(Directive::Reload).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Directive::Shutdown).await
    }

    pub fn active_config(&self) -> Arc<ProfilerConfig> {
        self.config.borrow().clone()
    }

    /// Receiver that observes every published configuration snapshot
    pub fn config_updates(&self) -> watch::Receiver<Arc<ProfilerConfig>> {
        self.config.clone()
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.directives.is_closed()
    }

    /// Turn "configuration changed" notifications into reloads. Bursts that
    /// arrive within `settle` collapse into one reload.
    pub async fn follow_config_changes(self, mut changes: mpsc::Receiver<()>, settle: Duration) {
        while changes.recv().await.is_some() {
            tokio::time::sleep(settle).await;
            while changes.try_recv().is_ok() {}

            info!("Configuration changed, reloading");
            if let Err(e) = self.reload().await {
                if self.is_closed() {
                    break;
                }
                warn!(error = %e, "Reload completed with error");
            }
        }
        debug!("Configuration change stream ended");
    }
}

fn orchestrator_gone() -> ProfilerError {
    ProfilerError::Configuration("orchestrator is not running".to_string())
}
