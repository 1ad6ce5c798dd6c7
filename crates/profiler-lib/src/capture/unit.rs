//! Capture unit: poll loops and the record-writing supervisor for one workload

use super::sink::RecordSink;
use super::{
    report, CaptureContext, CaptureSettings, ErrorReport, SampleSource, WrittenTimestamps,
};
use crate::error::{ProfilerError, Result};
use crate::models::{ProcessId, Record};
use crate::observability::ProfilerMetrics;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a capture unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Logs are open, nothing is polling yet
    Created,
    Running,
    /// Stop signalled, tasks may still be winding down
    Stopping,
    Stopped,
}

/// Supervises polling and persistence for every pod of one workload selector
pub struct CaptureUnit {
    selector: String,
    output_dir: PathBuf,
    processes: BTreeSet<ProcessId>,
    sinks: HashMap<ProcessId, RecordSink>,
    ctx: CaptureContext,
    state: UnitState,
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CaptureUnit {
    /// Resolve the selector's pods and open (or create) a log for each
    pub async fn create(
        selector: &str,
        output_dir: impl Into<PathBuf>,
        ctx: CaptureContext,
    ) -> Result<Self> {
        Self::create_claiming(selector, output_dir, ctx, &mut HashSet::new()).await
    }

    /// Like [`create`](Self::create), but skips pods already in `claimed` and
    /// adds the ones this unit takes. Each pod log gets a single writer.
    pub async fn create_claiming(
        selector: &str,
        output_dir: impl Into<PathBuf>,
        ctx: CaptureContext,
        claimed: &mut HashSet<ProcessId>,
    ) -> Result<Self> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(ProfilerError::Configuration(
                "workload selector can not be blank".to_string(),
            ));
        }
        let output_dir = output_dir.into();

        let resolved: BTreeSet<ProcessId> = ctx
            .resolver
            .list(selector)
            .await
            .map_err(|e| match e {
                ProfilerError::Discovery { .. } => e,
                other => ProfilerError::discovery(selector, other),
            })?
            .into_iter()
            .collect();

        if resolved.is_empty() {
            return Err(ProfilerError::discovery(selector, "no pods matched the selector"));
        }

        let (taken, processes): (BTreeSet<ProcessId>, BTreeSet<ProcessId>) =
            resolved.into_iter().partition(|p| claimed.contains(p));
        for process in &taken {
            warn!(
                selector = %selector,
                process = %process,
                "Pod already captured by another workload, skipping"
            );
        }
        if processes.is_empty() {
            return Err(ProfilerError::discovery(
                selector,
                "every matched pod is already captured by another workload",
            ));
        }

        let mut sinks = HashMap::with_capacity(processes.len());
        for process in &processes {
            sinks.insert(process.clone(), RecordSink::open(&output_dir, process)?);
        }
        claimed.extend(processes.iter().cloned());

        debug!(
            selector = %selector,
            pods = processes.len(),
            output_dir = %output_dir.display(),
            "Capture unit created"
        );

        Ok(Self {
            selector: selector.to_string(),
            output_dir,
            processes,
            sinks,
            ctx,
            state: UnitState::Created,
            shutdown: None,
            tasks: Vec::new(),
        })
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessId> {
        self.processes.iter()
    }

    /// Spawn the supervisor and one poll loop per known pod
    pub fn start(&mut self) -> Result<()> {
        if self.state != UnitState::Created {
            return Err(ProfilerError::Configuration(format!(
                "capture unit for '{}' can only be started once",
                self.selector
            )));
        }

        info!(selector = %self.selector, pods = self.processes.len(), "Starting capture");

        let (shutdown_tx, _) = broadcast::channel(1);
        let (record_tx, record_rx) = mpsc::channel(self.ctx.settings.record_buffer.max(1));

        let supervisor = Supervisor {
            selector: self.selector.clone(),
            output_dir: self.output_dir.clone(),
            sinks: std::mem::take(&mut self.sinks),
            errors: self.ctx.errors.clone(),
            metrics: self.ctx.metrics.clone(),
            written: self.ctx.written.clone(),
        };
        self.tasks
            .push(tokio::spawn(supervisor.run(record_rx, shutdown_tx.subscribe())));

        for process in &self.processes {
            let poll = PollLoop {
                selector: self.selector.clone(),
                process: process.clone(),
                source: self.ctx.source.clone(),
                settings: self.ctx.settings.clone(),
                records: record_tx.clone(),
                errors: self.ctx.errors.clone(),
                metrics: self.ctx.metrics.clone(),
                written: self.ctx.written.clone(),
            };
            self.tasks.push(tokio::spawn(poll.run(shutdown_tx.subscribe())));
        }

        self.shutdown = Some(shutdown_tx);
        self.state = UnitState::Running;
        Ok(())
    }

    /// Signal every task to finish. Returns immediately.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // Dropping the sender also wakes receivers that missed the message
            let _ = shutdown.send(());
            info!(selector = %self.selector, "Stopping capture");
        }
        self.state = match self.state {
            UnitState::Created => UnitState::Stopped,
            UnitState::Running => UnitState::Stopping,
            other => other,
        };
    }

    /// Stop and wait up to `timeout` for every task to exit, aborting the rest.
    /// Returns false if anything had to be aborted.
    pub async fn wait_stopped(&mut self, timeout: Duration) -> bool {
        self.stop();

        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();

        let joined = tokio::time::timeout(timeout, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        self.state = UnitState::Stopped;

        match joined {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    selector = %self.selector,
                    timeout_ms = timeout.as_millis(),
                    "Capture tasks did not stop in time, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

/// Decrements the active poll loop gauge when the loop ends or is aborted
struct ActiveLoopGuard(ProfilerMetrics);

impl ActiveLoopGuard {
    fn new(metrics: &ProfilerMetrics) -> Self {
        metrics.inc_active_poll_loops();
        Self(metrics.clone())
    }
}

impl Drop for ActiveLoopGuard {
    fn drop(&mut self) {
        self.0.dec_active_poll_loops();
    }
}

/// Polls one process and hands new readings to the supervisor
struct PollLoop {
    selector: String,
    process: ProcessId,
    source: Arc<dyn SampleSource>,
    settings: CaptureSettings,
    records: mpsc::Sender<Record>,
    errors: mpsc::Sender<ErrorReport>,
    metrics: ProfilerMetrics,
    written: WrittenTimestamps,
}

impl PollLoop {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let _guard = ActiveLoopGuard::new(&self.metrics);
        // Picks up where an earlier generation left off after a reload
        let mut last_seen = self.written.get(&self.process);
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
            delay = self.settings.poll_interval;

            let fetched = tokio::select! {
                fetched = self.source.fetch(&self.process) => fetched,
                _ = shutdown.recv() => break,
            };

            match fetched {
                Ok(snapshot) => {
                    if last_seen == Some(snapshot.timestamp) {
                        self.metrics.inc_duplicate_samples();
                        continue;
                    }
                    last_seen = Some(snapshot.timestamp);

                    let record = Record::from_snapshot(self.process.clone(), snapshot);
                    tokio::select! {
                        sent = self.records.send(record) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(process = %self.process, "Metrics not available yet, backing off");
                    delay = self.settings.not_found_backoff;
                }
                Err(e) => {
                    self.metrics.inc_source_errors();
                    tokio::select! {
                        _ = report(&self.errors, ErrorReport::capture(&self.selector, e)) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        debug!(selector = %self.selector, process = %self.process, "Poll loop exited");
    }
}

/// Drains records and writes them to the per-process logs
struct Supervisor {
    selector: String,
    output_dir: PathBuf,
    sinks: HashMap<ProcessId, RecordSink>,
    errors: mpsc::Sender<ErrorReport>,
    metrics: ProfilerMetrics,
    written: WrittenTimestamps,
}

impl Supervisor {
    async fn run(
        mut self,
        mut records: mpsc::Receiver<Record>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                record = records.recv() => match record {
                    Some(record) => self.persist(record).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        // Write whatever the poll loops already handed over, then refuse more
        records.close();
        while let Ok(record) = records.try_recv() {
            self.persist(record).await;
        }

        for (_, sink) in self.sinks.drain() {
            if let Err(e) = sink.close() {
                self.metrics.inc_storage_errors();
                report(&self.errors, ErrorReport::capture(&self.selector, e)).await;
            }
        }

        info!(selector = %self.selector, "Capture stopped");
    }

    async fn persist(&mut self, record: Record) {
        let started = Instant::now();

        if self.written.get(&record.process) == Some(record.timestamp) {
            self.metrics.inc_duplicate_samples();
            return;
        }

        if !self.sinks.contains_key(&record.process) {
            match RecordSink::open(&self.output_dir, &record.process) {
                Ok(sink) => {
                    self.sinks.insert(record.process.clone(), sink);
                }
                Err(e) => {
                    self.metrics.inc_storage_errors();
                    report(&self.errors, ErrorReport::capture(&self.selector, e)).await;
                    return;
                }
            }
        }
        let Some(sink) = self.sinks.get_mut(&record.process) else {
            return;
        };

        match sink.write_record(&record) {
            Ok(rows) => {
                self.written.record(&record.process, record.timestamp);
                self.metrics
                    .observe_write(rows, started.elapsed().as_secs_f64());
                debug!(
                    selector = %self.selector,
                    process = %record.process,
                    rows,
                    "Record written"
                );
            }
            Err(e) => {
                self.metrics.inc_storage_errors();
                report(&self.errors, ErrorReport::capture(&self.selector, e)).await;
            }
        }
    }
}
