//! Resource capture for the pods of a workload
//!
//! A [`CaptureUnit`] owns one poll loop per pod matched by its workload
//! selector plus a supervisor task that writes accepted records to the pod's
//! CSV log. Pods are discovered through a [`TargetResolver`] and sampled
//! through a [`SampleSource`]; the Kubernetes implementations live in
//! [`kubernetes`].

pub mod kubernetes;
pub mod quantity;
mod sink;
mod unit;

pub use kubernetes::{KubeTargetResolver, MetricsServerSource};
pub use sink::{write_index, RecordSink, CSV_HEADER, INDEX_FILE_NAME, TIME_FORMAT};
pub use unit::{CaptureUnit, UnitState};

use crate::error::{ProfilerError, Result};
use crate::models::{ProcessId, Snapshot};
use crate::observability::ProfilerMetrics;
use crate::settings::ProfilerConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub use async_trait::async_trait;

/// Lists the processes that currently belong to a workload
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Fails with [`ProfilerError::Discovery`] when the backing service is unreachable
    async fn list(&self, selector: &str) -> Result<Vec<ProcessId>>;
}

/// Reads the current resource usage of a process
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Fails with [`ProfilerError::NotFound`] when no reading exists yet
    async fn fetch(&self, process: &ProcessId) -> Result<Snapshot>;
}

/// An error surfaced to the operator, tagged with the workload it came from
#[derive(Debug)]
pub struct ErrorReport {
    pub selector: Option<String>,
    pub error: ProfilerError,
}

impl ErrorReport {
    pub fn capture(selector: impl Into<String>, error: ProfilerError) -> Self {
        Self {
            selector: Some(selector.into()),
            error,
        }
    }

    pub fn global(error: ProfilerError) -> Self {
        Self {
            selector: None,
            error,
        }
    }
}

/// Timing knobs for poll loops
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Delay between polls of one process
    pub poll_interval: Duration,
    /// Delay after the source reports the process as not found
    pub not_found_backoff: Duration,
    /// Records buffered between poll loops and the supervisor
    pub record_buffer: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            not_found_backoff: Duration::from_secs(10),
            record_buffer: 64,
        }
    }
}

impl From<&ProfilerConfig> for CaptureSettings {
    fn from(config: &ProfilerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            not_found_backoff: config.not_found_backoff(),
            ..Default::default()
        }
    }
}

/// Timestamp of the last record persisted for each process
///
/// Outlives capture generations so a restarted poll loop does not write the
/// reading its predecessor already wrote.
#[derive(Debug, Clone, Default)]
pub struct WrittenTimestamps(Arc<Mutex<HashMap<ProcessId, DateTime<Utc>>>>);

impl WrittenTimestamps {
    pub fn get(&self, process: &ProcessId) -> Option<DateTime<Utc>> {
        self.lock().get(process).copied()
    }

    pub fn record(&self, process: &ProcessId, timestamp: DateTime<Utc>) {
        self.lock().insert(process.clone(), timestamp);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessId, DateTime<Utc>>> {
        // The map holds plain values, a poisoned guard is still consistent
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Collaborators shared by every unit of one capture generation
#[derive(Clone)]
pub struct CaptureContext {
    pub resolver: Arc<dyn TargetResolver>,
    pub source: Arc<dyn SampleSource>,
    pub settings: CaptureSettings,
    pub errors: mpsc::Sender<ErrorReport>,
    pub metrics: ProfilerMetrics,
    pub written: WrittenTimestamps,
}

/// Forward an error to the operator-facing channel
pub(crate) async fn report(errors: &mpsc::Sender<ErrorReport>, report: ErrorReport) {
    if let Err(e) = errors.send(report).await {
        tracing::warn!(error = %e.0.error, "Error channel closed, dropping report");
    }
}

#[cfg(test)]
pub(crate) mod testing;
