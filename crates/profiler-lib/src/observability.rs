//! Observability infrastructure for the pod profiler
//!
//! Provides:
//! - Prometheus metrics (records written, duplicates, source and storage errors, reloads)
//! - Structured JSON logging with tracing

use crate::error::ProfilerError;
use prometheus::{register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for log write latency (in seconds)
const WRITE_LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ProfilerMetricsInner> = OnceLock::new();

struct ProfilerMetricsInner {
    records_written: IntCounter,
    rows_written: IntCounter,
    duplicate_samples: IntCounter,
    source_errors: IntCounter,
    storage_errors: IntCounter,
    reloads: IntCounter,
    active_poll_loops: IntGauge,
    capture_units: IntGauge,
    write_latency_seconds: Histogram,
}

impl ProfilerMetricsInner {
    fn new() -> Self {
        Self {
            records_written: register_int_counter!(
                "pod_profiler_records_written_total",
                "Snapshots persisted to capture logs"
            )
            .expect("Failed to register records_written"),

            rows_written: register_int_counter!(
                "pod_profiler_rows_written_total",
                "Per-container CSV rows appended to capture logs"
            )
            .expect("Failed to register rows_written"),

            duplicate_samples: register_int_counter!(
                "pod_profiler_duplicate_samples_total",
                "Readings dropped because their timestamp was already recorded"
            )
            .expect("Failed to register duplicate_samples"),

            source_errors: register_int_counter!(
                "pod_profiler_source_errors_total",
                "Failed reads from the sample source, excluding not found"
            )
            .expect("Failed to register source_errors"),

            storage_errors: register_int_counter!(
                "pod_profiler_storage_errors_total",
                "Failed capture log creates, writes or flushes"
            )
            .expect("Failed to register storage_errors"),

            reloads: register_int_counter!(
                "pod_profiler_reloads_total",
                "Configuration reloads processed"
            )
            .expect("Failed to register reloads"),

            active_poll_loops: register_int_gauge!(
                "pod_profiler_active_poll_loops",
                "Poll loops currently running"
            )
            .expect("Failed to register active_poll_loops"),

            capture_units: register_int_gauge!(
                "pod_profiler_capture_units",
                "Capture units in the current generation"
            )
            .expect("Failed to register capture_units"),

            write_latency_seconds: register_histogram!(
                "pod_profiler_write_latency_seconds",
                "Time spent appending and flushing one record",
                WRITE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register write_latency_seconds"),
        }
    }
}

/// Profiler metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct ProfilerMetrics {
    _private: (),
}

impl Default for ProfilerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProfilerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilerMetrics").finish_non_exhaustive()
    }
}

impl ProfilerMetrics {
    /// Create a new metrics handle (registers the global metrics on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ProfilerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ProfilerMetricsInner {
        GLOBAL_METRICS.get_or_init(ProfilerMetricsInner::new)
    }

    /// Record one persisted snapshot of `rows` rows
    pub fn observe_write(&self, rows: usize, duration_secs: f64) {
        let inner = self.inner();
        inner.records_written.inc();
        inner.rows_written.inc_by(rows as u64);
        inner.write_latency_seconds.observe(duration_secs);
    }

    pub fn inc_duplicate_samples(&self) {
        self.inner().duplicate_samples.inc();
    }

    pub fn inc_source_errors(&self) {
        self.inner().source_errors.inc();
    }

    pub fn inc_storage_errors(&self) {
        self.inner().storage_errors.inc();
    }

    pub fn inc_reloads(&self) {
        self.inner().reloads.inc();
    }

    pub fn inc_active_poll_loops(&self) {
        self.inner().active_poll_loops.inc();
    }

    pub fn dec_active_poll_loops(&self) {
        self.inner().active_poll_loops.dec();
    }

    pub fn set_capture_units(&self, count: i64) {
        self.inner().capture_units.set(count);
    }

    pub fn records_written(&self) -> u64 {
        self.inner().records_written.get()
    }

    pub fn reloads(&self) -> u64 {
        self.inner().reloads.get()
    }
}

/// Structured logger for profiler lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    namespace: String,
}

impl StructuredLogger {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn log_startup(&self, version: &str, platform: &str, results_path: &str) {
        info!(
            event = "profiler_started",
            namespace = %self.namespace,
            profiler_version = %version,
            platform = %platform,
            results_path = %results_path,
            "Pod profiler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "profiler_shutdown",
            namespace = %self.namespace,
            reason = %reason,
            "Pod profiler shutting down"
        );
    }

    pub fn log_capture_started(&self, selector: &str, pods: usize) {
        info!(
            event = "capture_started",
            namespace = %self.namespace,
            selector = %selector,
            pods = pods,
            "Capture started"
        );
    }

    pub fn log_capture_stopped(&self, selector: &str, clean: bool) {
        if clean {
            info!(
                event = "capture_stopped",
                namespace = %self.namespace,
                selector = %selector,
                "Capture stopped"
            );
        } else {
            warn!(
                event = "capture_stopped",
                namespace = %self.namespace,
                selector = %selector,
                "Capture stopped after aborting unfinished tasks"
            );
        }
    }

    pub fn log_config_reloaded(&self, selectors: &[String], success: bool) {
        if success {
            info!(
                event = "config_reloaded",
                namespace = %self.namespace,
                selectors = ?selectors,
                "Configuration reloaded"
            );
        } else {
            warn!(
                event = "config_reload_failed",
                namespace = %self.namespace,
                selectors = ?selectors,
                "Configuration reload failed, keeping previous selectors"
            );
        }
    }

    /// Log an error surfaced by a capture unit or the orchestrator
    pub fn log_capture_error(&self, selector: Option<&str>, error: &ProfilerError) {
        warn!(
            event = "capture_error",
            namespace = %self.namespace,
            selector = selector.unwrap_or("-"),
            kind = error.kind(),
            error = %error,
            "Capture error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessId;

    #[test]
    fn test_profiler_metrics_handles_share_state() {
        let metrics = ProfilerMetrics::new();
        let other = metrics.clone();

        let before = metrics.records_written();
        other.observe_write(3, 0.0002);
        assert!(metrics.records_written() > before);

        metrics.inc_duplicate_samples();
        metrics.inc_source_errors();
        metrics.inc_storage_errors();
        metrics.set_capture_units(2);
    }

    #[test]
    fn test_metrics_are_exposed_in_registry() {
        let metrics = ProfilerMetrics::new();
        metrics.inc_reloads();

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"pod_profiler_reloads_total".to_string()));
        assert!(names.contains(&"pod_profiler_active_poll_loops".to_string()));
    }

    #[test]
    fn test_structured_logger_accepts_errors() {
        let logger = StructuredLogger::new("default");
        assert_eq!(logger.namespace, "default");
        logger.log_capture_error(Some("svc-a"), &ProfilerError::source(&ProcessId::new("p"), "x"));
        logger.log_capture_error(None, &ProfilerError::Configuration("bad".into()));
    }
}
