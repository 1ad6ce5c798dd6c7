//! Pod resource profiler library
//!
//! This crate provides the core functionality for:
//! - Resolving workload pods and polling their CPU and memory usage
//! - Appending de-duplicated samples to per-pod CSV logs
//! - Orchestrating capture units across configuration reloads
//! - Health checks and observability

pub mod capture;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod platform;
pub mod retry;
pub mod settings;

pub use capture::{
    CaptureUnit, ErrorReport, KubeTargetResolver, MetricsServerSource, SampleSource,
    TargetResolver,
};
pub use error::{ProfilerError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ProfilerMetrics, StructuredLogger};
pub use orchestrator::{Directive, Orchestrator, OrchestratorHandle, OrchestratorState};
pub use platform::{Platform, PlatformProfile};
pub use settings::{ConfigProvider, ConfigWatcher, FileConfigProvider, ProfilerConfig};
