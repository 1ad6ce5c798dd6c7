//! Command line and environment

use clap::Parser;

/// Captures CPU and memory usage of Kubernetes workloads into per-pod CSV logs
#[derive(Debug, Clone, Parser)]
#[command(name = "pod-profiler", version, about)]
pub struct Cli {
    /// Namespace the monitored workloads live in
    #[arg(long, env = "NAMESPACE", value_parser = non_blank)]
    pub namespace: String,

    /// Config file path, or a bare name searched in the config directories
    #[arg(long, env = "PROFILER_CONFIG")]
    pub config: Option<String>,
}

fn non_blank(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err("value can not be blank".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}
