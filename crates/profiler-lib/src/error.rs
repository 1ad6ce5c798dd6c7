//! Error taxonomy for capture and orchestration

use crate::models::ProcessId;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = ProfilerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProfilerError {
    /// Bad or missing selector, unusable output path, invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Target resolver unreachable or returned nothing
    #[error("discovery failed for selector '{selector}': {message}")]
    Discovery { selector: String, message: String },

    /// Process is not (yet) known to the sample source; retried silently
    #[error("no metrics found for process {0}")]
    NotFound(ProcessId),

    /// Any other sample source failure
    #[error("failed to fetch metrics for process {process}: {message}")]
    Source { process: ProcessId, message: String },

    /// File create, write or flush failure
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProfilerError {
    pub fn discovery(selector: impl Into<String>, message: impl ToString) -> Self {
        Self::Discovery {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    pub fn source(process: &ProcessId, message: impl ToString) -> Self {
        Self::Source {
            process: process.clone(),
            message: message.to_string(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly name used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Discovery { .. } => "discovery",
            Self::NotFound(_) => "not_found",
            Self::Source { .. } => "source",
            Self::Storage { .. } => "storage",
        }
    }

    /// Errors the poll loop absorbs and retries without surfacing
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let pid = ProcessId::new("pod-1");
        assert_eq!(ProfilerError::NotFound(pid.clone()).kind(), "not_found");
        assert_eq!(ProfilerError::source(&pid, "boom").kind(), "source");
        assert_eq!(ProfilerError::discovery("svc", "empty").kind(), "discovery");
        assert!(ProfilerError::NotFound(pid.clone()).is_transient());
        assert!(!ProfilerError::source(&pid, "boom").is_transient());
    }

    #[test]
    fn test_storage_error_message_includes_path() {
        let err = ProfilerError::storage(
            "/tmp/out/pod-1.csv",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/out/pod-1.csv"));
        assert!(msg.contains("denied"));
    }
}
