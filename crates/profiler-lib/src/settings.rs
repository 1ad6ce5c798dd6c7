//! Profiler configuration
//!
//! A [`ProfilerConfig`] is an immutable snapshot. Reloading never mutates a
//! snapshot in place: the provider builds a new one and the orchestrator swaps
//! it in between stopping and restarting captures.

use crate::error::{ProfilerError, Result};
use crate::platform::Platform;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Label that ties a pod to its workload
pub const KUBERNETES_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Application name used for config directories
pub const APPLICATION_NAME: &str = "pod-profiler";

/// Config file name looked up when no override is given
pub const DEFAULT_CONFIG_NAME: &str = "profiler";

/// Prefix for environment overrides, e.g. `PROFILER_HTTP_PORT`
pub const ENV_PREFIX: &str = "PROFILER";

const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml", "toml", "json"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Namespace the monitored workloads live in
    #[serde(default)]
    pub namespace: String,

    /// Workload selectors, one capture unit each
    #[serde(default)]
    pub pod_labels: Vec<String>,

    /// Directory the per-pod CSV logs and the index are written to
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,

    /// Port the results/health server listens on
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Seconds between metric polls for one pod
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds to wait before re-polling a pod the metrics API does not know
    #[serde(default = "default_not_found_backoff")]
    pub not_found_backoff_secs: u64,

    /// Upper bound on waiting for captures to wind down before aborting them
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default)]
    pub platform: Platform,
}

fn default_results_path() -> PathBuf {
    PathBuf::from("./results")
}

fn default_http_port() -> u16 {
    8000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_not_found_backoff() -> u64 {
    10
}

fn default_stop_timeout() -> u64 {
    15
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            pod_labels: Vec::new(),
            results_path: default_results_path(),
            http_port: default_http_port(),
            poll_interval_secs: default_poll_interval(),
            not_found_backoff_secs: default_not_found_backoff(),
            stop_timeout_secs: default_stop_timeout(),
            platform: Platform::default(),
        }
    }
}

impl ProfilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn not_found_backoff(&self) -> Duration {
        Duration::from_secs(self.not_found_backoff_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(ProfilerError::Configuration(
                "namespace can not be blank".to_string(),
            ));
        }
        if self.results_path.as_os_str().is_empty() {
            return Err(ProfilerError::Configuration(
                "results_path can not be blank".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ProfilerError::Configuration(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Log every value, one line per field
    pub fn dump(&self) {
        info!(
            namespace = %self.namespace,
            pod_labels = ?self.pod_labels,
            results_path = %self.results_path.display(),
            http_port = self.http_port,
            poll_interval_secs = self.poll_interval_secs,
            platform = %self.platform,
            "Active configuration"
        );
    }
}

/// Source of configuration snapshots
pub trait ConfigProvider: Send + Sync {
    /// Read the full configuration afresh
    fn load(&self) -> Result<ProfilerConfig>;
}

/// Loads configuration from an optional file plus `PROFILER_*` environment
/// overrides. The namespace always comes from the process environment.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    namespace: String,
    file: Option<PathBuf>,
}

impl FileConfigProvider {
    pub fn new(namespace: impl Into<String>, file: Option<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            file,
        }
    }

    /// Resolve the config file from the standard directories
    pub fn discover(namespace: impl Into<String>, override_name: Option<&str>) -> Result<Self> {
        let dirs = config_directories(true);
        let file = resolve_config_file(&dirs, override_name)?;
        Ok(Self::new(namespace, file))
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<ProfilerConfig> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = &self.file {
            builder = builder.add_source(::config::File::from(path.as_path()).required(true));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pod_labels"),
            )
            .set_override("namespace", self.namespace.clone())
            .and_then(|b| b.build())
            .map_err(|e| ProfilerError::Configuration(e.to_string()))?;

        let snapshot: ProfilerConfig = config
            .try_deserialize()
            .map_err(|e| ProfilerError::Configuration(e.to_string()))?;

        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Candidate configuration directories, most specific first
pub fn config_directories(include_cwd: bool) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if include_cwd {
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
    }

    if let Some(config_dir) = dirs_next::config_dir() {
        dirs.push(config_dir.join(APPLICATION_NAME));
    }

    if cfg!(target_os = "linux") {
        dirs.push(Path::new("/etc").join(APPLICATION_NAME));
    }

    dirs
}

/// Find the configuration file.
///
/// `override_name` may be a path (used as-is) or a bare name searched for in
/// `dirs` with and without the supported extensions. Without an override the
/// default name is searched and a miss is not an error.
pub fn resolve_config_file(dirs: &[PathBuf], override_name: Option<&str>) -> Result<Option<PathBuf>> {
    if let Some(value) = override_name.map(str::trim).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(value);
        if path.is_absolute() || path.components().count() > 1 {
            if path.is_file() {
                return Ok(Some(path));
            }
            return Err(ProfilerError::Configuration(format!(
                "config file {} does not exist",
                path.display()
            )));
        }

        return match search_dirs(dirs, value) {
            Some(found) => Ok(Some(found)),
            None => Err(ProfilerError::Configuration(format!(
                "config '{}' not found in {:?}",
                value, dirs
            ))),
        };
    }

    Ok(search_dirs(dirs, DEFAULT_CONFIG_NAME))
}

fn search_dirs(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    for dir in dirs {
        let exact = dir.join(name);
        if exact.is_file() {
            return Some(exact);
        }
        for ext in CONFIG_EXTENSIONS {
            let candidate = dir.join(format!("{}.{}", name, ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Watches the config file and emits a payload-free notification on change
pub struct ConfigWatcher {
    path: PathBuf,
}

/// Stops watching when dropped
pub struct ConfigWatcherHandle {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Start watching. Bursts of filesystem events collapse into a single
    /// pending notification.
    pub fn start(self) -> Result<(ConfigWatcherHandle, mpsc::Receiver<()>)> {
        let (tx, rx) = mpsc::channel(1);

        let target = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                ProfilerError::Configuration(format!(
                    "config path {} has no file name",
                    self.path.display()
                ))
            })?;

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(target.as_os_str()));
                    if relevant {
                        // A full channel already holds a pending notification
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => warn!(error = %e, "Config watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| ProfilerError::Configuration(format!("failed to create config watcher: {}", e)))?;

        // Editors often replace the file, so watch the directory holding it
        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ProfilerError::Configuration(format!(
                    "failed to watch {}: {}",
                    watch_dir.display(),
                    e
                ))
            })?;

        info!(path = %self.path.display(), "Watching configuration file");
        debug!(dir = %watch_dir.display(), "Config watcher attached");

        Ok((ConfigWatcherHandle { _watcher: watcher }, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ProfilerConfig::default();
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.results_path, PathBuf::from("./results"));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.not_found_backoff(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blank_namespace_rejected() {
        let config = ProfilerConfig {
            namespace: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProfilerError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = ProfilerConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiler.yaml");
        std::fs::write(
            &path,
            "pod_labels:\n  - svc-a\n  - svc-b\nresults_path: /tmp/out\nhttp_port: 9000\nplatform: coreweave\n",
        )
        .unwrap();

        let provider = FileConfigProvider::new("team-x", Some(path));
        let config = provider.load().unwrap();

        assert_eq!(config.namespace, "team-x");
        assert_eq!(config.pod_labels, vec!["svc-a", "svc-b"]);
        assert_eq!(config.results_path, PathBuf::from("/tmp/out"));
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.platform, Platform::CoreWeave);
        assert_eq!(config.poll_interval_secs, 10);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let provider = FileConfigProvider::new("team-x", None);
        let config = provider.load().unwrap();

        assert_eq!(config.namespace, "team-x");
        assert_eq!(config.results_path, PathBuf::from("./results"));
    }

    #[test]
    fn test_load_rejects_blank_namespace() {
        let provider = FileConfigProvider::new("", None);
        assert!(matches!(
            provider.load(),
            Err(ProfilerError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_default_name_in_dirs() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(second.path().join("profiler.toml"), "http_port = 8001\n").unwrap();

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let found = resolve_config_file(&dirs, None).unwrap();

        assert_eq!(found, Some(second.path().join("profiler.toml")));
    }

    #[test]
    fn test_resolve_missing_default_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        assert_eq!(resolve_config_file(&dirs, None).unwrap(), None);
    }

    #[test]
    fn test_resolve_override_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("staging.yaml"), "http_port: 8002\n").unwrap();

        let dirs = vec![dir.path().to_path_buf()];
        let found = resolve_config_file(&dirs, Some("staging")).unwrap();
        assert_eq!(found, Some(dir.path().join("staging.yaml")));

        assert!(resolve_config_file(&dirs, Some("missing")).is_err());
    }

    #[test]
    fn test_resolve_override_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.json");
        std::fs::write(&path, "{\"http_port\": 8003}").unwrap();

        let found = resolve_config_file(&[], Some(path.to_str().unwrap())).unwrap();
        assert_eq!(found, Some(path));

        let missing = dir.path().join("nope.yaml");
        assert!(resolve_config_file(&[], Some(missing.to_str().unwrap())).is_err());
    }

    #[tokio::test]
    async fn test_watcher_notifies_on_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiler.yaml");
        std::fs::write(&path, "http_port: 8000\n").unwrap();

        let (_handle, mut rx) = ConfigWatcher::new(&path).start().unwrap();

        std::fs::write(&path, "http_port: 8001\n").unwrap();

        let notified = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(notified, Ok(Some(()))));
    }
}
