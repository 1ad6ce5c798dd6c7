//! Kubernetes-backed target resolver and sample source

use super::quantity::{cpu_millis, memory_bytes};
use super::{async_trait, SampleSource, TargetResolver};
use crate::error::{ProfilerError, Result};
use crate::models::{ContainerUsage, ProcessId, Snapshot};
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::settings::KUBERNETES_NAME_LABEL;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Resolves workload selectors to pod names within one namespace
pub struct KubeTargetResolver {
    client: Client,
    namespace: String,
    label_key: String,
    retry: RetryPolicy,
}

impl KubeTargetResolver {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            label_key: KUBERNETES_NAME_LABEL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Match pods on a label other than `app.kubernetes.io/name`
    pub fn with_label_key(mut self, label_key: impl Into<String>) -> Self {
        self.label_key = label_key.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub fn label_selector(label_key: &str, selector: &str) -> String {
    format!("{}={}", label_key, selector)
}

/// API statuses worth another attempt
fn is_retryable(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(resp) if matches!(resp.code, 409 | 429 | 500 | 503))
}

#[async_trait]
impl TargetResolver for KubeTargetResolver {
    async fn list(&self, selector: &str) -> Result<Vec<ProcessId>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&label_selector(&self.label_key, selector));

        let list = retry_on_conflict(
            &self.retry,
            || pods.list(&params),
            is_retryable,
            || async { Ok(()) },
        )
        .await
        .map_err(|e| ProfilerError::discovery(selector, e))?;

        let mut processes: Vec<ProcessId> = list
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .map(ProcessId::new)
            .collect();
        processes.sort();
        processes.dedup();

        debug!(
            selector = %selector,
            namespace = %self.namespace,
            pods = processes.len(),
            "Resolved workload pods"
        );

        Ok(processes)
    }
}

/// Reads pod usage from the `metrics.k8s.io/v1beta1` API
pub struct MetricsServerSource {
    api: Api<DynamicObject>,
}

impl MetricsServerSource {
    pub fn new(client: Client, namespace: &str) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        Self {
            api: Api::namespaced_with(client, namespace, &resource),
        }
    }
}

#[async_trait]
impl SampleSource for MetricsServerSource {
    async fn fetch(&self, process: &ProcessId) -> Result<Snapshot> {
        match self.api.get(process.as_str()).await {
            Ok(object) => snapshot_from_metrics(process, object.data),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                Err(ProfilerError::NotFound(process.clone()))
            }
            Err(e) => Err(ProfilerError::source(process, e)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PodMetricsBody {
    timestamp: DateTime<Utc>,
    #[serde(default)]
    containers: Vec<ContainerMetricsBody>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetricsBody {
    name: String,
    #[serde(default)]
    usage: BTreeMap<String, String>,
}

/// Convert the body of a `PodMetrics` object into a snapshot
pub fn snapshot_from_metrics(process: &ProcessId, data: serde_json::Value) -> Result<Snapshot> {
    let body: PodMetricsBody =
        serde_json::from_value(data).map_err(|e| ProfilerError::source(process, e))?;

    let mut containers = Vec::with_capacity(body.containers.len());
    for container in body.containers {
        let cpu = match container.usage.get("cpu") {
            Some(q) => cpu_millis(q).map_err(|e| ProfilerError::source(process, e))?,
            None => 0,
        };
        let memory = match container.usage.get("memory") {
            Some(q) => memory_bytes(q).map_err(|e| ProfilerError::source(process, e))?,
            None => 0,
        };
        containers.push(ContainerUsage::new(container.name, cpu, memory));
    }

    Ok(Snapshot {
        timestamp: body.timestamp,
        containers,
    })
}
