//! Core data models for the pod profiler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-assigned identifier of one schedulable unit (a pod)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of this process's log inside the results directory
    pub fn log_file_name(&self) -> String {
        format!("{}.csv", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Resource usage of one container at one instant
///
/// Absent resources are reported as zero rather than missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu_milli: i64,
    pub memory_bytes: i64,
}

impl ContainerUsage {
    pub fn new(name: impl Into<String>, cpu_milli: i64, memory_bytes: i64) -> Self {
        Self {
            name: name.into(),
            cpu_milli: cpu_milli.max(0),
            memory_bytes: memory_bytes.max(0),
        }
    }
}

/// Point-in-time resource reading for a process, as returned by a sample source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub containers: Vec<ContainerUsage>,
}

/// One container row of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub container_name: String,
    pub cpu_milli: i64,
    pub memory_bytes: i64,
}

/// One accepted poll result for one process, fanned out per container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub process: ProcessId,
    pub samples: Vec<Sample>,
}

impl Record {
    /// Build a record from a snapshot observed for `process`
    pub fn from_snapshot(process: ProcessId, snapshot: Snapshot) -> Self {
        let timestamp = snapshot.timestamp;
        let samples = snapshot
            .containers
            .into_iter()
            .map(|c| Sample {
                timestamp,
                container_name: c.name,
                cpu_milli: c.cpu_milli,
                memory_bytes: c.memory_bytes,
            })
            .collect();

        Self {
            timestamp,
            process,
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_from_snapshot_fans_out_per_container() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let snapshot = Snapshot {
            timestamp: ts,
            containers: vec![
                ContainerUsage::new("app", 150, 2048),
                ContainerUsage::new("sidecar", 5, 1024),
            ],
        };

        let record = Record::from_snapshot(ProcessId::new("pod-1"), snapshot);

        assert_eq!(record.process.as_str(), "pod-1");
        assert_eq!(record.samples.len(), 2);
        assert!(record.samples.iter().all(|s| s.timestamp == ts));
        assert_eq!(record.samples[1].container_name, "sidecar");
        assert_eq!(record.samples[1].memory_bytes, 1024);
    }

    #[test]
    fn test_container_usage_clamps_negative_values() {
        let usage = ContainerUsage::new("app", -1, -20);
        assert_eq!(usage.cpu_milli, 0);
        assert_eq!(usage.memory_bytes, 0);
    }

    #[test]
    fn test_process_log_file_name() {
        assert_eq!(ProcessId::new("web-7d9f-abcde").log_file_name(), "web-7d9f-abcde.csv");
    }
}
