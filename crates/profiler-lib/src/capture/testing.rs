//! In-memory collaborators for capture and orchestrator tests

use super::{async_trait, SampleSource, TargetResolver};
use crate::error::{ProfilerError, Result};
use crate::models::{ContainerUsage, ProcessId, Snapshot};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Resolver backed by a mutable selector -> pods table
#[derive(Default)]
pub struct StaticResolver {
    targets: Mutex<HashMap<String, Vec<ProcessId>>>,
    unavailable: Mutex<bool>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, selector: &str, pods: &[&str]) -> Self {
        self.set(selector, pods);
        self
    }

    pub fn set(&self, selector: &str, pods: &[&str]) {
        self.targets.lock().unwrap().insert(
            selector.to_string(),
            pods.iter().map(|p| ProcessId::new(*p)).collect(),
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn list(&self, selector: &str) -> Result<Vec<ProcessId>> {
        if *self.unavailable.lock().unwrap() {
            return Err(ProfilerError::discovery(selector, "resolver unavailable"));
        }
        Ok(self
            .targets
            .lock()
            .unwrap()
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Snapshot(Snapshot),
    NotFound,
    Fail(String),
}

/// Source that replays a script per process; the last step repeats forever
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<ProcessId, VecDeque<Step>>>,
    last: Mutex<HashMap<ProcessId, Step>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, process: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(ProcessId::new(process), steps.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SampleSource for ScriptedSource {
    async fn fetch(&self, process: &ProcessId) -> Result<Snapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(process)
            .and_then(|steps| steps.pop_front());

        let step = {
            let mut last = self.last.lock().unwrap();
            match next {
                Some(step) => {
                    last.insert(process.clone(), step.clone());
                    step
                }
                None => last.get(process).cloned().unwrap_or(Step::NotFound),
            }
        };

        match step {
            Step::Snapshot(snapshot) => Ok(snapshot),
            Step::NotFound => Err(ProfilerError::NotFound(process.clone())),
            Step::Fail(message) => Err(ProfilerError::source(process, message)),
        }
    }
}

/// Source that keeps returning the reading at the current clock value
/// until the test moves the clock
pub struct ClockSource {
    secs: AtomicU32,
}

impl ClockSource {
    pub fn at(secs: u32) -> Self {
        Self {
            secs: AtomicU32::new(secs),
        }
    }

    pub fn set(&self, secs: u32) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

#[async_trait]
impl SampleSource for ClockSource {
    async fn fetch(&self, _process: &ProcessId) -> Result<Snapshot> {
        let secs = self.secs.load(Ordering::SeqCst);
        Ok(snapshot(secs, &[("app", 1, 1)]))
    }
}

/// Snapshot at `secs` past 2024-03-01T00:00:00Z
pub fn snapshot(secs: u32, containers: &[(&str, i64, i64)]) -> Snapshot {
    Snapshot {
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(i64::from(secs)),
        containers: containers
            .iter()
            .map(|(name, cpu, mem)| ContainerUsage::new(*name, *cpu, *mem))
            .collect(),
    }
}
