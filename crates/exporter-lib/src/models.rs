//! Core data models for the GPU exporter
//!
//! The process tree is a plain arena: pods own containers, containers own
//! processes, and every child refers to its parent by identifier only.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Quality-of-service class assigned to a pod by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosClass {
    Guaranteed,
    Burstable,
    #[serde(rename = "besteffort")]
    BestEffort,
}

impl QosClass {
    /// Name of the cgroup directory segment for this class
    pub fn as_str(&self) -> &'static str {
        match self {
            QosClass::Guaranteed => "guaranteed",
            QosClass::Burstable => "burstable",
            QosClass::BestEffort => "besteffort",
        }
    }

    /// Parse the orchestrator's `status.qosClass` value
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "guaranteed" => Some(QosClass::Guaranteed),
            "burstable" => Some(QosClass::Burstable),
            "besteffort" => Some(QosClass::BestEffort),
            _ => None,
        }
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single OS process observed inside a container's cgroup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    /// Id of the owning container
    pub parent: String,
}

/// A container cgroup under a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// 64 character hex runtime id
    pub id: String,
    /// Uid of the owning pod
    pub parent: String,
    pub processes: HashMap<u32, Process>,
}

impl Container {
    pub fn new(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: parent.into(),
            processes: HashMap::new(),
        }
    }

    pub fn add_process(&mut self, pid: u32) {
        self.processes.insert(
            pid,
            Process {
                pid,
                parent: self.id.clone(),
            },
        );
    }

    /// Pids in ascending order
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.processes.keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

/// A pod and the containers found under its cgroup directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub qos: QosClass,
    pub containers: HashMap<String, Container>,
}

impl Pod {
    pub fn new(uid: impl Into<String>, qos: QosClass) -> Self {
        Self {
            uid: uid.into(),
            qos,
            containers: HashMap::new(),
        }
    }

    /// Insert an empty container owned by this pod and return it
    pub fn add_container(&mut self, id: impl Into<String>) -> &mut Container {
        let id = id.into();
        self.containers
            .entry(id.clone())
            .or_insert_with(|| Container::new(id, self.uid.clone()))
    }

    pub fn process_count(&self) -> usize {
        self.containers.values().map(|c| c.processes.len()).sum()
    }
}

/// Point-in-time view of every known pod on the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub pods: HashMap<String, Pod>,
}

impl Node {
    pub fn pod(&self, uid: &str) -> Option<&Pod> {
        self.pods.get(uid)
    }

    pub fn container_count(&self) -> usize {
        self.pods.values().map(|p| p.containers.len()).sum()
    }
}

/// Driver-reported usage of one process on one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    /// Share of the device's compute cores, 0-100
    pub gpu_core: f64,
    /// Device memory in MiB
    pub gpu_mem: f64,
}

/// Usage accumulated on a device over one measurement cycle
///
/// Only counts processes attributed to a container; the card's published
/// memory comes from the driver's own counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CardUsage {
    pub core: f64,
    pub mem: f64,
}

impl CardUsage {
    pub fn accumulate(&mut self, usage: &ProcessUsage) {
        self.core += usage.gpu_core;
        self.mem += usage.gpu_mem;
    }
}
