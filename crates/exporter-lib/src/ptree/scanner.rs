//! cgroup scanner for pod topology
//!
//! Walks the memory controller hierarchy of a single pod:
//! - `kubepods[/<qos>]/pod<uid>` is the pod directory
//! - every 64 character hex sub-directory is a container
//! - each container's `cgroup.procs` lists its live pids

use crate::models::{Pod, QosClass};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Default mount point of the host memory controller inside the exporter pod
pub const CGROUP_BASE: &str = "/host/sys/fs/cgroup/memory";

const KUBE_ROOT: &str = "kubepods";
const POD_PREFIX: &str = "pod";
const CGROUP_PROCS: &str = "cgroup.procs";

/// Failure while reading a pod's cgroup directory
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to list {}: {source}", .path.display())]
    ListDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {}: {source}", .path.display())]
    ReadProcs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Returns true if `id` looks like a runtime container id
pub fn is_container_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Source of pod topology
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scan one pod. `Ok(None)` means the pod has no cgroup directory yet.
    async fn scan(&self, uid: &str, qos: QosClass) -> Result<Option<Pod>, ScanError>;
}

/// Scanner reading the cgroup v1 memory hierarchy
#[derive(Debug, Clone)]
pub struct CgroupScanner {
    cgroup_base: PathBuf,
}

impl Default for CgroupScanner {
    fn default() -> Self {
        Self::new(CGROUP_BASE)
    }
}

impl CgroupScanner {
    pub fn new(cgroup_base: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_base: cgroup_base.into(),
        }
    }

    pub fn cgroup_base(&self) -> &Path {
        &self.cgroup_base
    }

    /// Relative pod path, e.g. `kubepods/besteffort/pod17eb80b0-6085-4d12-8e79-553e799d2f0b`
    pub fn pod_path(uid: &str, qos: QosClass) -> PathBuf {
        let mut path = PathBuf::from(KUBE_ROOT);
        match qos {
            QosClass::Guaranteed => {}
            QosClass::Burstable | QosClass::BestEffort => path.push(qos.as_str()),
        }
        path.push(format!("{}{}", POD_PREFIX, uid));
        path
    }

    /// Parse the contents of a `cgroup.procs` file, skipping lines that are not pids
    pub fn parse_procs(content: &str) -> Vec<u32> {
        content
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect()
    }

    async fn read_pids(path: &Path) -> Result<Option<Vec<u32>>, ScanError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(Self::parse_procs(&content))),
            // The container exited between listing and reading
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ScanError::ReadProcs {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// A container entry that vanished since the listing is skipped; any
    /// other failure to stat it fails the scan
    fn is_container_dir(is_dir: io::Result<bool>) -> io::Result<bool> {
        match is_dir {
            Ok(is_dir) => Ok(is_dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_containers(pod_dir: &Path) -> Result<Vec<String>, ScanError> {
        let list_err = |source: io::Error| ScanError::ListDir {
            path: pod_dir.to_path_buf(),
            source,
        };

        let mut entries = fs::read_dir(pod_dir).await.map_err(list_err)?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_container_id(&name) {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir());
            if Self::is_container_dir(is_dir).map_err(list_err)? {
                ids.push(name);
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl Scanner for CgroupScanner {
    async fn scan(&self, uid: &str, qos: QosClass) -> Result<Option<Pod>, ScanError> {
        let pod_dir = self.cgroup_base.join(Self::pod_path(uid, qos));

        match fs::metadata(&pod_dir).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(pod_uid = %uid, path = %pod_dir.display(), "Pod cgroup not present yet");
                return Ok(None);
            }
            Err(source) => {
                return Err(ScanError::ListDir {
                    path: pod_dir,
                    source,
                })
            }
        }

        // Built off to the side so a failed read never leaks a partial subtree
        let mut pod = Pod::new(uid, qos);

        for container_id in Self::list_containers(&pod_dir).await? {
            let procs_path = pod_dir.join(&container_id).join(CGROUP_PROCS);
            let Some(pids) = Self::read_pids(&procs_path).await? else {
                debug!(pod_uid = %uid, container_id = %container_id, "Container vanished during scan");
                continue;
            };

            let container = pod.add_container(container_id);
            for pid in pids {
                container.add_process(pid);
            }
        }

        debug!(
            pod_uid = %uid,
            containers = pod.containers.len(),
            processes = pod.process_count(),
            "Scanned pod cgroup"
        );

        Ok(Some(pod))
    }
}
