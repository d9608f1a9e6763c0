//! Helpers for reading GPU-relevant fields out of Kubernetes pod objects

use crate::models::QosClass;
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

pub const RESOURCE_NVIDIA_GPU: &str = "nvidia.com/gpu";
pub const RESOURCE_GPU_CORE: &str = "tke.cloud.tencent.com/qgpu-core";
pub const RESOURCE_GPU_MEMORY: &str = "tke.cloud.tencent.com/qgpu-memory";
pub const RESOURCE_GPU_PERCENT: &str = "nano-gpu/gpu-percent";

/// Names of the extended resources that carry GPU requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuResourceNames {
    /// Explicit core share, 100 per whole device
    pub core: String,
    /// Explicit device memory in GiB
    pub memory: String,
    /// Percentage of a whole device, covering both core and memory
    pub percent: String,
    /// Every resource name that marks a container as GPU-requesting
    pub labels: Vec<String>,
}

impl Default for GpuResourceNames {
    fn default() -> Self {
        Self {
            core: RESOURCE_GPU_CORE.to_string(),
            memory: RESOURCE_GPU_MEMORY.to_string(),
            percent: RESOURCE_GPU_PERCENT.to_string(),
            labels: vec![
                RESOURCE_NVIDIA_GPU.to_string(),
                RESOURCE_GPU_CORE.to_string(),
                RESOURCE_GPU_MEMORY.to_string(),
                RESOURCE_GPU_PERCENT.to_string(),
            ],
        }
    }
}

impl GpuResourceNames {
    /// Parse a comma separated label list, e.g. from the `--labels` flag
    pub fn with_labels(mut self, labels: &str) -> Self {
        let parsed: Vec<String> = labels
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if !parsed.is_empty() {
            self.labels = parsed;
        }
        self
    }
}

/// Declared GPU limits of one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuLimits {
    pub core: i64,
    pub memory_gib: i64,
    pub percent: i64,
}

impl GpuLimits {
    pub fn from_container(container: &Container, names: &GpuResourceNames) -> Self {
        Self {
            core: resource_limit(container, &names.core),
            memory_gib: resource_limit(container, &names.memory),
            percent: resource_limit(container, &names.percent),
        }
    }
}

pub fn pod_uid(pod: &Pod) -> Option<&str> {
    pod.metadata.uid.as_deref()
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

/// QoS class from `status.qosClass`; pods without one are treated as best effort
pub fn qos_class(pod: &Pod) -> QosClass {
    pod.status
        .as_ref()
        .and_then(|s| s.qos_class.as_deref())
        .and_then(QosClass::parse)
        .unwrap_or(QosClass::BestEffort)
}

/// True once the pod is being deleted or has reached a terminal phase
pub fn is_complete_pod(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// True if any container limits one of the given resource names
pub fn requests_gpu(pod: &Pod, labels: &[String]) -> bool {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers.iter().any(|c| {
                labels
                    .iter()
                    .any(|name| resource_limit(c, name) > 0)
            })
        })
        .unwrap_or(false)
}

/// Find a container spec by name
pub fn container_spec<'a>(pod: &'a Pod, name: &str) -> Option<&'a Container> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.containers.iter().find(|c| c.name == name))
}

/// `(container id, container name)` pairs from the pod status
pub fn container_statuses(pod: &Pod) -> Vec<(String, String)> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| {
                    let id = cs.container_id.as_deref()?;
                    let id = strip_runtime_prefix(id);
                    (!id.is_empty()).then(|| (id.to_string(), cs.name.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `docker://<id>`, `containerd://<id>` and `cri-o://<id>` all map to `<id>`
pub fn strip_runtime_prefix(id: &str) -> &str {
    match id.split_once("://") {
        Some((_, bare)) => bare,
        None => id,
    }
}

/// Integer value of a resource limit, rounded up; missing or unparseable is 0
pub fn resource_limit(container: &Container, name: &str) -> i64 {
    container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|limits| limits.get(name))
        .and_then(parse_quantity)
        .map(|v| v.ceil() as i64)
        .unwrap_or(0)
}

/// Parse a Kubernetes quantity string
pub fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let s = quantity.0.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    // Exponent notation such as 1e3 has no unit suffix
    if suffix.starts_with(|c| c == 'e' || c == 'E') {
        return s.parse().ok();
    }

    let value: f64 = number.parse().ok()?;
    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * multiplier)
}

#[cfg(test)]
pub(crate) mod test_pods {
    use k8s_openapi::api::core::v1::{
        Container, ContainerStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    /// Container spec with the given resource limits
    pub fn container(name: &str, limits: &[(&str, &str)]) -> Container {
        let limits: BTreeMap<String, Quantity> = limits
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect();
        Container {
            name: name.to_string(),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn status(name: &str, container_id: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            container_id: Some(format!("docker://{}", container_id)),
            ..Default::default()
        }
    }

    pub fn pod(
        uid: &str,
        namespace: &str,
        qos: &str,
        containers: Vec<Container>,
        statuses: Vec<ContainerStatus>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                name: Some(format!("pod-{}", uid)),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: Some(PodStatus {
                qos_class: Some(qos.to_string()),
                phase: Some("Running".to_string()),
                container_statuses: Some(statuses),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_pods::*;
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn test_qos_class_from_status() {
        let p = pod("u1", "default", "Guaranteed", vec![], vec![]);
        assert_eq!(qos_class(&p), QosClass::Guaranteed);

        let mut p = pod("u1", "default", "Burstable", vec![], vec![]);
        assert_eq!(qos_class(&p), QosClass::Burstable);

        p.status = None;
        assert_eq!(qos_class(&p), QosClass::BestEffort);
    }

    #[test]
    fn test_is_complete_pod() {
        let mut p = pod("u1", "default", "BestEffort", vec![], vec![]);
        assert!(!is_complete_pod(&p));

        p.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        assert!(is_complete_pod(&p));

        p.status.as_mut().unwrap().phase = Some("Failed".to_string());
        assert!(is_complete_pod(&p));

        let mut p = pod("u2", "default", "BestEffort", vec![], vec![]);
        p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(is_complete_pod(&p));
    }

    #[test]
    fn test_gpu_limits() {
        let names = GpuResourceNames::default();
        let c = container("app", &[(RESOURCE_GPU_CORE, "30"), (RESOURCE_GPU_MEMORY, "2")]);
        let limits = GpuLimits::from_container(&c, &names);
        assert_eq!(limits.core, 30);
        assert_eq!(limits.memory_gib, 2);
        assert_eq!(limits.percent, 0);

        let c = container("app", &[(RESOURCE_GPU_PERCENT, "50")]);
        assert_eq!(GpuLimits::from_container(&c, &names).percent, 50);

        let c = container("app", &[]);
        assert_eq!(GpuLimits::from_container(&c, &names), GpuLimits::default());
    }

    #[test]
    fn test_requests_gpu() {
        let labels = GpuResourceNames::default().labels;
        let gpu = pod(
            "u1",
            "default",
            "BestEffort",
            vec![container("app", &[(RESOURCE_NVIDIA_GPU, "1")])],
            vec![],
        );
        let plain = pod(
            "u2",
            "default",
            "BestEffort",
            vec![container("app", &[("cpu", "2")])],
            vec![],
        );
        assert!(requests_gpu(&gpu, &labels));
        assert!(!requests_gpu(&plain, &labels));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&Quantity("50".into())), Some(50.0));
        assert_eq!(parse_quantity(&Quantity("500m".into())), Some(0.5));
        assert_eq!(parse_quantity(&Quantity("2k".into())), Some(2000.0));
        assert_eq!(parse_quantity(&Quantity("1Ki".into())), Some(1024.0));
        assert_eq!(parse_quantity(&Quantity("1e3".into())), Some(1000.0));
        assert_eq!(parse_quantity(&Quantity("lots".into())), None);
    }

    #[test]
    fn test_strip_runtime_prefix() {
        assert_eq!(strip_runtime_prefix("docker://abc"), "abc");
        assert_eq!(strip_runtime_prefix("containerd://abc"), "abc");
        assert_eq!(strip_runtime_prefix("cri-o://abc"), "abc");
        assert_eq!(strip_runtime_prefix("abc"), "abc");
    }

    #[test]
    fn test_container_statuses_skip_missing_ids() {
        let mut missing = status("sidecar", "x");
        missing.container_id = None;
        let p = pod(
            "u1",
            "default",
            "BestEffort",
            vec![],
            vec![status("app", "abc"), missing],
        );
        assert_eq!(
            container_statuses(&p),
            vec![("abc".to_string(), "app".to_string())]
        );
    }

    #[test]
    fn test_with_labels() {
        let names = GpuResourceNames::default().with_labels("nvidia.com/gpu, nano-gpu/gpu-percent,");
        assert_eq!(names.labels, vec!["nvidia.com/gpu", "nano-gpu/gpu-percent"]);

        let names = GpuResourceNames::default().with_labels("");
        assert_eq!(names.labels.len(), 4);
    }
}
