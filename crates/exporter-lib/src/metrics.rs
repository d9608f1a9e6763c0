//! GPU usage metrics published per card, pod and container

use anyhow::Result;
use prometheus::{GaugeVec, Opts, Registry};
use serde::Serialize;

const CARD_LABELS: &[&str] = &["node", "card"];
const POD_LABELS: &[&str] = &["node", "namespace", "pod"];
const CONTAINER_LABELS: &[&str] = &["node", "namespace", "pod", "container"];

/// Values published for one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CardValues {
    /// Core share attributed to known processes
    pub core: f64,
    /// Memory used on the device, MiB
    pub mem: f64,
    pub core_util: f64,
    pub mem_util: f64,
}

/// Values published for one pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PodValues {
    pub core: f64,
    pub mem: f64,
    pub core_util: f64,
    pub mem_util: f64,
    pub mem_request: f64,
    pub core_occupy_node: f64,
    pub mem_occupy_node: f64,
}

/// Values published for one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ContainerValues {
    pub core: f64,
    pub mem: f64,
    pub core_util: f64,
    pub mem_util: f64,
}

/// Destination for computed usage series
///
/// `delete_*` retracts every series for the label tuple; retracting a tuple
/// that was never published is a no-op.
pub trait MetricsSink: Send + Sync {
    fn card(&self, node: &str, card: &str, values: &CardValues);
    fn pod(&self, node: &str, namespace: &str, pod: &str, values: &PodValues);
    fn container(
        &self,
        node: &str,
        namespace: &str,
        pod: &str,
        container: &str,
        values: &ContainerValues,
    );
    fn delete_pod(&self, node: &str, namespace: &str, pod: &str);
    fn delete_container(&self, node: &str, namespace: &str, pod: &str, container: &str);
}

/// Prometheus gauges for GPU usage
#[derive(Clone)]
pub struct GpuMetrics {
    gpu_core: GaugeVec,
    gpu_core_util: GaugeVec,
    gpu_mem: GaugeVec,
    gpu_mem_util: GaugeVec,
    pod_core: GaugeVec,
    pod_core_util: GaugeVec,
    pod_core_occupy_node: GaugeVec,
    pod_mem: GaugeVec,
    pod_mem_util: GaugeVec,
    pod_mem_occupy_node: GaugeVec,
    pod_mem_request: GaugeVec,
    container_core: GaugeVec,
    container_core_util: GaugeVec,
    container_mem: GaugeVec,
    container_mem_util: GaugeVec,
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl GpuMetrics {
    /// Create the gauges and register them with `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        Ok(Self {
            gpu_core: gauge(registry, "gpu_core_usage", "Usage of gpu core per card", CARD_LABELS)?,
            gpu_core_util: gauge(
                registry,
                "gpu_core_utilization_percentage",
                "Utilization of gpu core per card",
                CARD_LABELS,
            )?,
            gpu_mem: gauge(registry, "gpu_mem_usage", "Usage of gpu memory per card", CARD_LABELS)?,
            gpu_mem_util: gauge(
                registry,
                "gpu_mem_utilization_percentage",
                "Utilization of gpu memory per card",
                CARD_LABELS,
            )?,
            pod_core: gauge(registry, "pod_core_usage", "Usage of gpu core per pod", POD_LABELS)?,
            pod_core_util: gauge(
                registry,
                "pod_core_utilization_percentage",
                "Utilization of gpu core",
                POD_LABELS,
            )?,
            pod_core_occupy_node: gauge(
                registry,
                "pod_core_occupy_node_percentage",
                "Utilization of pod core occupied the node",
                POD_LABELS,
            )?,
            pod_mem: gauge(registry, "pod_mem_usage", "Usage of gpu memory per pod", POD_LABELS)?,
            pod_mem_util: gauge(
                registry,
                "pod_mem_utilization_percentage",
                "Utilization of pod memory",
                POD_LABELS,
            )?,
            pod_mem_occupy_node: gauge(
                registry,
                "pod_mem_occupy_node_percentage",
                "Utilization of pod memory occupied the node",
                POD_LABELS,
            )?,
            pod_mem_request: gauge(registry, "pod_mem_request", "Request of pod memory", POD_LABELS)?,
            container_core: gauge(
                registry,
                "container_core_usage",
                "Usage of gpu computing per container",
                CONTAINER_LABELS,
            )?,
            container_core_util: gauge(
                registry,
                "container_core_utilization_percentage",
                "Utilization of container core",
                CONTAINER_LABELS,
            )?,
            container_mem: gauge(
                registry,
                "container_mem_usage",
                "Usage of gpu memory per container",
                CONTAINER_LABELS,
            )?,
            container_mem_util: gauge(
                registry,
                "container_mem_utilization_percentage",
                "Utilization of container memory",
                CONTAINER_LABELS,
            )?,
        })
    }

    fn pod_gauges(&self) -> [&GaugeVec; 7] {
        [
            &self.pod_core,
            &self.pod_mem,
            &self.pod_mem_request,
            &self.pod_mem_util,
            &self.pod_core_util,
            &self.pod_mem_occupy_node,
            &self.pod_core_occupy_node,
        ]
    }

    fn container_gauges(&self) -> [&GaugeVec; 4] {
        [
            &self.container_core,
            &self.container_mem,
            &self.container_core_util,
            &self.container_mem_util,
        ]
    }
}

impl MetricsSink for GpuMetrics {
    fn card(&self, node: &str, card: &str, values: &CardValues) {
        let labels = [node, card];
        self.gpu_core.with_label_values(&labels).set(values.core);
        self.gpu_mem.with_label_values(&labels).set(values.mem);
        self.gpu_core_util.with_label_values(&labels).set(values.core_util);
        self.gpu_mem_util.with_label_values(&labels).set(values.mem_util);
    }

    fn pod(&self, node: &str, namespace: &str, pod: &str, values: &PodValues) {
        let labels = [node, namespace, pod];
        self.pod_core.with_label_values(&labels).set(values.core);
        self.pod_mem.with_label_values(&labels).set(values.mem);
        self.pod_mem_request.with_label_values(&labels).set(values.mem_request);
        self.pod_mem_util.with_label_values(&labels).set(values.mem_util);
        self.pod_core_util.with_label_values(&labels).set(values.core_util);
        self.pod_mem_occupy_node
            .with_label_values(&labels)
            .set(values.mem_occupy_node);
        self.pod_core_occupy_node
            .with_label_values(&labels)
            .set(values.core_occupy_node);
    }

    fn container(
        &self,
        node: &str,
        namespace: &str,
        pod: &str,
        container: &str,
        values: &ContainerValues,
    ) {
        let labels = [node, namespace, pod, container];
        self.container_core.with_label_values(&labels).set(values.core);
        self.container_mem.with_label_values(&labels).set(values.mem);
        self.container_core_util
            .with_label_values(&labels)
            .set(values.core_util);
        self.container_mem_util
            .with_label_values(&labels)
            .set(values.mem_util);
    }

    fn delete_pod(&self, node: &str, namespace: &str, pod: &str) {
        let labels = [node, namespace, pod];
        for gauge in self.pod_gauges() {
            // Absent series are fine: the pod may never have been published
            let _ = gauge.remove_label_values(&labels);
        }
    }

    fn delete_container(&self, node: &str, namespace: &str, pod: &str, container: &str) {
        let labels = [node, namespace, pod, container];
        for gauge in self.container_gauges() {
            let _ = gauge.remove_label_values(&labels);
        }
    }
}
