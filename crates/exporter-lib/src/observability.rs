//! Self-observation for the exporter
//!
//! Provides:
//! - Prometheus self-metrics (scan and cycle latency, pods tracked, error counts)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for sweep and cycle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<Option<ExporterMetricsInner>> = OnceLock::new();

struct ExporterMetricsInner {
    scan_latency_seconds: Histogram,
    cycle_latency_seconds: Histogram,
    pods_tracked: IntGauge,
    devices: IntGauge,
    scan_errors: IntCounter,
    device_errors: IntCounter,
}

fn registered<C: Collector + Clone + 'static>(metric: C) -> prometheus::Result<C> {
    prometheus::register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram(name: &str, help: &str) -> prometheus::Result<Histogram> {
    let opts = HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec());
    registered(Histogram::with_opts(opts)?)
}

impl ExporterMetricsInner {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            scan_latency_seconds: histogram(
                "gpu_exporter_scan_latency_seconds",
                "Time spent sweeping the cgroup hierarchy for interested pods",
            )?,
            cycle_latency_seconds: histogram(
                "gpu_exporter_cycle_latency_seconds",
                "Time spent reading devices and publishing usage for one cycle",
            )?,
            pods_tracked: registered(IntGauge::new(
                "gpu_exporter_pods_tracked",
                "Number of pods registered for process tree scanning",
            )?)?,
            devices: registered(IntGauge::new(
                "gpu_exporter_devices",
                "Number of GPU devices reported by the driver",
            )?)?,
            scan_errors: registered(IntCounter::new(
                "gpu_exporter_scan_errors_total",
                "Total number of failed pod scans",
            )?)?,
            device_errors: registered(IntCounter::new(
                "gpu_exporter_device_errors_total",
                "Total number of devices skipped because they could not be read",
            )?)?,
        })
    }

    fn init() -> Option<Self> {
        Self::new()
            .map_err(|e| warn!(error = %e, "Exporter self-metrics disabled"))
            .ok()
    }
}

/// Handle to the exporter's self-metrics
///
/// Clones share one process-wide set of metrics. If registration failed the
/// handle records nothing.
#[derive(Clone)]
pub struct ExporterMetrics {
    inner: Option<&'static ExporterMetricsInner>,
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(ExporterMetricsInner::init).as_ref(),
        }
    }

    pub fn observe_scan_latency(&self, duration_secs: f64) {
        if let Some(inner) = self.inner {
            inner.scan_latency_seconds.observe(duration_secs);
        }
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        if let Some(inner) = self.inner {
            inner.cycle_latency_seconds.observe(duration_secs);
        }
    }

    pub fn set_pods_tracked(&self, count: i64) {
        if let Some(inner) = self.inner {
            inner.pods_tracked.set(count);
        }
    }

    pub fn set_devices(&self, count: i64) {
        if let Some(inner) = self.inner {
            inner.devices.set(count);
        }
    }

    pub fn inc_scan_errors(&self) {
        if let Some(inner) = self.inner {
            inner.scan_errors.inc();
        }
    }

    pub fn inc_device_errors(&self, count: u64) {
        if let Some(inner) = self.inner {
            inner.device_errors.inc_by(count);
        }
    }
}

/// Structured logger for exporter lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, interval_secs: u64, resources: &[String]) {
        info!(
            event = "exporter_started",
            node = %self.node_name,
            exporter_version = %version,
            interval_secs = interval_secs,
            resources = ?resources,
            "GPU exporter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            node = %self.node_name,
            reason = %reason,
            "GPU exporter shutting down"
        );
    }

    /// A pod was registered for process tree scanning
    pub fn log_pod_interest(&self, pod_uid: &str, namespace: &str, pod_name: &str, qos: &str) {
        info!(
            event = "pod_interest",
            node = %self.node_name,
            pod_uid = %pod_uid,
            namespace = %namespace,
            pod_name = %pod_name,
            qos = %qos,
            "Watching GPU pod"
        );
    }

    pub fn log_pod_forgotten(&self, pod_uid: &str, namespace: &str, containers: usize) {
        info!(
            event = "pod_forgotten",
            node = %self.node_name,
            pod_uid = %pod_uid,
            namespace = %namespace,
            containers_retracted = containers,
            "Stopped watching GPU pod"
        );
    }

    pub fn log_cycle_complete(
        &self,
        devices: usize,
        device_failures: usize,
        pods: usize,
        containers: usize,
        duration_ms: u64,
    ) {
        if device_failures > 0 {
            warn!(
                event = "cycle_complete",
                node = %self.node_name,
                devices = devices,
                device_failures = device_failures,
                pods = pods,
                containers = containers,
                duration_ms = duration_ms,
                "Export cycle completed with unreadable devices"
            );
        } else {
            info!(
                event = "cycle_complete",
                node = %self.node_name,
                devices = devices,
                pods = pods,
                containers = containers,
                duration_ms = duration_ms,
                "Export cycle completed"
            );
        }
    }
}
