//! Node agent attributing GPU usage to pods and containers
//!
//! This crate provides:
//! - Pod topology discovery from the cgroup filesystem
//! - Pod lifecycle tracking through the Kubernetes API
//! - GPU driver access with per-device isolation
//! - Per-cycle aggregation of usage into card, pod and container series
//! - Prometheus publishing, health checks and the HTTP surface

pub mod api;
pub mod device;
pub mod exporter;
pub mod health;
pub mod kubepods;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod ptree;

pub use exporter::{CycleSummary, Exporter, ExporterSettings};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use metrics::{GpuMetrics, MetricsSink};
pub use models::*;
pub use observability::{ExporterMetrics, StructuredLogger};
