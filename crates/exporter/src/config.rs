//! Exporter configuration
//!
//! Sources, lowest precedence first: built-in defaults (`NODE_NAME` and
//! `PORT` from the environment), an optional config file, `EXPORTER_*`
//! environment variables, command-line flags.

use anyhow::{ensure, Context, Result};
use clap::Parser;
use exporter_lib::api::DEFAULT_PORT;
use exporter_lib::device::DEFAULT_DEVICE_TIMEOUT;
use exporter_lib::kubepods::pod::{
    RESOURCE_GPU_CORE, RESOURCE_GPU_MEMORY, RESOURCE_GPU_PERCENT, RESOURCE_NVIDIA_GPU,
};
use exporter_lib::kubepods::GpuResourceNames;
use exporter_lib::ptree::CGROUP_BASE;
use exporter_lib::ExporterSettings;
use serde::Deserialize;
use std::time::Duration;

/// GPU exporter
#[derive(Debug, Default, Parser)]
#[command(name = "gpu-exporter")]
#[command(author, version, about = "Attributes GPU usage to pods and containers", long_about = None)]
pub struct Cli {
    /// Name of this node, used for the pod field selector and the `node` label
    #[arg(long)]
    pub node: Option<String>,

    /// Comma separated resource names that mark a pod as using GPUs
    #[arg(long)]
    pub labels: Option<String>,

    /// Scan and measurement interval in seconds
    #[arg(long)]
    pub interval: Option<u64>,

    /// Root of the memory cgroup hierarchy
    #[arg(long)]
    pub cgroup_root: Option<String>,

    /// Port of the metrics and health endpoints
    #[arg(long)]
    pub port: Option<u16>,

    /// Optional config file (toml, yaml or json)
    #[arg(long, short)]
    pub config: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    pub node_name: String,
    pub labels: String,
    pub interval_secs: u64,
    pub cgroup_root: String,
    pub port: u16,
    pub device_timeout_secs: u64,
    pub core_resource: String,
    pub memory_resource: String,
    pub percent_resource: String,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn default_labels() -> String {
    [
        RESOURCE_NVIDIA_GPU,
        RESOURCE_GPU_CORE,
        RESOURCE_GPU_MEMORY,
        RESOURCE_GPU_PERCENT,
    ]
    .join(",")
}

impl ExporterConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("node_name", default_node_name())?
            .set_default("labels", default_labels())?
            .set_default("interval_secs", 30)?
            .set_default("cgroup_root", CGROUP_BASE)?
            .set_default("port", default_port() as i64)?
            .set_default("device_timeout_secs", DEFAULT_DEVICE_TIMEOUT.as_secs() as i64)?
            .set_default("core_resource", RESOURCE_GPU_CORE)?
            .set_default("memory_resource", RESOURCE_GPU_MEMORY)?
            .set_default("percent_resource", RESOURCE_GPU_PERCENT)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: ExporterConfig = builder
            .add_source(config::Environment::with_prefix("EXPORTER"))
            .set_override_option("node_name", cli.node.clone())?
            .set_override_option("labels", cli.labels.clone())?
            .set_override_option("interval_secs", cli.interval.map(|v| v as i64))?
            .set_override_option("cgroup_root", cli.cgroup_root.clone())?
            .set_override_option("port", cli.port.map(|v| v as i64))?
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.node_name.is_empty(), "node name must not be empty");
        ensure!(self.interval_secs > 0, "interval must be at least one second");
        ensure!(
            self.device_timeout_secs > 0,
            "device timeout must be at least one second"
        );
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn resource_names(&self) -> GpuResourceNames {
        GpuResourceNames {
            core: self.core_resource.clone(),
            memory: self.memory_resource.clone(),
            percent: self.percent_resource.clone(),
            ..GpuResourceNames::default()
        }
        .with_labels(&self.labels)
    }

    pub fn exporter_settings(&self) -> ExporterSettings {
        ExporterSettings {
            node: self.node_name.clone(),
            names: self.resource_names(),
            interval: self.interval(),
            device_timeout: self.device_timeout(),
        }
    }
}
