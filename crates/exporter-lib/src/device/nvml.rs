//! NVML-backed driver binding

use super::{DeviceMemory, DriverError, GpuDriver};
use crate::models::ProcessUsage;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::info;

/// Driver binding over the NVIDIA management library
///
/// Initialization is retried lazily on every call until it succeeds, so the
/// exporter keeps running on nodes where the driver comes up late.
#[derive(Default)]
pub struct NvmlDriver {
    nvml: OnceLock<Nvml>,
    /// Newest utilization sample timestamp seen per device
    last_seen: Mutex<HashMap<u32, u64>>,
}

impl NvmlDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to initialize NVML right away
    pub fn init() -> Result<Self, DriverError> {
        let driver = Self::new();
        driver.nvml()?;
        Ok(driver)
    }

    fn nvml(&self) -> Result<&Nvml, DriverError> {
        if let Some(nvml) = self.nvml.get() {
            return Ok(nvml);
        }
        let nvml = Nvml::init().map_err(|e| DriverError::NotInitialized(e.to_string()))?;
        info!("NVML initialized");
        Ok(self.nvml.get_or_init(|| nvml))
    }

    fn device(&self, index: u32) -> Result<Device<'_>, DriverError> {
        self.nvml()?
            .device_by_index(index)
            .map_err(|e| device_error(index, e))
    }

    fn set_last_seen(&self, index: u32, timestamp: u64) {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, timestamp);
    }

    fn get_last_seen(&self, index: u32) -> u64 {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .copied()
            .unwrap_or(0)
    }
}

fn device_error(index: u32, error: NvmlError) -> DriverError {
    DriverError::Device {
        index,
        message: error.to_string(),
    }
}

impl GpuDriver for NvmlDriver {
    fn device_count(&self) -> Result<u32, DriverError> {
        self.nvml()?
            .device_count()
            .map_err(|e| DriverError::NotInitialized(e.to_string()))
    }

    fn memory_info(&self, index: u32) -> Result<DeviceMemory, DriverError> {
        let info = self
            .device(index)?
            .memory_info()
            .map_err(|e| device_error(index, e))?;
        Ok(DeviceMemory {
            total_bytes: info.total,
            used_bytes: info.used,
        })
    }

    fn utilization(&self, index: u32) -> Result<u32, DriverError> {
        let rates = self
            .device(index)?
            .utilization_rates()
            .map_err(|e| device_error(index, e))?;
        Ok(rates.gpu)
    }

    fn process_usage(&self, index: u32) -> Result<HashMap<u32, ProcessUsage>, DriverError> {
        let device = self.device(index)?;
        let mut usage: HashMap<u32, ProcessUsage> = HashMap::new();

        let processes = device
            .running_compute_processes()
            .map_err(|e| device_error(index, e))?;
        for process in processes {
            let mem = match process.used_gpu_memory {
                UsedGpuMemory::Used(bytes) => (bytes >> 20) as f64,
                UsedGpuMemory::Unavailable => 0.0,
            };
            usage.entry(process.pid).or_default().gpu_mem += mem;
        }

        // Keep the newest SM sample per pid since the previous cycle
        let since = self.get_last_seen(index);
        match device.process_utilization_stats(since) {
            Ok(samples) => {
                let mut newest: HashMap<u32, (u64, u32)> = HashMap::new();
                let mut max_timestamp = since;
                for sample in samples {
                    max_timestamp = max_timestamp.max(sample.timestamp);
                    let slot = newest.entry(sample.pid).or_insert((0, 0));
                    if sample.timestamp >= slot.0 {
                        *slot = (sample.timestamp, sample.sm_util);
                    }
                }
                for (pid, (_, sm_util)) in newest {
                    usage.entry(pid).or_default().gpu_core = sm_util as f64;
                }
                self.set_last_seen(index, max_timestamp);
            }
            // No samples since the last call
            Err(NvmlError::NotFound) => {}
            Err(e) => return Err(device_error(index, e)),
        }

        Ok(usage)
    }
}
