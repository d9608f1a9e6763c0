//! GPU driver access
//!
//! The driver reports devices, their memory and per-process usage keyed by
//! pid. Driver calls are blocking, so every device is read on its own
//! blocking task with a timeout, and at most one call per device is ever
//! outstanding. A hung device costs one blocking thread, not one per cycle.

mod nvml;

pub use nvml::NvmlDriver;

use crate::models::ProcessUsage;
use dashmap::DashSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default upper bound for reading one device
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure reported by the driver binding
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("GPU driver not initialized: {0}")]
    NotInitialized(String),

    #[error("device {index}: {message}")]
    Device { index: u32, message: String },

    #[error("{call} did not respond within {timeout:?}")]
    Timeout { call: DriverCall, timeout: Duration },

    #[error("{call} is still running from an earlier cycle")]
    InFlight { call: DriverCall },

    #[error("{call}: driver task failed: {message}")]
    Task { call: DriverCall, message: String },
}

/// A driver call that runs on the blocking pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCall {
    DeviceCount,
    Device(u32),
}

impl fmt::Display for DriverCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverCall::DeviceCount => f.write_str("device count"),
            DriverCall::Device(index) => write!(f, "device {}", index),
        }
    }
}

/// Memory counters of one device, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMemory {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl DeviceMemory {
    pub fn total_mib(&self) -> u64 {
        self.total_bytes >> 20
    }

    pub fn used_mib(&self) -> u64 {
        self.used_bytes >> 20
    }
}

/// Blocking GPU driver binding
pub trait GpuDriver: Send + Sync {
    fn device_count(&self) -> Result<u32, DriverError>;

    fn memory_info(&self, index: u32) -> Result<DeviceMemory, DriverError>;

    /// Device-level compute utilization, 0-100
    fn utilization(&self, index: u32) -> Result<u32, DriverError>;

    /// Per-pid usage samples on one device
    fn process_usage(&self, index: u32) -> Result<HashMap<u32, ProcessUsage>, DriverError>;
}

/// Everything read from one device during a cycle
#[derive(Debug, Clone, Default)]
pub struct DeviceReading {
    pub index: u32,
    pub processes: HashMap<u32, ProcessUsage>,
    pub memory: Option<DeviceMemory>,
    pub utilization: Option<u32>,
}

impl DeviceReading {
    /// Query one device, keeping whatever parts of it succeed
    ///
    /// Fails only if every query failed, i.e. the device is unreadable.
    pub fn read(driver: &dyn GpuDriver, index: u32) -> Result<Self, DriverError> {
        let processes = driver.process_usage(index);
        let memory = driver.memory_info(index);
        let utilization = driver.utilization(index);

        if let (Err(_), Err(_), Err(e)) = (&processes, &memory, &utilization) {
            return Err(DriverError::Device {
                index,
                message: e.to_string(),
            });
        }

        let processes = processes.unwrap_or_else(|e| {
            warn!(card = index, error = %e, "Cannot get process usage");
            HashMap::new()
        });
        let memory = memory
            .map_err(|e| warn!(card = index, error = %e, "Cannot get memory info"))
            .ok();
        let utilization = utilization
            .map_err(|e| warn!(card = index, error = %e, "Cannot get utilization"))
            .ok();

        Ok(Self {
            index,
            processes,
            memory,
            utilization,
        })
    }
}

/// Marks a call as outstanding until the blocking closure owning it is dropped
struct Slot {
    call: DriverCall,
    in_flight: Arc<DashSet<DriverCall>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight.remove(&self.call);
    }
}

/// Runs driver calls on the blocking pool with a timeout
///
/// A timed-out call keeps its thread until the driver returns. Its slot stays
/// taken until then, and later cycles skip that call with
/// [`DriverError::InFlight`] instead of queueing another thread behind it.
#[derive(Clone)]
pub struct DeviceReader {
    driver: Arc<dyn GpuDriver>,
    timeout: Duration,
    in_flight: Arc<DashSet<DriverCall>>,
}

impl DeviceReader {
    pub fn new(driver: Arc<dyn GpuDriver>, timeout: Duration) -> Self {
        Self {
            driver,
            timeout,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True while a previous `call` has not returned from the driver
    pub fn in_flight(&self, call: DriverCall) -> bool {
        self.in_flight.contains(&call)
    }

    async fn call<T, F>(&self, call: DriverCall, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn GpuDriver) -> Result<T, DriverError> + Send + 'static,
    {
        if !self.in_flight.insert(call) {
            return Err(DriverError::InFlight { call });
        }
        let slot = Slot {
            call,
            in_flight: self.in_flight.clone(),
        };

        let driver = self.driver.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            f(driver.as_ref())
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(DriverError::Task {
                call,
                message: join_error.to_string(),
            }),
            Err(_) => Err(DriverError::Timeout {
                call,
                timeout: self.timeout,
            }),
        }
    }

    pub async fn device_count(&self) -> Result<u32, DriverError> {
        self.call(DriverCall::DeviceCount, |driver| driver.device_count())
            .await
    }

    pub async fn read_device(&self, index: u32) -> Result<DeviceReading, DriverError> {
        self.call(DriverCall::Device(index), move |driver| {
            DeviceReading::read(driver, index)
        })
        .await
    }

    /// Read every device concurrently; failed devices are logged and left out
    pub async fn read_all(&self, device_count: u32) -> (Vec<DeviceReading>, usize) {
        let tasks: Vec<_> = (0..device_count)
            .map(|index| {
                let reader = self.clone();
                tokio::spawn(async move { reader.read_device(index).await })
            })
            .collect();

        let mut readings = Vec::with_capacity(tasks.len());
        let mut failures = 0;

        for task in tasks {
            match task.await {
                Ok(Ok(reading)) => readings.push(reading),
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(error = %e, "Skipping device for this cycle");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "Device read task failed");
                }
            }
        }

        readings.sort_by_key(|r| r.index);
        (readings, failures)
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeDevice, FakeDriver};
    use super::*;

    #[test]
    fn test_memory_mib_conversion() {
        let memory = DeviceMemory {
            total_bytes: 8192 << 20,
            used_bytes: (512 << 20) + 1000,
        };
        assert_eq!(memory.total_mib(), 8192);
        assert_eq!(memory.used_mib(), 512);
    }

    #[test]
    fn test_broken_device_is_unreadable() {
        let mut broken = FakeDevice::new(8192, 0, 0);
        broken.broken = true;
        let driver = FakeDriver::with_devices(vec![broken]);

        let err = DeviceReading::read(&driver, 0).unwrap_err();
        assert!(matches!(err, DriverError::Device { index: 0, .. }));
    }

    #[test]
    fn test_healthy_device_reading() {
        let driver = FakeDriver::with_devices(vec![FakeDevice::new(8192, 512, 40).process(7, 5.0, 64.0)]);

        let reading = DeviceReading::read(&driver, 0).unwrap();
        assert_eq!(reading.memory.unwrap().used_mib(), 512);
        assert_eq!(reading.utilization, Some(40));
        assert_eq!(reading.processes[&7].gpu_core, 5.0);
    }

    #[tokio::test]
    async fn test_read_all_isolates_stalled_device() {
        let mut stalled = FakeDevice::new(8192, 0, 0);
        stalled.stall = Some(Duration::from_millis(500));
        let healthy = FakeDevice::new(16384, 1024, 40).process(111, 10.0, 512.0);
        let reader = DeviceReader::new(
            Arc::new(FakeDriver::with_devices(vec![stalled, healthy])),
            Duration::from_millis(100),
        );

        let (readings, failures) = reader.read_all(2).await;

        assert_eq!(failures, 1);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].index, 1);
        assert_eq!(readings[0].utilization, Some(40));
        assert_eq!(readings[0].processes[&111].gpu_mem, 512.0);
    }

    #[tokio::test]
    async fn test_stalled_device_is_skipped_until_it_returns() {
        let mut stalled = FakeDevice::new(8192, 0, 0);
        stalled.stall = Some(Duration::from_millis(200));
        let fake = Arc::new(FakeDriver::with_devices(vec![stalled]));
        let reader = DeviceReader::new(fake.clone(), Duration::from_millis(50));

        let err = reader.read_device(0).await.unwrap_err();
        assert!(matches!(err, DriverError::Timeout { call: DriverCall::Device(0), .. }));

        // The first call still holds its thread
        let err = reader.read_device(0).await.unwrap_err();
        assert!(matches!(err, DriverError::InFlight { call: DriverCall::Device(0) }));
        assert!(reader.in_flight(DriverCall::Device(0)));

        fake.devices.lock().unwrap()[0].stall = None;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!reader.in_flight(DriverCall::Device(0)));
        assert!(reader.read_device(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_device_count_is_not_repeated() {
        let driver = FakeDriver {
            count_stall: Some(Duration::from_millis(300)),
            ..FakeDriver::with_devices(vec![FakeDevice::new(8192, 0, 0)])
        };
        let reader = DeviceReader::new(Arc::new(driver), Duration::from_millis(50));

        let err = reader.device_count().await.unwrap_err();
        assert!(matches!(err, DriverError::Timeout { call: DriverCall::DeviceCount, .. }));

        let err = reader.device_count().await.unwrap_err();
        assert!(matches!(err, DriverError::InFlight { call: DriverCall::DeviceCount }));
    }

    #[test]
    fn test_hung_device_does_not_starve_blocking_pool() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "111\n").unwrap();

        runtime.block_on(async {
            let mut hung = FakeDevice::new(8192, 0, 0);
            hung.stall = Some(Duration::from_secs(3));
            let healthy = FakeDevice::new(16384, 1024, 40);
            let reader = DeviceReader::new(
                Arc::new(FakeDriver::with_devices(vec![hung, healthy])),
                Duration::from_millis(200),
            );

            for _ in 0..4 {
                let (readings, failures) = reader.read_all(2).await;
                assert_eq!(failures, 1);
                assert_eq!(readings.len(), 1);
                assert_eq!(readings[0].index, 1);
            }

            let content = tokio::time::timeout(
                Duration::from_secs(1),
                tokio::fs::read_to_string(&procs),
            )
            .await
            .expect("cgroup read waited on the blocking pool")
            .unwrap();
            assert_eq!(content, "111\n");
        });

        runtime.shutdown_timeout(Duration::from_millis(10));
    }
}
