//! The exporter: reacts to pod lifecycle events and runs the measurement cycle
//!
//! Pod events drive the process tree's interest set and the orchestrator
//! caches. Each cycle reads every device, takes a tree snapshot, folds both
//! into a [`CycleReport`] and publishes it through a [`MetricsSink`].

mod aggregate;


pub use aggregate::{
    decimal, utilization, Aggregator, CardReport, ContainerReport, CycleReport, PodReport,
    Request, GIB_TO_MIB, HUNDRED_CORE,
};

use crate::device::{DeviceReader, GpuDriver, DEFAULT_DEVICE_TIMEOUT};
use crate::health::{components, HealthRegistry};
use crate::kubepods::pod::{
    container_statuses, is_complete_pod, pod_namespace, pod_uid, qos_class,
};
use crate::kubepods::{ContainerCache, GpuResourceNames, PodCache, PodEventHandler};
use crate::metrics::MetricsSink;
use crate::observability::{ExporterMetrics, StructuredLogger};
use crate::ptree::{ProcessTree, DEFAULT_SCAN_INTERVAL};
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ExporterSettings {
    /// Value of the `node` label
    pub node: String,
    pub names: GpuResourceNames,
    /// Measurement cycle period
    pub interval: Duration,
    /// Upper bound for reading one device
    pub device_timeout: Duration,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            node: String::new(),
            names: GpuResourceNames::default(),
            interval: DEFAULT_SCAN_INTERVAL,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }
}

/// A series tuple to remove from the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retraction {
    Pod {
        namespace: String,
        uid: String,
    },
    Container {
        namespace: String,
        uid: String,
        name: String,
    },
}

#[derive(Debug)]
struct Published {
    namespace: String,
    containers: BTreeSet<String>,
}

/// What has been published, and what still has to be retracted
#[derive(Debug, Default)]
struct Ledger {
    published: HashMap<String, Published>,
    /// Replayed before the next publication
    pending: Vec<Retraction>,
}

/// Outcome of one measurement cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub devices: u32,
    pub device_failures: usize,
    pub pods: usize,
    pub containers: usize,
    pub retracted: usize,
}

pub struct Exporter {
    settings: ExporterSettings,
    pods: Arc<PodCache>,
    identities: Arc<ContainerCache>,
    tree: Arc<ProcessTree>,
    reader: DeviceReader,
    sink: Arc<dyn MetricsSink>,
    health: HealthRegistry,
    metrics: ExporterMetrics,
    logger: StructuredLogger,
    ledger: Mutex<Ledger>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Exporter {
    pub fn new(
        settings: ExporterSettings,
        tree: Arc<ProcessTree>,
        driver: Arc<dyn GpuDriver>,
        sink: Arc<dyn MetricsSink>,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(settings.node.clone());
        let reader = DeviceReader::new(driver, settings.device_timeout);
        Self {
            settings,
            pods: Arc::new(PodCache::new()),
            identities: Arc::new(ContainerCache::new()),
            tree,
            reader,
            sink,
            health,
            metrics: ExporterMetrics::new(),
            logger,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn settings(&self) -> &ExporterSettings {
        &self.settings
    }

    pub fn pods(&self) -> &PodCache {
        &self.pods
    }

    pub fn identities(&self) -> &ContainerCache {
        &self.identities
    }

    pub fn tree(&self) -> &Arc<ProcessTree> {
        &self.tree
    }

    fn apply(&self, retraction: &Retraction) {
        let node = &self.settings.node;
        match retraction {
            Retraction::Pod { namespace, uid } => self.sink.delete_pod(node, namespace, uid),
            Retraction::Container {
                namespace,
                uid,
                name,
            } => self.sink.delete_container(node, namespace, uid, name),
        }
    }

    /// Run one measurement cycle and publish its results
    pub async fn once(&self) -> CycleSummary {
        let start = Instant::now();

        let device_count = match self.reader.device_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Cannot get device count");
                self.health
                    .set_degraded(components::GPU_DRIVER, e.to_string())
                    .await;
                0
            }
        };

        let (readings, device_failures) = self.reader.read_all(device_count).await;

        let snapshot = self.tree.snapshot();
        let report = Aggregator {
            pods: &self.pods,
            identities: &self.identities,
            names: &self.settings.names,
        }
        .aggregate(device_count, &readings, &snapshot);

        let retracted = self.publish(&report);

        if device_count > 0 {
            if device_failures > 0 {
                self.health
                    .set_degraded(
                        components::GPU_DRIVER,
                        format!("{} of {} devices unreadable", device_failures, device_count),
                    )
                    .await;
            } else {
                self.health.set_healthy(components::GPU_DRIVER).await;
            }
        }
        self.health.set_healthy(components::EXPORTER).await;
        self.health.set_ready(true).await;

        let elapsed = start.elapsed();
        self.metrics.observe_cycle_latency(elapsed.as_secs_f64());
        self.metrics.set_devices(device_count as i64);
        if device_failures > 0 {
            self.metrics.inc_device_errors(device_failures as u64);
        }

        let summary = CycleSummary {
            devices: device_count,
            device_failures,
            pods: report.pods.len(),
            containers: report.container_count(),
            retracted,
        };
        self.logger.log_cycle_complete(
            readings.len(),
            device_failures,
            summary.pods,
            summary.containers,
            elapsed.as_millis() as u64,
        );
        summary
    }

    /// Replay pending retractions, then publish the report
    ///
    /// Holds the ledger for the whole publication, so a pod deleted while the
    /// cycle was computing is either retracted after this returns or skipped
    /// here. Returns the number of retractions replayed.
    fn publish(&self, report: &CycleReport) -> usize {
        let node = &self.settings.node;
        let mut ledger = lock(&self.ledger);

        let pending = std::mem::take(&mut ledger.pending);
        for retraction in &pending {
            self.apply(retraction);
        }

        for pod in &report.pods {
            if !self.pods.known_pod(&pod.uid) {
                debug!(pod_uid = %pod.uid, "Pod deleted during cycle, not publishing");
                continue;
            }

            self.sink.pod(node, &pod.namespace, &pod.uid, &pod.values);
            for container in &pod.containers {
                self.sink.container(
                    node,
                    &pod.namespace,
                    &pod.uid,
                    &container.name,
                    &container.values,
                );
            }

            let current: BTreeSet<String> =
                pod.containers.iter().map(|c| c.name.clone()).collect();
            let previous = ledger.published.insert(
                pod.uid.clone(),
                Published {
                    namespace: pod.namespace.clone(),
                    containers: current.clone(),
                },
            );
            // Containers that stopped reporting for a live pod
            if let Some(previous) = previous {
                for stale in previous.containers.difference(&current) {
                    self.sink
                        .delete_container(node, &previous.namespace, &pod.uid, stale);
                }
            }
        }

        for card in &report.cards {
            self.sink.card(node, &card.index.to_string(), &card.values);
        }

        pending.len()
    }

    /// Run cycles at the configured interval until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            node = %self.settings.node,
            "Starting export loop"
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down export loop");
                    break;
                }
            }
        }
    }
}

impl PodEventHandler for Exporter {
    fn on_add(&self, pod: &Pod) {
        let Some(uid) = pod_uid(pod) else {
            return;
        };
        let qos = qos_class(pod);
        self.pods.add_pod(uid, pod.clone());
        self.tree.interest_pod(uid, qos);
        self.logger.log_pod_interest(
            uid,
            pod_namespace(pod),
            pod.metadata.name.as_deref().unwrap_or_default(),
            qos.as_str(),
        );
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        let Some(uid) = pod_uid(old).or_else(|| pod_uid(new)) else {
            return;
        };

        let terminal = self.pods.known_pod(uid) && is_complete_pod(new);
        let missing_identities = !self.identities.has_identities(uid);
        // A restarted container reports a runtime id we have not cached yet
        let new_container = container_statuses(new)
            .iter()
            .any(|(id, _)| self.identities.get_container_name(uid, id).is_none());

        if terminal || missing_identities || new_container {
            debug!(
                pod_uid = %uid,
                terminal,
                missing_identities,
                new_container,
                "Refreshing pod record"
            );
            self.pods.add_pod(uid, new.clone());
        }
    }

    fn on_delete(&self, pod: &Pod) {
        let Some(uid) = pod_uid(pod) else {
            return;
        };

        let mut ledger = lock(&self.ledger);

        let published = ledger.published.remove(uid);
        let namespace = published
            .as_ref()
            .map(|p| p.namespace.clone())
            .unwrap_or_else(|| pod_namespace(pod).to_string());

        let mut names: BTreeSet<String> = self
            .identities
            .get_container(uid)
            .map(|m| m.into_values().collect())
            .unwrap_or_default();
        if let Some(published) = published {
            names.extend(published.containers);
        }

        let mut retractions = vec![Retraction::Pod {
            namespace: namespace.clone(),
            uid: uid.to_string(),
        }];
        retractions.extend(names.into_iter().map(|name| Retraction::Container {
            namespace: namespace.clone(),
            uid: uid.to_string(),
            name,
        }));

        for retraction in &retractions {
            self.apply(retraction);
        }
        let containers = retractions.len() - 1;
        ledger.pending.extend(retractions);

        self.pods.del_pod(uid);
        self.identities.del_container(uid);
        self.tree.forget_pod(uid);
        self.tree.delete_scanner(uid);
        drop(ledger);

        self.logger.log_pod_forgotten(uid, &namespace, containers);
    }
}
