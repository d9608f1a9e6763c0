//! Process tree cache
//!
//! Keeps the interest set of pods to scan, sweeps them on a fixed interval
//! and serves consistent snapshots of the resulting pod topology.

use super::scanner::Scanner;
use crate::models::{Node, Pod, QosClass};
use crate::health::{components, HealthRegistry};
use crate::observability::ExporterMetrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default sweep interval (matches the measurement interval)
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// A pod the tree should keep scanning
#[derive(Debug, Clone, Copy)]
struct Interest {
    qos: QosClass,
    /// Bumped every time the uid is (re)registered after being forgotten
    generation: u64,
}

/// Per-pod scan bookkeeping
#[derive(Debug, Clone, Default)]
pub struct ScanState {
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
}

#[derive(Debug, Default)]
struct Interests {
    pods: HashMap<String, Interest>,
    scanners: HashMap<String, ScanState>,
    next_generation: u64,
}

#[derive(Debug, Default)]
struct TreeCache {
    pods: HashMap<String, Pod>,
    /// container id -> owning pod uid
    containers: HashMap<String, String>,
}

impl TreeCache {
    fn remove_containers_of(&mut self, pod_uid: &str) {
        self.containers.retain(|_, parent| parent != pod_uid);
    }

    fn replace_pod(&mut self, pod: Pod) {
        self.remove_containers_of(&pod.uid);
        for id in pod.containers.keys() {
            self.containers.insert(id.clone(), pod.uid.clone());
        }
        self.pods.insert(pod.uid.clone(), pod);
    }
}

/// Results from one sweep over the interest set
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub not_found: usize,
    pub failed: usize,
    /// Results dropped because the pod was forgotten mid-scan
    pub discarded: usize,
}

/// Shared pod topology cache driven by a [`Scanner`]
pub struct ProcessTree {
    scanner: Arc<dyn Scanner>,
    interval: Duration,
    interests: Mutex<Interests>,
    cache: Mutex<TreeCache>,
    metrics: Option<ExporterMetrics>,
    health: Option<HealthRegistry>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessTree {
    pub fn new(scanner: Arc<dyn Scanner>, interval: Duration) -> Self {
        Self {
            scanner,
            interval,
            interests: Mutex::new(Interests::default()),
            cache: Mutex::new(TreeCache::default()),
            metrics: None,
            health: None,
        }
    }

    /// Record sweep latency and pod counts on the exporter's self-metrics
    pub fn with_metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report sweep outcomes on the `tree_scanner` health component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Add a pod to the interest set, or refresh its QoS class
    pub fn interest_pod(&self, uid: &str, qos: QosClass) {
        let mut interests = lock(&self.interests);
        let next = interests.next_generation;
        match interests.pods.get_mut(uid) {
            Some(interest) => interest.qos = qos,
            None => {
                interests.next_generation += 1;
                interests.pods.insert(
                    uid.to_string(),
                    Interest {
                        qos,
                        generation: next,
                    },
                );
                interests.scanners.entry(uid.to_string()).or_default();
                debug!(pod_uid = %uid, qos = %qos, "Pod added to interest set");
            }
        }
    }

    /// Stop scanning a pod and purge everything cached for it
    pub fn forget_pod(&self, uid: &str) {
        let removed = lock(&self.interests).pods.remove(uid).is_some();
        self.delete_container(uid);
        self.delete_pod(uid);
        if removed {
            debug!(pod_uid = %uid, "Pod forgotten");
        }
    }

    /// Drop the per-pod scan bookkeeping
    pub fn delete_scanner(&self, uid: &str) {
        let mut interests = lock(&self.interests);
        interests.pods.remove(uid);
        interests.scanners.remove(uid);
    }

    pub fn is_interested(&self, uid: &str) -> bool {
        lock(&self.interests).pods.contains_key(uid)
    }

    pub fn interest_count(&self) -> usize {
        lock(&self.interests).pods.len()
    }

    pub fn scan_state(&self, uid: &str) -> Option<ScanState> {
        lock(&self.interests).scanners.get(uid).cloned()
    }

    /// Remove a pod subtree from the cache
    pub fn delete_pod(&self, uid: &str) {
        lock(&self.cache).pods.remove(uid);
    }

    /// Remove every container index entry owned by a pod
    pub fn delete_container(&self, pod_uid: &str) {
        lock(&self.cache).remove_containers_of(pod_uid);
    }

    /// Uid of the pod owning a container, if cached
    pub fn container_owner(&self, container_id: &str) -> Option<String> {
        lock(&self.cache).containers.get(container_id).cloned()
    }

    /// Deep copy of the current cache
    pub fn snapshot(&self) -> Node {
        let cache = lock(&self.cache);
        Node {
            pods: cache.pods.clone(),
        }
    }

    /// Scan every pod in the interest set once
    pub async fn scan_once(&self) -> SweepStats {
        let targets: Vec<(String, Interest)> = lock(&self.interests)
            .pods
            .iter()
            .map(|(uid, interest)| (uid.clone(), *interest))
            .collect();

        let mut stats = SweepStats::default();

        for (uid, interest) in targets {
            match self.scanner.scan(&uid, interest.qos).await {
                Ok(Some(pod)) => {
                    if self.merge(pod, interest.generation) {
                        stats.scanned += 1;
                    } else {
                        stats.discarded += 1;
                    }
                }
                Ok(None) => stats.not_found += 1,
                Err(e) => {
                    stats.failed += 1;
                    let failures = self.record_failure(&uid);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_scan_errors();
                    }
                    warn!(
                        pod_uid = %uid,
                        error = %e,
                        consecutive_failures = failures,
                        "Failed to scan pod, keeping previous topology"
                    );
                }
            }
        }

        stats
    }

    /// Replace a pod subtree if the pod is still of interest in the same incarnation
    fn merge(&self, pod: Pod, generation: u64) -> bool {
        let mut interests = lock(&self.interests);
        let current = interests.pods.get(&pod.uid).map(|i| i.generation);
        if current != Some(generation) {
            return false;
        }

        let state = interests.scanners.entry(pod.uid.clone()).or_default();
        state.consecutive_failures = 0;
        state.last_success = Some(Instant::now());

        // Interests stay locked so a concurrent forget cannot slip in between
        lock(&self.cache).replace_pod(pod);
        true
    }

    fn record_failure(&self, uid: &str) -> u32 {
        let mut interests = lock(&self.interests);
        match interests.scanners.get_mut(uid) {
            Some(state) => {
                state.consecutive_failures += 1;
                state.consecutive_failures
            }
            None => 0,
        }
    }

    /// Sweep the interest set until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting process tree scan loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let stats = self.scan_once().await;
                    let elapsed = start.elapsed();

                    if let Some(metrics) = &self.metrics {
                        metrics.observe_scan_latency(elapsed.as_secs_f64());
                        metrics.set_pods_tracked(self.interest_count() as i64);
                    }

                    if let Some(health) = &self.health {
                        if stats.failed > 0 {
                            let total = stats.scanned + stats.not_found + stats.failed;
                            health
                                .set_degraded(
                                    components::TREE_SCANNER,
                                    format!("{} of {} pods failed to scan", stats.failed, total),
                                )
                                .await;
                        } else {
                            health.set_healthy(components::TREE_SCANNER).await;
                        }
                    }

                    debug!(
                        scanned = stats.scanned,
                        not_found = stats.not_found,
                        failed = stats.failed,
                        discarded = stats.discarded,
                        elapsed_ms = elapsed.as_millis(),
                        "Scan sweep complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down process tree scan loop");
                    break;
                }
            }
        }
    }
}
