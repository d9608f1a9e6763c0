//! One measurement cycle: joins a process tree snapshot with the driver's
//! per-process samples and the declared GPU requests

use crate::device::DeviceReading;
use crate::kubepods::pod::{container_spec, pod_namespace};
use crate::kubepods::{ContainerCache, GpuLimits, GpuResourceNames, PodCache};
use crate::metrics::{CardValues, ContainerValues, PodValues};
use crate::models::{CardUsage, Node};
use k8s_openapi::api::core::v1::Pod as KubePod;
use std::collections::BTreeMap;
use tracing::debug;

/// Core share of one whole device
pub const HUNDRED_CORE: f64 = 100.0;
pub const GIB_TO_MIB: f64 = 1024.0;

/// Round to two decimals
pub fn decimal(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `usage / request` as a percentage, 0 unless both sides are nonzero
pub fn utilization(usage: f64, request: f64) -> f64 {
    if usage > 0.0 && request > 0.0 {
        decimal(usage / request * 100.0)
    } else {
        0.0
    }
}

/// Requested core share and memory (MiB) of one container
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Request {
    pub core: f64,
    pub mem: f64,
}

impl Request {
    /// A nonzero percentage covers both core and memory of one device and
    /// takes precedence over explicit core/memory resources
    pub fn from_limits(limits: &GpuLimits, device_mem_mib: f64) -> Self {
        if limits.percent != 0 {
            let percent = limits.percent as f64;
            Self {
                core: percent,
                mem: device_mem_mib * percent / HUNDRED_CORE,
            }
        } else {
            Self {
                core: limits.core as f64,
                mem: limits.memory_gib as f64 * GIB_TO_MIB,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardReport {
    pub index: u32,
    /// Published series; `mem` is the driver's used memory
    pub values: CardValues,
    /// Usage of the processes matched to containers this cycle
    pub attributed: CardUsage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerReport {
    pub name: String,
    pub values: ContainerValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodReport {
    pub uid: String,
    pub namespace: String,
    pub values: PodValues,
    pub containers: Vec<ContainerReport>,
}

/// Everything one cycle publishes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cards: Vec<CardReport>,
    pub pods: Vec<PodReport>,
}

impl CycleReport {
    pub fn container_count(&self) -> usize {
        self.pods.iter().map(|p| p.containers.len()).sum()
    }

    pub fn pod(&self, uid: &str) -> Option<&PodReport> {
        self.pods.iter().find(|p| p.uid == uid)
    }

    pub fn card(&self, index: u32) -> Option<&CardReport> {
        self.cards.iter().find(|c| c.index == index)
    }
}

/// Accumulated usage and request for one named container
#[derive(Debug, Default)]
struct ContainerTotals {
    core: f64,
    mem: f64,
    request: Request,
}

/// Inputs of one cycle that come from the orchestrator side
pub struct Aggregator<'a> {
    pub pods: &'a PodCache,
    pub identities: &'a ContainerCache,
    pub names: &'a GpuResourceNames,
}

impl Aggregator<'_> {
    /// Fold one cycle's observations into per-card, per-pod and per-container values
    ///
    /// `device_count` is what the driver reported; `readings` holds only the
    /// devices that could be read this cycle.
    pub fn aggregate(
        &self,
        device_count: u32,
        readings: &[DeviceReading],
        snapshot: &Node,
    ) -> CycleReport {
        let mut card_usage: BTreeMap<u32, CardUsage> =
            readings.iter().map(|r| (r.index, CardUsage::default())).collect();

        // Memory of one device, used to size percentage requests
        let device_mem_mib = readings
            .iter()
            .filter_map(|r| r.memory.map(|m| m.total_mib()))
            .max()
            .unwrap_or(0) as f64;
        let node_mem_mib: f64 = readings
            .iter()
            .filter_map(|r| r.memory.map(|m| m.total_mib() as f64))
            .sum();
        let node_core = device_count as f64 * HUNDRED_CORE;

        let mut uids: Vec<&String> = snapshot.pods.keys().collect();
        uids.sort();

        let mut pods = Vec::with_capacity(uids.len());
        for uid in uids {
            let pod = &snapshot.pods[uid];
            let Some(record) = self.pods.get_pod(uid) else {
                debug!(pod_uid = %uid, "No pod record, skipping");
                continue;
            };
            self.identities.populate_if_absent(&record);

            let mut ids: Vec<&String> = pod.containers.keys().collect();
            ids.sort();

            let mut containers: BTreeMap<String, ContainerTotals> = BTreeMap::new();
            for id in ids {
                let Some(name) = self.resolve_name(uid, id, &record) else {
                    continue;
                };
                let totals = containers.entry(name).or_insert_with_key(|name| {
                    let limits = container_spec(&record, name)
                        .map(|spec| GpuLimits::from_container(spec, self.names))
                        .unwrap_or_default();
                    ContainerTotals {
                        request: Request::from_limits(&limits, device_mem_mib),
                        ..Default::default()
                    }
                });

                for pid in pod.containers[id].pids() {
                    for reading in readings {
                        if let Some(usage) = reading.processes.get(&pid) {
                            totals.core += usage.gpu_core;
                            totals.mem += usage.gpu_mem;
                            if let Some(card) = card_usage.get_mut(&reading.index) {
                                card.accumulate(usage);
                            }
                        }
                    }
                }
            }

            let mut pod_totals = ContainerTotals::default();
            let containers: Vec<ContainerReport> = containers
                .into_iter()
                .map(|(name, totals)| {
                    let core = decimal(totals.core);
                    let mem = decimal(totals.mem);
                    // Pod totals sum the published container values
                    pod_totals.core += core;
                    pod_totals.mem += mem;
                    pod_totals.request.core += totals.request.core;
                    pod_totals.request.mem += totals.request.mem;
                    ContainerReport {
                        name,
                        values: ContainerValues {
                            core,
                            mem,
                            core_util: utilization(core, totals.request.core),
                            mem_util: utilization(mem, totals.request.mem),
                        },
                    }
                })
                .collect();

            pods.push(PodReport {
                uid: uid.clone(),
                namespace: pod_namespace(&record).to_string(),
                values: PodValues {
                    core: decimal(pod_totals.core),
                    mem: decimal(pod_totals.mem),
                    core_util: utilization(pod_totals.core, pod_totals.request.core),
                    mem_util: utilization(pod_totals.mem, pod_totals.request.mem),
                    mem_request: decimal(pod_totals.request.mem),
                    core_occupy_node: utilization(pod_totals.core, node_core),
                    mem_occupy_node: utilization(pod_totals.mem, node_mem_mib),
                },
                containers,
            });
        }

        let cards = readings
            .iter()
            .map(|reading| {
                let accumulated = card_usage.get(&reading.index).copied().unwrap_or_default();
                let (used, total) = reading
                    .memory
                    .map(|m| (m.used_mib() as f64, m.total_mib() as f64))
                    .unwrap_or((0.0, 0.0));
                CardReport {
                    index: reading.index,
                    values: CardValues {
                        core: decimal(accumulated.core),
                        mem: used,
                        core_util: decimal(reading.utilization.unwrap_or(0) as f64),
                        mem_util: utilization(used, total),
                    },
                    attributed: accumulated,
                }
            })
            .collect();

        CycleReport { cards, pods }
    }

    /// Container name for a runtime id, re-merging the pod's reported
    /// statuses once if the id is not cached yet
    fn resolve_name(&self, uid: &str, container_id: &str, record: &KubePod) -> Option<String> {
        if let Some(name) = self.identities.get_container_name(uid, container_id) {
            return Some(name);
        }
        self.identities.add_container(record);
        self.identities.get_container_name(uid, container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMemory;
    use crate::kubepods::pod::test_pods::{container, pod, status};
    use crate::kubepods::pod::{RESOURCE_GPU_CORE, RESOURCE_GPU_MEMORY, RESOURCE_GPU_PERCENT};
    use crate::models::{Pod, ProcessUsage, QosClass};
    use std::collections::HashMap;

    const UID: &str = "17eb80b0";

    fn container_id(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn reading(index: u32, total_mib: u64, used_mib: u64, util: u32) -> DeviceReading {
        DeviceReading {
            index,
            processes: HashMap::new(),
            memory: Some(DeviceMemory {
                total_bytes: total_mib << 20,
                used_bytes: used_mib << 20,
            }),
            utilization: Some(util),
        }
    }

    fn with_process(mut r: DeviceReading, pid: u32, core: f64, mem: f64) -> DeviceReading {
        r.processes.insert(pid, ProcessUsage { gpu_core: core, gpu_mem: mem });
        r
    }

    /// Snapshot with one besteffort pod holding the given containers and pids
    fn snapshot(uid: &str, containers: &[(&str, &[u32])]) -> Node {
        let mut p = Pod::new(uid, QosClass::BestEffort);
        for (id, pids) in containers {
            let c = p.add_container(*id);
            for pid in *pids {
                c.add_process(*pid);
            }
        }
        let mut node = Node::default();
        node.pods.insert(uid.to_string(), p);
        node
    }

    struct Fixture {
        pods: PodCache,
        identities: ContainerCache,
        names: GpuResourceNames,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pods: PodCache::new(),
                identities: ContainerCache::new(),
                names: GpuResourceNames::default(),
            }
        }

        fn aggregator(&self) -> Aggregator<'_> {
            Aggregator {
                pods: &self.pods,
                identities: &self.identities,
                names: &self.names,
            }
        }
    }

    #[test]
    fn test_decimal_and_utilization() {
        assert_eq!(decimal(12.3456), 12.35);
        assert_eq!(decimal(0.004), 0.0);
        assert_eq!(utilization(0.0, 50.0), 0.0);
        assert_eq!(utilization(10.0, 0.0), 0.0);
        assert_eq!(utilization(10.0, 50.0), 20.0);
        assert_eq!(utilization(1.0, 3.0), 33.33);
    }

    #[test]
    fn test_percentage_request_sizes_memory_from_device() {
        let limits = GpuLimits {
            core: 30,
            memory_gib: 2,
            percent: 50,
        };
        let request = Request::from_limits(&limits, 8192.0);
        assert_eq!(request, Request { core: 50.0, mem: 4096.0 });
    }

    #[test]
    fn test_explicit_request_converts_gib() {
        let limits = GpuLimits {
            core: 30,
            memory_gib: 2,
            percent: 0,
        };
        let request = Request::from_limits(&limits, 8192.0);
        assert_eq!(request, Request { core: 30.0, mem: 2048.0 });
    }

    #[test]
    fn test_single_process_attribution() {
        let fx = Fixture::new();
        let id = container_id('a');
        fx.pods.add_pod(
            UID,
            pod(
                UID,
                "team-a",
                "BestEffort",
                vec![container("app", &[(RESOURCE_GPU_PERCENT, "50")])],
                vec![status("app", &id)],
            ),
        );

        let node = snapshot(UID, &[(id.as_str(), &[111, 222])]);
        let readings = vec![with_process(reading(0, 8192, 600, 35), 111, 10.0, 512.0)];

        let report = fx.aggregator().aggregate(1, &readings, &node);

        let pod_report = report.pod(UID).unwrap();
        assert_eq!(pod_report.namespace, "team-a");
        assert_eq!(pod_report.containers.len(), 1);
        let app = &pod_report.containers[0];
        assert_eq!(app.name, "app");
        assert_eq!(app.values.core, 10.0);
        assert_eq!(app.values.mem, 512.0);
        assert_eq!(app.values.core_util, 20.0);
        assert_eq!(app.values.mem_util, 12.5);

        assert_eq!(pod_report.values.core, 10.0);
        assert_eq!(pod_report.values.mem, 512.0);
        assert_eq!(pod_report.values.mem_request, 4096.0);
        assert_eq!(pod_report.values.core_occupy_node, 10.0);
        assert_eq!(pod_report.values.mem_occupy_node, 6.25);

        let card = report.card(0).unwrap();
        assert_eq!(card.values.core, 10.0);
        assert_eq!(card.values.mem, 600.0);
        assert_eq!(card.values.core_util, 35.0);
        assert_eq!(card.values.mem_util, 7.32);
        assert_eq!(card.attributed, CardUsage { core: 10.0, mem: 512.0 });

        // Identities were populated lazily from the pod record
        assert!(fx.identities.has_identities(UID));
    }

    #[test]
    fn test_pod_totals_match_published_container_values() {
        let fx = Fixture::new();
        let ids = [container_id('a'), container_id('b'), container_id('c')];
        fx.pods.add_pod(
            UID,
            pod(
                UID,
                "default",
                "BestEffort",
                vec![container("a", &[]), container("b", &[]), container("c", &[])],
                vec![status("a", &ids[0]), status("b", &ids[1]), status("c", &ids[2])],
            ),
        );

        let node = snapshot(
            UID,
            &[(ids[0].as_str(), &[1]), (ids[1].as_str(), &[2]), (ids[2].as_str(), &[3])],
        );
        let mut dev0 = reading(0, 8192, 0, 0);
        for pid in 1..=3 {
            dev0 = with_process(dev0, pid, 0.006, 0.006);
        }

        let report = fx.aggregator().aggregate(1, &[dev0], &node);

        let pod_report = report.pod(UID).unwrap();
        let container_core: f64 = pod_report.containers.iter().map(|c| c.values.core).sum();
        assert!(pod_report.containers.iter().all(|c| c.values.core == 0.01));
        assert_eq!(pod_report.values.core, decimal(container_core));
        assert_eq!(pod_report.values.core, 0.03);
        assert_eq!(pod_report.values.mem, 0.03);
    }

    #[test]
    fn test_pod_totals_are_container_sums() {
        let fx = Fixture::new();
        let app = container_id('a');
        let sidecar = container_id('b');
        fx.pods.add_pod(
            UID,
            pod(
                UID,
                "default",
                "BestEffort",
                vec![
                    container("app", &[(RESOURCE_GPU_CORE, "50"), (RESOURCE_GPU_MEMORY, "4")]),
                    container("sidecar", &[(RESOURCE_GPU_CORE, "20"), (RESOURCE_GPU_MEMORY, "1")]),
                ],
                vec![status("app", &app), status("sidecar", &sidecar)],
            ),
        );

        let node = snapshot(UID, &[(app.as_str(), &[1, 2]), (sidecar.as_str(), &[3])]);
        let dev0 = with_process(with_process(reading(0, 16384, 0, 0), 1, 20.0, 1000.0), 3, 5.0, 256.0);
        let dev1 = with_process(reading(1, 16384, 0, 0), 2, 15.0, 500.0);

        let report = fx.aggregator().aggregate(2, &[dev0, dev1], &node);
        let pod_report = report.pod(UID).unwrap();

        let core: f64 = pod_report.containers.iter().map(|c| c.values.core).sum();
        let mem: f64 = pod_report.containers.iter().map(|c| c.values.mem).sum();
        assert_eq!(pod_report.values.core, core);
        assert_eq!(pod_report.values.mem, mem);
        assert_eq!(pod_report.values.core, 40.0);
        assert_eq!(pod_report.values.mem_request, 5120.0);
        // 40 of 200 node cores
        assert_eq!(pod_report.values.core_occupy_node, 20.0);

        assert_eq!(report.card(0).unwrap().values.core, 25.0);
        assert_eq!(report.card(1).unwrap().values.core, 15.0);
    }

    #[test]
    fn test_zero_request_gives_zero_utilization() {
        let fx = Fixture::new();
        let id = container_id('c');
        fx.pods.add_pod(
            UID,
            pod(
                UID,
                "default",
                "BestEffort",
                vec![container("app", &[("nvidia.com/gpu", "1")])],
                vec![status("app", &id)],
            ),
        );

        let node = snapshot(UID, &[(id.as_str(), &[7])]);
        let readings = vec![with_process(reading(0, 8192, 0, 0), 7, 30.0, 100.0)];

        let report = fx.aggregator().aggregate(1, &readings, &node);
        let values = report.pod(UID).unwrap().containers[0].values;
        assert_eq!(values.core, 30.0);
        assert_eq!(values.core_util, 0.0);
        assert_eq!(values.mem_util, 0.0);
    }

    #[test]
    fn test_unknown_pod_and_unresolved_container_are_skipped() {
        let fx = Fixture::new();
        let known = container_id('d');
        let stranger = container_id('e');
        fx.pods.add_pod(
            UID,
            pod(UID, "default", "BestEffort", vec![container("app", &[])], vec![status("app", &known)]),
        );

        let mut node = snapshot(UID, &[(known.as_str(), &[1]), (stranger.as_str(), &[2])]);
        node.pods
            .insert("no-record".to_string(), Pod::new("no-record", QosClass::BestEffort));
        let readings = vec![with_process(with_process(reading(0, 8192, 0, 0), 1, 5.0, 10.0), 2, 50.0, 99.0)];

        let report = fx.aggregator().aggregate(1, &readings, &node);

        assert!(report.pod("no-record").is_none());
        let pod_report = report.pod(UID).unwrap();
        assert_eq!(pod_report.containers.len(), 1);
        // The unresolved container's pid is not attributed anywhere
        assert_eq!(pod_report.values.core, 5.0);
        assert_eq!(report.card(0).unwrap().values.core, 5.0);
    }

    #[test]
    fn test_cards_reported_without_attribution() {
        let fx = Fixture::new();
        let mut unreadable_memory = reading(1, 0, 0, 0);
        unreadable_memory.memory = None;
        unreadable_memory.utilization = None;

        let report = fx
            .aggregator()
            .aggregate(2, &[reading(0, 8192, 4096, 80), unreadable_memory], &Node::default());

        assert!(report.pods.is_empty());
        assert_eq!(report.cards.len(), 2);
        let card0 = report.card(0).unwrap().values;
        assert_eq!(card0.mem, 4096.0);
        assert_eq!(card0.mem_util, 50.0);
        assert_eq!(card0.core_util, 80.0);
        assert_eq!(report.card(1).unwrap().values, CardValues::default());
    }

    #[test]
    fn test_no_devices_never_divides_by_zero() {
        let fx = Fixture::new();
        let id = container_id('f');
        fx.pods.add_pod(
            UID,
            pod(UID, "default", "BestEffort", vec![container("app", &[])], vec![status("app", &id)]),
        );
        let node = snapshot(UID, &[(id.as_str(), &[1])]);

        let report = fx.aggregator().aggregate(0, &[], &node);
        let values = report.pod(UID).unwrap().values;
        assert_eq!(values.core_occupy_node, 0.0);
        assert_eq!(values.mem_occupy_node, 0.0);
        assert!(report.cards.is_empty());
    }
}
