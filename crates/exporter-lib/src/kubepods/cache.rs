//! Per-pod caches fed by orchestrator events
//!
//! Both caches are sharded by pod uid so that lookups for unrelated pods
//! never contend with each other.

use super::pod::{container_statuses, pod_uid};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use tracing::debug;

/// Latest known pod object per uid
#[derive(Debug, Default)]
pub struct PodCache {
    pods: DashMap<String, Pod>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, uid: &str, pod: Pod) {
        self.pods.insert(uid.to_string(), pod);
    }

    pub fn get_pod(&self, uid: &str) -> Option<Pod> {
        self.pods.get(uid).map(|r| r.clone())
    }

    pub fn del_pod(&self, uid: &str) -> Option<Pod> {
        self.pods.remove(uid).map(|(_, v)| v)
    }

    pub fn known_pod(&self, uid: &str) -> bool {
        self.pods.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

/// Maps runtime container ids to container names, per pod
///
/// The cgroup scanner only sees runtime ids; this cache is what turns them
/// into the names used for metric labels.
#[derive(Debug, Default)]
pub struct ContainerCache {
    cache: DashMap<String, HashMap<String, String>>,
}

impl ContainerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the pod's reported container statuses into its identity map
    ///
    /// Re-adding is idempotent. Entries for containers that are no longer
    /// reported are kept until the pod is deleted.
    pub fn add_container(&self, pod: &Pod) {
        let Some(uid) = pod_uid(pod) else {
            return;
        };
        let statuses = container_statuses(pod);
        let mut entry = self.cache.entry(uid.to_string()).or_default();
        for (id, name) in statuses {
            entry.insert(id, name);
        }
        debug!(pod_uid = %uid, containers = entry.len(), "Cached container identities");
    }

    /// Populate identities only if none are cached yet for this pod
    ///
    /// Returns true if the cache was populated by this call.
    pub fn populate_if_absent(&self, pod: &Pod) -> bool {
        let Some(uid) = pod_uid(pod) else {
            return false;
        };
        if self.has_identities(uid) {
            return false;
        }
        self.add_container(pod);
        true
    }

    pub fn has_identities(&self, uid: &str) -> bool {
        self.cache.get(uid).map(|m| !m.is_empty()).unwrap_or(false)
    }

    pub fn get_container_name(&self, uid: &str, container_id: &str) -> Option<String> {
        self.cache
            .get(uid)
            .and_then(|m| m.get(container_id).cloned())
    }

    pub fn get_container(&self, uid: &str) -> Option<HashMap<String, String>> {
        self.cache.get(uid).map(|m| m.clone())
    }

    pub fn del_container(&self, uid: &str) {
        self.cache.remove(uid);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubepods::pod::test_pods::{pod, status};

    #[test]
    fn test_pod_cache() {
        let cache = PodCache::new();
        let p = pod("u1", "default", "BestEffort", vec![], vec![]);

        cache.add_pod("u1", p);
        assert!(cache.known_pod("u1"));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get_pod("u1").unwrap().metadata.namespace.as_deref(),
            Some("default")
        );

        cache.del_pod("u1");
        assert!(!cache.known_pod("u1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_add_container_strips_runtime_prefix() {
        let cache = ContainerCache::new();
        let p = pod("u1", "default", "BestEffort", vec![], vec![status("app", "abc")]);

        cache.add_container(&p);

        assert_eq!(cache.get_container_name("u1", "abc").as_deref(), Some("app"));
        assert_eq!(cache.get_container_name("u1", "docker://abc"), None);
        assert_eq!(cache.get_container_name("u2", "abc"), None);
    }

    #[test]
    fn test_add_container_is_idempotent() {
        let cache = ContainerCache::new();
        let p = pod(
            "u1",
            "default",
            "BestEffort",
            vec![],
            vec![status("app", "abc"), status("sidecar", "def")],
        );

        cache.add_container(&p);
        let first = cache.get_container("u1").unwrap();
        cache.add_container(&p);
        let second = cache.get_container("u1").unwrap();

        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_add_container_keeps_removed_entries() {
        let cache = ContainerCache::new();
        cache.add_container(&pod("u1", "default", "BestEffort", vec![], vec![status("app", "abc")]));
        // Container restarted with a new runtime id
        cache.add_container(&pod("u1", "default", "BestEffort", vec![], vec![status("app", "fed")]));

        let map = cache.get_container("u1").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["abc"], "app");
        assert_eq!(map["fed"], "app");
    }

    #[test]
    fn test_populate_if_absent() {
        let cache = ContainerCache::new();
        let empty = pod("u1", "default", "BestEffort", vec![], vec![]);
        let running = pod("u1", "default", "BestEffort", vec![], vec![status("app", "abc")]);

        // A pod without statuses leaves the map empty, so a later call still populates
        assert!(cache.populate_if_absent(&empty));
        assert!(!cache.has_identities("u1"));
        assert!(cache.populate_if_absent(&running));
        assert!(cache.has_identities("u1"));
        assert!(!cache.populate_if_absent(&running));
    }

    #[test]
    fn test_del_container() {
        let cache = ContainerCache::new();
        cache.add_container(&pod("u1", "default", "BestEffort", vec![], vec![status("app", "abc")]));

        cache.del_container("u1");

        assert!(cache.get_container("u1").is_none());
        assert!(cache.is_empty());
    }
}
