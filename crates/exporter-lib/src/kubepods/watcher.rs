//! Pod lifecycle events from the Kubernetes API
//!
//! Watches pods scheduled to this node and turns the watch stream into
//! added / updated / deleted callbacks for pods that request GPU resources.

use super::pod::{pod_uid, requests_gpu};
use crate::health::{components, HealthRegistry};
use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Pod lifecycle events
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// A GPU pod appeared on this node
    Added(Pod),
    /// A known pod changed
    Updated { old: Pod, new: Pod },
    /// A known pod was removed
    Deleted(Pod),
}

/// Receiver of pod lifecycle callbacks
pub trait PodEventHandler: Send + Sync {
    fn on_add(&self, pod: &Pod);
    fn on_update(&self, old: &Pod, new: &Pod);
    fn on_delete(&self, pod: &Pod);

    fn handle(&self, event: &PodEvent) {
        match event {
            PodEvent::Added(pod) => self.on_add(pod),
            PodEvent::Updated { old, new } => self.on_update(old, new),
            PodEvent::Deleted(pod) => self.on_delete(pod),
        }
    }
}

/// Turns raw watch events into lifecycle events
///
/// The watch stream only reports "applied" objects, so the translator
/// remembers the last seen version of every pod to tell additions from
/// updates, and diffs relists to recover deletions missed while disconnected.
#[derive(Debug, Default)]
pub struct PodEventTranslator {
    labels: Vec<String>,
    known: HashMap<String, Pod>,
}

impl PodEventTranslator {
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            known: HashMap::new(),
        }
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn translate(&mut self, event: watcher::Event<Pod>) -> Vec<PodEvent> {
        match event {
            watcher::Event::Applied(pod) => self.applied(pod).into_iter().collect(),
            watcher::Event::Deleted(pod) => self.deleted(pod).into_iter().collect(),
            watcher::Event::Restarted(pods) => self.restarted(pods),
        }
    }

    fn applied(&mut self, pod: Pod) -> Option<PodEvent> {
        let uid = pod_uid(&pod)?.to_string();
        if !self.known.contains_key(&uid) && !requests_gpu(&pod, &self.labels) {
            return None;
        }
        match self.known.insert(uid, pod.clone()) {
            Some(old) => Some(PodEvent::Updated { old, new: pod }),
            None => Some(PodEvent::Added(pod)),
        }
    }

    fn deleted(&mut self, pod: Pod) -> Option<PodEvent> {
        let uid = pod_uid(&pod)?;
        self.known.remove(uid).map(|_| PodEvent::Deleted(pod))
    }

    fn restarted(&mut self, pods: Vec<Pod>) -> Vec<PodEvent> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for pod in pods {
            if let Some(uid) = pod_uid(&pod) {
                seen.insert(uid.to_string());
            }
            events.extend(self.applied(pod));
        }

        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|uid| !seen.contains(*uid))
            .cloned()
            .collect();
        for uid in gone {
            if let Some(pod) = self.known.remove(&uid) {
                events.push(PodEvent::Deleted(pod));
            }
        }

        events
    }
}

/// Kubernetes pod watcher scoped to one node
pub struct PodWatcher {
    client: Client,
    node_name: String,
    labels: Vec<String>,
    health: Option<HealthRegistry>,
}

impl PodWatcher {
    pub fn new(client: Client, node_name: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            labels,
            health: None,
        }
    }

    /// Report watch stream state on the `pod_watcher` health component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Connect using in-cluster configuration or the local kubeconfig
    pub async fn try_default(node_name: impl Into<String>, labels: Vec<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, node_name, labels))
    }

    /// Deliver events to `handler` until shutdown or the stream ends
    pub async fn run(
        self,
        handler: Arc<dyn PodEventHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let api: Api<Pod> = Api::all(self.client.clone());
        let selector = format!("spec.nodeName={}", self.node_name);
        let config = watcher::Config::default().fields(&selector);
        let stream = watcher(api, config).default_backoff();
        let mut stream = std::pin::pin!(stream);
        let mut translator = PodEventTranslator::new(self.labels.clone());

        info!(node = %self.node_name, "Watching pods on node");

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if let Some(health) = &self.health {
                            health.set_healthy(components::POD_WATCHER).await;
                        }
                        for pod_event in translator.translate(event) {
                            let (kind, uid) = describe(&pod_event);
                            debug!(kind, pod_uid = %uid, "Pod event");
                            handler.handle(&pod_event);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Pod watch error, retrying with backoff");
                        if let Some(health) = &self.health {
                            health
                                .set_degraded(components::POD_WATCHER, e.to_string())
                                .await;
                        }
                    }
                    None => {
                        warn!("Pod watch stream ended");
                        if let Some(health) = &self.health {
                            health
                                .set_unhealthy(components::POD_WATCHER, "watch stream ended")
                                .await;
                        }
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down pod watcher");
                    break;
                }
            }
        }
    }
}

fn describe(event: &PodEvent) -> (&'static str, &str) {
    let (kind, pod) = match event {
        PodEvent::Added(pod) => ("added", pod),
        PodEvent::Updated { new, .. } => ("updated", new),
        PodEvent::Deleted(pod) => ("deleted", pod),
    };
    (kind, pod_uid(pod).unwrap_or_default())
}
