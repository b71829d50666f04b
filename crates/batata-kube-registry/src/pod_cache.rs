//! Pod IP index
//!
//! Maps pod IPs to `namespace/name` keys of the pod store. The index is only
//! mutated on the queue worker; lookups read through to the raw pod store.

use std::sync::Arc;

use batata_mesh::{Labels, XdsUpdater};
use dashmap::DashMap;
use tracing::debug;

use crate::objects::{KubePod, KubeResource};
use crate::store::{ObjectStore, ResourceEvent};

pub struct PodCache {
    /// pod ip -> pod key
    keys: DashMap<String, String>,
}

impl PodCache {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Update the IP index for a pod event
    ///
    /// Every index change is reported through `workload_update`; removals carry
    /// empty labels. Returns the IP when it newly resolves to this pod.
    pub fn on_event(
        &self,
        event: &ResourceEvent<KubePod>,
        updater: &dyn XdsUpdater,
    ) -> Option<String> {
        match event {
            ResourceEvent::Added(pod) => {
                if !pod.pod_ip.is_empty() && pod.phase.holds_ip() {
                    return self.index(pod, updater);
                }
                None
            }
            ResourceEvent::Updated { old, new } => {
                if !old.pod_ip.is_empty() && old.pod_ip != new.pod_ip {
                    self.unindex(&old.pod_ip, &old.key(), updater);
                }
                if new.pod_ip.is_empty() {
                    return None;
                }
                if new.phase.holds_ip() {
                    self.index(new, updater)
                } else {
                    self.unindex(&new.pod_ip, &new.key(), updater);
                    None
                }
            }
            ResourceEvent::Deleted(pod) => {
                if !pod.pod_ip.is_empty() {
                    self.unindex(&pod.pod_ip, &pod.key(), updater);
                }
                None
            }
        }
    }

    fn index(&self, pod: &KubePod, updater: &dyn XdsUpdater) -> Option<String> {
        let key = pod.key();
        debug!(ip = %pod.pod_ip, pod = %key, "Indexing pod ip");
        let previous = self.keys.insert(pod.pod_ip.clone(), key.clone());
        updater.workload_update(&pod.pod_ip, &pod.labels, &pod.annotations);
        (previous.as_deref() != Some(key.as_str())).then(|| pod.pod_ip.clone())
    }

    /// Drop `ip` only while it still belongs to the pod `key`
    fn unindex(&self, ip: &str, key: &str, updater: &dyn XdsUpdater) {
        if self.keys.remove_if(ip, |_, k| k == key).is_some() {
            debug!(ip = %ip, pod = %key, "Removed pod ip");
            updater.workload_update(ip, &Labels::new(), &Labels::new());
        }
    }

    /// Key of the pod currently owning `ip`
    pub fn key_by_ip(&self, ip: &str) -> Option<String> {
        self.keys.get(ip).map(|e| e.value().clone())
    }

    pub fn get_pod_by_ip(&self, pods: &ObjectStore<KubePod>, ip: &str) -> Option<Arc<KubePod>> {
        let key = self.key_by_ip(ip)?;
        pods.get(&key)
    }

    pub fn labels_by_ip(&self, pods: &ObjectStore<KubePod>, ip: &str) -> Option<Labels> {
        self.get_pod_by_ip(pods, ip).map(|pod| pod.labels.clone())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for PodCache {
    fn default() -> Self {
        Self::new()
    }
}
