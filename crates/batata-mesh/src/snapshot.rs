//! Endpoint Snapshot Management
//!
//! Versioned, per-hostname endpoint sets as received from registries. Each
//! registry cluster owns one shard per hostname, and every update replaces
//! that shard wholesale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::model::IstioEndpoint;

/// Version generator for endpoint shards
static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique version string
fn generate_version() -> String {
    let version = VERSION_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}", version)
}

/// Endpoints of one hostname, split by registry cluster
#[derive(Debug, Clone, Default)]
pub struct EndpointShards {
    /// Service short name (first label of the hostname)
    pub service_name: String,
    /// Namespace of the service
    pub namespace: String,
    /// cluster id -> endpoints reported by that cluster
    pub shards: BTreeMap<String, Vec<IstioEndpoint>>,
    /// Version of the latest change
    pub version: String,
    /// Timestamp of the latest change
    pub updated_at: i64,
}

impl EndpointShards {
    /// All endpoints across clusters, in cluster id order
    pub fn all_endpoints(&self) -> Vec<IstioEndpoint> {
        self.shards.values().flatten().cloned().collect()
    }

    pub fn total_count(&self) -> usize {
        self.shards.values().map(Vec::len).sum()
    }
}

/// Snapshot statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Number of hostnames with at least one shard
    pub hostnames: usize,
    /// Number of endpoints across all hostnames
    pub endpoints: usize,
}

/// Endpoint snapshot keyed by hostname
#[derive(Debug, Default)]
pub struct EndpointSnapshot {
    by_hostname: DashMap<String, EndpointShards>,
}

impl EndpointSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the shard of `cluster_id` for `hostname`
    ///
    /// An empty endpoint list removes the shard; the hostname disappears once
    /// no cluster has a shard for it. Returns the new version.
    pub fn update(
        &self,
        cluster_id: &str,
        hostname: &str,
        namespace: &str,
        endpoints: Vec<IstioEndpoint>,
    ) -> String {
        let version = generate_version();
        let now = chrono::Utc::now().timestamp_millis();
        let count = endpoints.len();

        {
            let mut entry = self
                .by_hostname
                .entry(hostname.to_string())
                .or_insert_with(|| EndpointShards {
                    service_name: hostname.split('.').next().unwrap_or_default().to_string(),
                    namespace: namespace.to_string(),
                    ..Default::default()
                });

            if endpoints.is_empty() {
                entry.shards.remove(cluster_id);
            } else {
                entry.shards.insert(cluster_id.to_string(), endpoints);
            }
            entry.version = version.clone();
            entry.updated_at = now;
        }
        self.by_hostname.remove_if(hostname, |_, e| e.shards.is_empty());

        debug!(
            hostname = %hostname,
            cluster_id = %cluster_id,
            endpoints = count,
            version = %version,
            "Updated endpoint shard"
        );
        version
    }

    /// Drop the shards a cluster holds for a deleted service
    pub fn remove_service(&self, cluster_id: &str, name: &str, namespace: &str) {
        for mut entry in self.by_hostname.iter_mut() {
            if entry.service_name == name && entry.namespace == namespace {
                entry.shards.remove(cluster_id);
            }
        }
        self.by_hostname.retain(|_, e| !e.shards.is_empty());
    }

    /// Endpoints of a hostname across all clusters
    pub fn endpoints(&self, hostname: &str) -> Vec<IstioEndpoint> {
        self.by_hostname
            .get(hostname)
            .map(|e| e.all_endpoints())
            .unwrap_or_default()
    }

    /// Endpoints a single cluster reported for a hostname
    pub fn cluster_endpoints(&self, cluster_id: &str, hostname: &str) -> Vec<IstioEndpoint> {
        self.by_hostname
            .get(hostname)
            .and_then(|e| e.shards.get(cluster_id).cloned())
            .unwrap_or_default()
    }

    /// Version of the latest change of a hostname
    pub fn version(&self, hostname: &str) -> Option<String> {
        self.by_hostname.get(hostname).map(|e| e.version.clone())
    }

    /// All hostnames, sorted
    pub fn hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_hostname.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            hostnames: self.by_hostname.len(),
            endpoints: self.by_hostname.iter().map(|e| e.total_count()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceAttributes, TlsMode};

    fn endpoint(address: &str) -> IstioEndpoint {
        IstioEndpoint {
            address: address.to_string(),
            endpoint_port: 9376,
            service_port_name: "http".to_string(),
            labels: Default::default(),
            uid: String::new(),
            service_account: String::new(),
            network: String::new(),
            locality: String::new(),
            attributes: ServiceAttributes {
                name: "foo".to_string(),
                namespace: "ns".to_string(),
                ..Default::default()
            },
            tls_mode: TlsMode::Disabled,
        }
    }

    const HOST: &str = "foo.ns.svc.cluster.local";

    #[test]
    fn test_update_replaces_shard() {
        let snapshot = EndpointSnapshot::new();
        snapshot.update("c1", HOST, "ns", vec![endpoint("10.0.0.1"), endpoint("10.0.0.2")]);
        snapshot.update("c1", HOST, "ns", vec![endpoint("10.0.0.3")]);

        let endpoints = snapshot.endpoints(HOST);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].address, "10.0.0.3");
    }

    #[test]
    fn test_shards_are_per_cluster() {
        let snapshot = EndpointSnapshot::new();
        snapshot.update("c1", HOST, "ns", vec![endpoint("10.0.0.1")]);
        snapshot.update("c2", HOST, "ns", vec![endpoint("10.1.0.1")]);

        assert_eq!(snapshot.endpoints(HOST).len(), 2);
        assert_eq!(snapshot.cluster_endpoints("c2", HOST)[0].address, "10.1.0.1");

        snapshot.update("c1", HOST, "ns", Vec::new());
        assert_eq!(snapshot.endpoints(HOST).len(), 1);
        assert_eq!(snapshot.stats(), SnapshotStats { hostnames: 1, endpoints: 1 });
    }

    #[test]
    fn test_empty_update_removes_hostname() {
        let snapshot = EndpointSnapshot::new();
        snapshot.update("c1", HOST, "ns", vec![endpoint("10.0.0.1")]);
        snapshot.update("c1", HOST, "ns", Vec::new());

        assert!(snapshot.hostnames().is_empty());
        assert!(snapshot.version(HOST).is_none());
    }

    #[test]
    fn test_remove_service() {
        let snapshot = EndpointSnapshot::new();
        snapshot.update("c1", HOST, "ns", vec![endpoint("10.0.0.1")]);
        snapshot.update("c1", "bar.ns.svc.cluster.local", "ns", vec![endpoint("10.0.0.9")]);

        snapshot.remove_service("c1", "foo", "ns");
        assert_eq!(snapshot.hostnames(), vec!["bar.ns.svc.cluster.local"]);
    }

    #[test]
    fn test_version_generation() {
        let v1 = generate_version();
        let v2 = generate_version();
        assert_ne!(v1, v2);
    }
}
