//! Kubernetes resource records
//!
//! Lightweight, owned copies of the fields the registry reads from Services,
//! Endpoints, Pods and Nodes. Watchers convert `k8s-openapi` objects into
//! these (see `conversion`), which keeps the rest of the crate free of the
//! API machinery and makes objects easy to build in tests.

use std::fmt;

use batata_mesh::Labels;
use serde::{Deserialize, Serialize};

/// Store key of a namespaced object
pub fn key_func(name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Watched resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Service,
    Endpoints,
    Pod,
    Node,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Service,
        ResourceKind::Endpoints,
        ResourceKind::Pod,
        ResourceKind::Node,
    ];

    /// Name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Service => "Services",
            ResourceKind::Endpoints => "Endpoints",
            ResourceKind::Pod => "Pods",
            ResourceKind::Node => "Nodes",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common accessors of watched objects
pub trait KubeResource: fmt::Debug + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn name(&self) -> &str;

    fn namespace(&self) -> &str;

    fn key(&self) -> String {
        key_func(self.name(), self.namespace())
    }

    /// Whether an update from `other` to `self` can be skipped
    fn is_equivalent(&self, other: &Self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl ServiceType {
    pub fn parse(s: &str) -> ServiceType {
        match s {
            "NodePort" => ServiceType::NodePort,
            "LoadBalancer" => ServiceType::LoadBalancer,
            "ExternalName" => ServiceType::ExternalName,
            _ => ServiceType::ClusterIp,
        }
    }
}

/// Port on the pod a service port forwards to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPort {
    Number(i32),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeServicePort {
    pub name: String,
    /// `TCP`, `UDP` or `SCTP`
    pub protocol: String,
    pub port: i32,
    pub target_port: TargetPort,
    pub node_port: Option<i32>,
}

impl KubeServicePort {
    pub fn new(name: impl Into<String>, port: i32, target_port: TargetPort) -> Self {
        Self {
            name: name.into(),
            protocol: "TCP".to_string(),
            port,
            target_port,
            node_port: None,
        }
    }
}

/// Value of `spec.clusterIP` for headless services
pub const CLUSTER_IP_NONE: &str = "None";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeService {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub labels: Labels,
    pub annotations: Labels,
    pub selector: Labels,
    pub service_type: ServiceType,
    pub cluster_ip: Option<String>,
    pub external_name: Option<String>,
    pub ports: Vec<KubeServicePort>,
}

impl KubeService {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn is_headless(&self) -> bool {
        self.cluster_ip.as_deref() == Some(CLUSTER_IP_NONE)
    }
}

impl KubeResource for KubeService {
    const KIND: ResourceKind = ResourceKind::Service;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn is_equivalent(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
    pub hostname: Option<String>,
    pub node_name: Option<String>,
    pub target_ref: Option<ObjectReference>,
}

impl EndpointAddress {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Default::default()
        }
    }

    /// Address backed by the named pod
    pub fn for_pod(ip: impl Into<String>, pod: &str, namespace: &str) -> Self {
        Self {
            ip: ip.into(),
            target_ref: Some(ObjectReference {
                kind: "Pod".to_string(),
                name: pod.to_string(),
                namespace: namespace.to_string(),
            }),
            ..Default::default()
        }
    }

    pub fn targets_pod(&self) -> bool {
        self.target_ref
            .as_ref()
            .map(|r| r.kind == "Pod")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub name: String,
    pub port: i32,
    pub protocol: String,
}

impl EndpointPort {
    pub fn new(name: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            port,
            protocol: "TCP".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
    pub not_ready_addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeEndpoints {
    pub name: String,
    pub namespace: String,
    pub resource_version: String,
    pub subsets: Vec<EndpointSubset>,
}

impl KubeEndpoints {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// IPs of all ready addresses, in subset order
    pub fn ready_ips(&self) -> Vec<&str> {
        self.subsets
            .iter()
            .flat_map(|ss| ss.addresses.iter().map(|a| a.ip.as_str()))
            .collect()
    }
}

impl KubeResource for KubeEndpoints {
    const KIND: ResourceKind = ResourceKind::Endpoints;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Only ready addresses and ports matter; not-ready addresses and
    /// metadata churn never trigger a push.
    fn is_equivalent(&self, other: &Self) -> bool {
        self.subsets.len() == other.subsets.len()
            && self
                .subsets
                .iter()
                .zip(&other.subsets)
                .all(|(a, b)| a.ports == b.ports && a.addresses == b.addresses)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: i32,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> PodPhase {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Pods in these phases own their IP
    pub fn holds_ip(&self) -> bool {
        matches!(self, PodPhase::Pending | PodPhase::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubePod {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub labels: Labels,
    pub annotations: Labels,
    pub node_name: String,
    pub service_account: String,
    pub pod_ip: String,
    pub phase: PodPhase,
    pub containers: Vec<ContainerSpec>,
}

impl KubePod {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            service_account: "default".to_string(),
            ..Default::default()
        }
    }
}

impl KubeResource for KubePod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn is_equivalent(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeNode {
    pub name: String,
    pub resource_version: String,
    pub labels: Labels,
}

impl KubeNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl KubeResource for KubeNode {
    const KIND: ResourceKind = ResourceKind::Node;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        ""
    }

    fn is_equivalent(&self, other: &Self) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(version: &str, ready: &[&str], not_ready: &[&str]) -> KubeEndpoints {
        KubeEndpoints {
            resource_version: version.to_string(),
            subsets: vec![EndpointSubset {
                addresses: ready.iter().map(|ip| EndpointAddress::new(*ip)).collect(),
                not_ready_addresses: not_ready.iter().map(|ip| EndpointAddress::new(*ip)).collect(),
                ports: vec![EndpointPort::new("http", 9376)],
            }],
            ..KubeEndpoints::new("foo", "ns")
        }
    }

    #[test]
    fn test_key_func() {
        assert_eq!(key_func("foo", "ns"), "ns/foo");
        assert_eq!(key_func("node-1", ""), "node-1");
        assert_eq!(KubeNode::new("node-1").key(), "node-1");
    }

    #[test]
    fn test_endpoints_equivalence_ignores_metadata() {
        let a = endpoints("1", &["10.0.0.1"], &[]);
        let b = endpoints("2", &["10.0.0.1"], &["10.0.0.9"]);
        assert!(a.is_equivalent(&b));

        let c = endpoints("3", &["10.0.0.2"], &[]);
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn test_service_equivalence_is_full_equality() {
        let a = KubeService::new("foo", "ns");
        let mut b = a.clone();
        assert!(a.is_equivalent(&b));

        b.resource_version = "2".to_string();
        assert!(!a.is_equivalent(&b));
    }

    #[test]
    fn test_pod_phase() {
        assert!(PodPhase::parse("Running").holds_ip());
        assert!(PodPhase::parse("Pending").holds_ip());
        assert!(!PodPhase::parse("Succeeded").holds_ip());
        assert!(!PodPhase::parse("bogus").holds_ip());
    }

    #[test]
    fn test_headless() {
        let mut svc = KubeService::new("foo", "ns");
        assert!(!svc.is_headless());
        svc.cluster_ip = Some(CLUSTER_IP_NONE.to_string());
        assert!(svc.is_headless());
    }
}
