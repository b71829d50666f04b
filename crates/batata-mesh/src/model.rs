//! Mesh-facing service model
//!
//! Native Rust types describing services, instances and proxies as the
//! push pipeline sees them, independent of the registry they came from.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Key/value labels attached to workloads and services
pub type Labels = BTreeMap<String, String>;

/// Label used by a workload to declare its own locality
pub const LOCALITY_LABEL: &str = "istio-locality";

/// Label carrying the workload's TLS mode
pub const TLS_MODE_LABEL: &str = "security.istio.io/tlsMode";

/// Returns true when every entry of `subset` is present in `labels`.
pub fn is_subset_of(subset: &Labels, labels: &Labels) -> bool {
    subset
        .iter()
        .all(|(k, v)| labels.get(k).map(|value| value == v).unwrap_or(false))
}

/// An ordered collection of label sets, used as an "any of" filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelsCollection(pub Vec<Labels>);

impl LabelsCollection {
    pub fn new(sets: Vec<Labels>) -> Self {
        Self(sets)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&Labels> {
        self.0.first()
    }

    /// True if the collection is empty or one of its sets is a subset of `labels`.
    pub fn has_subset_of(&self, labels: &Labels) -> bool {
        self.0.is_empty() || self.0.iter().any(|set| is_subset_of(set, labels))
    }
}

impl From<Labels> for LabelsCollection {
    fn from(labels: Labels) -> Self {
        Self(vec![labels])
    }
}

/// Kind of change carried by a watch event or an update notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    Add,
    Update,
    Delete,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Add => "add",
            Event::Update => "update",
            Event::Delete => "delete",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application protocol of a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    Grpc,
    GrpcWeb,
    Http,
    Http2,
    Https,
    #[default]
    Tcp,
    Tls,
    Udp,
    Mongo,
    Redis,
    Mysql,
    Unsupported,
}

impl Protocol {
    /// Parse a protocol name, case-insensitively
    pub fn parse(s: &str) -> Protocol {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "grpc" => Protocol::Grpc,
            "grpc-web" => Protocol::GrpcWeb,
            "http" => Protocol::Http,
            "http2" => Protocol::Http2,
            "https" => Protocol::Https,
            "tls" => Protocol::Tls,
            "mongo" => Protocol::Mongo,
            "redis" => Protocol::Redis,
            "mysql" => Protocol::Mysql,
            _ => Protocol::Unsupported,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(
            self,
            Protocol::Http | Protocol::Http2 | Protocol::Grpc | Protocol::GrpcWeb
        )
    }
}

/// A named service port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Port {
    pub fn new(name: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            port,
            protocol,
        }
    }
}

/// Ordered set of service ports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortList(pub Vec<Port>);

impl PortList {
    /// Port by name
    pub fn get(&self, name: &str) -> Option<&Port> {
        self.0.iter().find(|p| p.name == name)
    }

    /// Port by number
    pub fn get_by_port(&self, number: u16) -> Option<&Port> {
        self.0.iter().find(|p| p.port == number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Port>> for PortList {
    fn from(ports: Vec<Port>) -> Self {
        Self(ports)
    }
}

/// How a proxy should resolve the backends of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Resolution {
    /// Proxy load-balances across the endpoints it is given
    #[default]
    ClientSideLb,
    /// Proxy resolves the service address through DNS
    DnsLb,
    /// Proxy forwards to the original destination
    Passthrough,
}

/// Registry attributes of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAttributes {
    /// Short name of the service in its registry
    pub name: String,
    /// Namespace of the service
    pub namespace: String,
    /// Registry cluster the service was discovered in
    pub cluster_id: String,
    /// Registry-independent unique id
    pub uid: String,
}

/// A mesh service, keyed by hostname
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub hostname: String,
    /// Virtual address, `0.0.0.0` when the service has none
    pub address: String,
    pub ports: PortList,
    /// Identities declared on the service itself
    pub service_accounts: Vec<String>,
    pub mesh_external: bool,
    pub resolution: Resolution,
    pub attributes: ServiceAttributes,
}

/// Health of an endpoint as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Endpoint is ready to receive traffic
    #[default]
    Healthy,
    /// Endpoint is known but not ready
    Unhealthy,
}

impl HealthStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// TLS mode a workload accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsMode {
    #[default]
    Disabled,
    Istio,
}

impl TlsMode {
    pub fn from_label(value: Option<&str>) -> TlsMode {
        match value {
            Some("istio") => TlsMode::Istio,
            _ => TlsMode::Disabled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::Disabled => "disabled",
            TlsMode::Istio => "istio",
        }
    }
}

/// Locality - identifies where a workload is running
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    /// Region (e.g., "us-west-1")
    pub region: String,
    /// Zone within region (e.g., "us-west-1a")
    pub zone: String,
    /// Sub-zone (e.g., "rack-1")
    pub sub_zone: String,
}

impl Locality {
    /// Create a new locality
    pub fn new(region: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            sub_zone: String::new(),
        }
    }

    /// Create with sub-zone
    pub fn with_sub_zone(mut self, sub_zone: impl Into<String>) -> Self {
        self.sub_zone = sub_zone.into();
        self
    }

    /// Parse a `region/zone/sub-zone` string; missing parts stay empty
    pub fn parse(s: &str) -> Self {
        let mut parts = s.splitn(3, '/');
        Self {
            region: parts.next().unwrap_or_default().to_string(),
            zone: parts.next().unwrap_or_default().to_string(),
            sub_zone: parts.next().unwrap_or_default().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty() && self.zone.is_empty() && self.sub_zone.is_empty()
    }

    /// Check if locality matches another (for filtering)
    pub fn matches(&self, other: &Locality) -> bool {
        // Empty fields match anything
        (self.region.is_empty() || self.region == other.region)
            && (self.zone.is_empty() || self.zone == other.zone)
            && (self.sub_zone.is_empty() || self.sub_zone == other.sub_zone)
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}/{}", self.region, self.zone)?;
        if !self.sub_zone.is_empty() {
            write!(f, "/{}", self.sub_zone)?;
        }
        Ok(())
    }
}

/// Network-level view of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub address: String,
    pub port: u16,
    /// Service port this endpoint serves
    pub service_port: Port,
    /// `region/zone`, empty when unknown
    pub locality: String,
    /// Mesh network the address belongs to, empty when unclassified
    pub network: String,
    /// Workload identifier used by policy enforcement, may be empty
    pub uid: String,
    pub health_status: HealthStatus,
}

/// One reachable backend of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub endpoint: NetworkEndpoint,
    pub service: Arc<Service>,
    pub labels: Labels,
    pub service_account: String,
    pub tls_mode: TlsMode,
}

/// Push-facing endpoint used for EDS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IstioEndpoint {
    pub address: String,
    pub endpoint_port: u32,
    pub service_port_name: String,
    pub labels: Labels,
    pub uid: String,
    pub service_account: String,
    pub network: String,
    pub locality: String,
    /// Name and namespace of the owning service
    pub attributes: ServiceAttributes,
    pub tls_mode: TlsMode,
}

/// Container port reported by a proxy about its own pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodPort {
    pub name: String,
    pub container_port: i32,
    pub protocol: String,
}

/// Out-of-band metadata a proxy sends when it connects.
///
/// Keys follow the node metadata convention (`CLUSTER_ID`, `POD_PORTS`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ProxyMetadata {
    /// Registry cluster the proxy runs in
    pub cluster_id: String,
    /// Network the proxy declares itself part of
    pub network: String,
    pub service_account: String,
    pub pod_ports: Vec<PodPort>,
}

/// A connected data-plane proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    pub ip_addresses: Vec<String>,
    pub config_namespace: String,
    pub workload_labels: LabelsCollection,
    pub locality: Option<Locality>,
    pub metadata: ProxyMetadata,
}

impl Proxy {
    pub fn primary_ip(&self) -> Option<&str> {
        self.ip_addresses.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_labels_subset() {
        let pod = labels(&[("app", "foo"), ("version", "v1")]);
        assert!(is_subset_of(&labels(&[("app", "foo")]), &pod));
        assert!(is_subset_of(&Labels::new(), &pod));
        assert!(!is_subset_of(&labels(&[("app", "bar")]), &pod));
        assert!(!is_subset_of(&labels(&[("tier", "web")]), &pod));
    }

    #[test]
    fn test_labels_collection_any_of() {
        let pod = labels(&[("app", "foo")]);
        assert!(LabelsCollection::default().has_subset_of(&pod));
        assert!(LabelsCollection::default().has_subset_of(&Labels::new()));

        let filter = LabelsCollection::new(vec![
            labels(&[("app", "bar")]),
            labels(&[("app", "foo")]),
        ]);
        assert!(filter.has_subset_of(&pod));
        assert!(!filter.has_subset_of(&Labels::new()));
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse("HTTP"), Protocol::Http);
        assert_eq!(Protocol::parse("grpc-web"), Protocol::GrpcWeb);
        assert_eq!(Protocol::parse("thrift"), Protocol::Unsupported);
        assert!(Protocol::Grpc.is_http());
        assert!(!Protocol::Tcp.is_http());
    }

    #[test]
    fn test_port_list_lookup() {
        let ports = PortList::from(vec![
            Port::new("http", 8080, Protocol::Http),
            Port::new("grpc", 9090, Protocol::Grpc),
        ]);
        assert_eq!(ports.get("grpc").map(|p| p.port), Some(9090));
        assert_eq!(ports.get_by_port(8080).map(|p| p.name.as_str()), Some("http"));
        assert!(ports.get("admin").is_none());
        assert!(ports.get_by_port(1).is_none());
    }

    #[test]
    fn test_locality_parse_and_display() {
        let locality = Locality::parse("us-east/1a");
        assert_eq!(locality, Locality::new("us-east", "1a"));
        assert_eq!(locality.to_string(), "us-east/1a");

        let full = Locality::parse("us-east/1a/rack-2");
        assert_eq!(full.sub_zone, "rack-2");
        assert_eq!(full.to_string(), "us-east/1a/rack-2");

        assert_eq!(Locality::default().to_string(), "");
    }

    #[test]
    fn test_locality_matches() {
        let filter = Locality::new("us-east", "");
        assert!(filter.matches(&Locality::new("us-east", "1a")));
        assert!(!filter.matches(&Locality::new("eu-west", "1a")));
    }

    #[test]
    fn test_proxy_metadata_from_node_json() {
        let json = r#"{
            "CLUSTER_ID": "cluster-1",
            "NETWORK": "net-a",
            "POD_PORTS": [{"name": "http", "containerPort": 8080, "protocol": "TCP"}]
        }"#;

        let metadata: ProxyMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.cluster_id, "cluster-1");
        assert_eq!(metadata.network, "net-a");
        assert!(metadata.service_account.is_empty());
        assert_eq!(metadata.pod_ports.len(), 1);
        assert_eq!(metadata.pod_ports[0].container_port, 8080);
    }

    #[test]
    fn test_tls_mode_from_label() {
        assert_eq!(TlsMode::from_label(Some("istio")), TlsMode::Istio);
        assert_eq!(TlsMode::from_label(Some("disabled")), TlsMode::Disabled);
        assert_eq!(TlsMode::from_label(None), TlsMode::Disabled);
    }
}
