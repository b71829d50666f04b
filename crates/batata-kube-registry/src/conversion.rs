//! Kubernetes to mesh model conversion
//!
//! Two directions live here: `k8s-openapi` objects into the crate's resource
//! records, and resource records into mesh `Service`s and their attributes.

use std::collections::BTreeSet;
use std::sync::Arc;

use batata_mesh::model::TLS_MODE_LABEL;
use batata_mesh::{
    HealthStatus, Labels, NetworkEndpoint, Port, PortList, Protocol, Resolution, Service,
    ServiceAttributes, ServiceInstance, TlsMode,
};
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service as K8sService};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::objects::{
    ContainerPort, ContainerSpec, EndpointAddress, EndpointPort, EndpointSubset, KubeEndpoints,
    KubeNode, KubePod, KubeService, KubeServicePort, ObjectReference, PodPhase, ServiceType,
    TargetPort,
};

/// Address of services without a virtual IP
pub const UNSPECIFIED_IP: &str = "0.0.0.0";

/// Service accounts declared directly in SPIFFE form
pub const CANONICAL_SERVICE_ACCOUNTS_ANNOTATION: &str = "alpha.istio.io/canonical-serviceaccounts";

/// Kubernetes service accounts, converted to SPIFFE form
pub const KUBE_SERVICE_ACCOUNTS_ANNOTATION: &str = "alpha.istio.io/kubernetes-serviceaccounts";

const DEFAULT_PROTOCOL: &str = "TCP";

fn meta_name(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn meta_namespace(meta: &ObjectMeta) -> String {
    meta.namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

fn meta_labels(meta: &ObjectMeta) -> Labels {
    meta.labels.clone().unwrap_or_default()
}

fn meta_annotations(meta: &ObjectMeta) -> Labels {
    meta.annotations.clone().unwrap_or_default()
}

impl From<&K8sService> for KubeService {
    fn from(svc: &K8sService) -> Self {
        let metadata = &svc.metadata;
        let spec = svc.spec.as_ref();

        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ps| {
                ps.iter()
                    .map(|p| KubeServicePort {
                        name: p.name.clone().unwrap_or_default(),
                        protocol: p
                            .protocol
                            .clone()
                            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
                        port: p.port,
                        // The API server defaults an omitted targetPort to the port itself
                        target_port: match &p.target_port {
                            Some(IntOrString::Int(i)) => TargetPort::Number(*i),
                            Some(IntOrString::String(s)) => TargetPort::Name(s.clone()),
                            None => TargetPort::Number(p.port),
                        },
                        node_port: p.node_port,
                    })
                    .collect()
            })
            .unwrap_or_default();

        KubeService {
            name: meta_name(metadata),
            namespace: meta_namespace(metadata),
            uid: metadata.uid.clone().unwrap_or_default(),
            resource_version: metadata.resource_version.clone().unwrap_or_default(),
            labels: meta_labels(metadata),
            annotations: meta_annotations(metadata),
            selector: spec.and_then(|s| s.selector.clone()).unwrap_or_default(),
            service_type: spec
                .and_then(|s| s.type_.as_deref())
                .map(ServiceType::parse)
                .unwrap_or_default(),
            cluster_ip: spec.and_then(|s| s.cluster_ip.clone()),
            external_name: spec.and_then(|s| s.external_name.clone()),
            ports,
        }
    }
}

fn convert_addresses(addresses: Option<&Vec<k8s_openapi::api::core::v1::EndpointAddress>>) -> Vec<EndpointAddress> {
    addresses
        .map(|addrs| {
            addrs
                .iter()
                .map(|a| EndpointAddress {
                    ip: a.ip.clone(),
                    hostname: a.hostname.clone(),
                    node_name: a.node_name.clone(),
                    target_ref: a.target_ref.as_ref().map(|r| ObjectReference {
                        kind: r.kind.clone().unwrap_or_default(),
                        name: r.name.clone().unwrap_or_default(),
                        namespace: r.namespace.clone().unwrap_or_default(),
                    }),
                })
                .collect()
        })
        .unwrap_or_default()
}

impl From<&Endpoints> for KubeEndpoints {
    fn from(ep: &Endpoints) -> Self {
        let subsets = ep
            .subsets
            .as_ref()
            .map(|subsets| {
                subsets
                    .iter()
                    .map(|ss| EndpointSubset {
                        addresses: convert_addresses(ss.addresses.as_ref()),
                        not_ready_addresses: convert_addresses(ss.not_ready_addresses.as_ref()),
                        ports: ss
                            .ports
                            .as_ref()
                            .map(|ps| {
                                ps.iter()
                                    .map(|p| EndpointPort {
                                        name: p.name.clone().unwrap_or_default(),
                                        port: p.port,
                                        protocol: p
                                            .protocol
                                            .clone()
                                            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
                                    })
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        KubeEndpoints {
            name: meta_name(&ep.metadata),
            namespace: meta_namespace(&ep.metadata),
            resource_version: ep.metadata.resource_version.clone().unwrap_or_default(),
            subsets,
        }
    }
}

impl From<&Pod> for KubePod {
    fn from(pod: &Pod) -> Self {
        let metadata = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let containers = spec
            .map(|s| {
                s.containers
                    .iter()
                    .map(|c| ContainerSpec {
                        name: c.name.clone(),
                        ports: c
                            .ports
                            .as_ref()
                            .map(|ps| {
                                ps.iter()
                                    .map(|p| ContainerPort {
                                        name: p.name.clone().unwrap_or_default(),
                                        container_port: p.container_port,
                                        protocol: p
                                            .protocol
                                            .clone()
                                            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
                                    })
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        KubePod {
            name: meta_name(metadata),
            namespace: meta_namespace(metadata),
            uid: metadata.uid.clone().unwrap_or_default(),
            resource_version: metadata.resource_version.clone().unwrap_or_default(),
            labels: meta_labels(metadata),
            annotations: meta_annotations(metadata),
            node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
            service_account: spec
                .and_then(|s| s.service_account_name.clone())
                .unwrap_or_else(|| "default".to_string()),
            pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.as_deref())
                .map(PodPhase::parse)
                .unwrap_or_default(),
            containers,
        }
    }
}

impl From<&Node> for KubeNode {
    fn from(node: &Node) -> Self {
        KubeNode {
            name: meta_name(&node.metadata),
            resource_version: node.metadata.resource_version.clone().unwrap_or_default(),
            labels: meta_labels(&node.metadata),
        }
    }
}

/// `<name>.<namespace>.svc.<domain_suffix>`
pub fn service_hostname(name: &str, namespace: &str, domain_suffix: &str) -> String {
    format!("{}.{}.svc.{}", name, namespace, domain_suffix)
}

/// SPIFFE identity of a Kubernetes service account
pub fn spiffe_uri(trust_domain: &str, namespace: &str, service_account: &str) -> String {
    format!(
        "spiffe://{}/ns/{}/sa/{}",
        trust_domain, namespace, service_account
    )
}

/// SPIFFE identity the pod's workload presents
pub fn secure_naming_san(pod: &KubePod, trust_domain: &str) -> String {
    spiffe_uri(trust_domain, &pod.namespace, &pod.service_account)
}

/// TLS mode from the pod's label, disabled for unknown pods
pub fn pod_tls_mode(pod: Option<&KubePod>) -> TlsMode {
    pod.map(|p| TlsMode::from_label(p.labels.get(TLS_MODE_LABEL).map(String::as_str)))
        .unwrap_or_default()
}

/// Workload uid used by policy enforcement
pub fn workload_uid(pod: &KubePod) -> String {
    format!("kubernetes://{}.{}", pod.name, pod.namespace)
}

/// Mesh protocol of a service port
///
/// UDP ports are UDP. Otherwise the name prefix before the first `-`
/// selects the protocol (`http-web` is HTTP), falling back to TCP.
pub fn convert_protocol(name: &str, protocol: &str) -> Protocol {
    if protocol.eq_ignore_ascii_case("UDP") {
        return Protocol::Udp;
    }

    let prefix = name.split('-').next().unwrap_or_default();
    match Protocol::parse(prefix) {
        Protocol::Udp | Protocol::Unsupported => Protocol::Tcp,
        p => p,
    }
}

fn convert_port(port: &KubeServicePort) -> Option<Port> {
    let number = u16::try_from(port.port).ok()?;
    Some(Port::new(
        port.name.clone(),
        number,
        convert_protocol(&port.name, &port.protocol),
    ))
}

/// Convert a Kubernetes service into a mesh service
pub fn convert_service(
    svc: &KubeService,
    domain_suffix: &str,
    cluster_id: &str,
    trust_domain: &str,
) -> Service {
    let mut address = UNSPECIFIED_IP.to_string();
    if let Some(ip) = svc.cluster_ip.as_deref()
        && !ip.is_empty()
        && ip != crate::objects::CLUSTER_IP_NONE
    {
        address = ip.to_string();
    }

    let mut resolution = Resolution::ClientSideLb;
    let mut mesh_external = false;
    let external_name = svc.external_name.as_deref().unwrap_or_default();
    let is_external = svc.service_type == ServiceType::ExternalName && !external_name.is_empty();
    if is_external {
        resolution = Resolution::DnsLb;
        mesh_external = true;
    }
    // Headless services are not load balanced by the proxy
    if address == UNSPECIFIED_IP && !is_external {
        resolution = Resolution::Passthrough;
    }

    let ports: Vec<Port> = svc
        .ports
        .iter()
        .filter_map(|p| {
            let converted = convert_port(p);
            if converted.is_none() {
                debug!(service = %svc.name, namespace = %svc.namespace, port = p.port, "Skipping out of range port");
            }
            converted
        })
        .collect();

    let mut service_accounts = BTreeSet::new();
    if let Some(accounts) = svc.annotations.get(CANONICAL_SERVICE_ACCOUNTS_ANNOTATION) {
        for sa in accounts.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            service_accounts.insert(sa.to_string());
        }
    }
    if let Some(accounts) = svc.annotations.get(KUBE_SERVICE_ACCOUNTS_ANNOTATION) {
        for ksa in accounts.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            service_accounts.insert(spiffe_uri(trust_domain, &svc.namespace, ksa));
        }
    }

    Service {
        hostname: service_hostname(&svc.name, &svc.namespace, domain_suffix),
        address,
        ports: PortList::from(ports),
        service_accounts: service_accounts.into_iter().collect(),
        mesh_external,
        resolution,
        attributes: ServiceAttributes {
            name: svc.name.clone(),
            namespace: svc.namespace.clone(),
            cluster_id: cluster_id.to_string(),
            uid: format!("istio://{}/services/{}", svc.namespace, svc.name),
        },
    }
}

/// Instances of an `ExternalName` service, built from the service alone
///
/// Returns an empty list for every other service type.
pub fn external_name_instances(svc: &KubeService, service: &Arc<Service>) -> Vec<ServiceInstance> {
    let Some(external_name) = svc.external_name.as_deref() else {
        return Vec::new();
    };
    if svc.service_type != ServiceType::ExternalName || external_name.is_empty() {
        return Vec::new();
    }

    svc.ports
        .iter()
        .filter_map(convert_port)
        .map(|port| ServiceInstance {
            endpoint: NetworkEndpoint {
                address: external_name.to_string(),
                port: port.port,
                service_port: port,
                locality: String::new(),
                network: String::new(),
                uid: String::new(),
                health_status: HealthStatus::Healthy,
            },
            service: service.clone(),
            labels: svc.labels.clone(),
            service_account: String::new(),
            tls_mode: TlsMode::Disabled,
        })
        .collect()
}
