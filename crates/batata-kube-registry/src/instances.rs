//! Service instance resolution
//!
//! Answers "which instances back this service port" and "which service
//! instances does this proxy implement" from the controller's caches.

use std::collections::BTreeSet;
use std::sync::Arc;

use batata_mesh::model::is_subset_of;
use batata_mesh::{
    HealthStatus, Labels, LabelsCollection, NetworkEndpoint, PodPort, Port, Proxy, ProxyStatus,
    Service, ServiceInstance, TlsMode,
};
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::conversion::{pod_tls_mode, secure_naming_san, service_hostname, workload_uid};
use crate::error::{RegistryError, Result};
use crate::objects::{
    KubeEndpoints, KubePod, KubeResource, KubeService, KubeServicePort, TargetPort,
};

/// Container port a service port targets on `pod`
///
/// Named target ports are looked up among the pod's container ports, matching
/// name and protocol.
pub fn find_port(pod: &KubePod, svc_port: &KubeServicePort) -> Result<i32> {
    match &svc_port.target_port {
        TargetPort::Number(port) => Ok(*port),
        TargetPort::Name(name) => pod
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .find(|p| &p.name == name && p.protocol == svc_port.protocol)
            .map(|p| p.container_port)
            .ok_or_else(|| RegistryError::PortNotFound {
                name: pod.name.clone(),
                namespace: pod.namespace.clone(),
                port: name.clone(),
            }),
    }
}

/// Like [`find_port`], but against the ports a proxy declared about itself.
///
/// Declared ports are matched by name only; proxies often omit the protocol.
pub fn find_port_from_metadata(svc_port: &KubeServicePort, pod_ports: &[PodPort]) -> Result<i32> {
    match &svc_port.target_port {
        TargetPort::Number(port) => Ok(*port),
        TargetPort::Name(name) => pod_ports
            .iter()
            .find(|p| &p.name == name)
            .map(|p| p.container_port)
            .ok_or_else(|| RegistryError::PortNotFound {
                name: svc_port.name.clone(),
                namespace: String::new(),
                port: name.clone(),
            }),
    }
}

impl Controller {
    /// Services of `namespace` whose non-empty selector matches `labels`
    fn services_selecting(&self, namespace: &str, labels: &Labels) -> Vec<Arc<KubeService>> {
        let mut out: Vec<Arc<KubeService>> = self
            .caches
            .services
            .list()
            .into_iter()
            .filter(|svc| {
                svc.namespace == namespace
                    && !svc.selector.is_empty()
                    && is_subset_of(&svc.selector, labels)
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Services selecting `pod`, sorted by name
    pub fn get_pod_services(&self, pod: &KubePod) -> Vec<Arc<KubeService>> {
        self.services_selecting(&pod.namespace, &pod.labels)
    }

    /// Instances backing `port` of `svc`, filtered by workload labels
    ///
    /// External-name services answer from the instances stored with the
    /// service. Everything else walks the ready addresses of the service's
    /// Endpoints object.
    pub fn instances_by_port(
        &self,
        svc: &Arc<Service>,
        port: u16,
        labels: &LabelsCollection,
    ) -> Vec<ServiceInstance> {
        if let Some(instances) = self.registry.external_instances(&svc.hostname) {
            return instances
                .into_iter()
                .filter(|i| i.service.attributes.namespace == svc.attributes.namespace)
                .collect();
        }

        let Some(ep) = self
            .caches
            .endpoints
            .get_by_name(&svc.attributes.name, &svc.attributes.namespace)
        else {
            return Vec::new();
        };
        let Some(svc_port) = svc.ports.get_by_port(port) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for subset in &ep.subsets {
            for address in &subset.addresses {
                let pod = self.get_pod_by_ip(&address.ip);
                let pod_labels = pod.as_ref().map(|p| p.labels.clone()).unwrap_or_default();
                if !labels.has_subset_of(&pod_labels) {
                    continue;
                }

                let (locality, service_account, uid) = match &pod {
                    Some(pod) => (
                        self.get_pod_locality(pod),
                        secure_naming_san(pod, &self.options.trust_domain),
                        if self.options.enable_workload_uid {
                            workload_uid(pod)
                        } else {
                            String::new()
                        },
                    ),
                    None => Default::default(),
                };
                let tls_mode = pod_tls_mode(pod.as_deref());
                let network = self.resolve_network(&address.ip);

                for ep_port in &subset.ports {
                    if !ep_port.name.is_empty() && ep_port.name != svc_port.name {
                        continue;
                    }
                    let Ok(number) = u16::try_from(ep_port.port) else {
                        continue;
                    };
                    out.push(ServiceInstance {
                        endpoint: NetworkEndpoint {
                            address: address.ip.clone(),
                            port: number,
                            service_port: svc_port.clone(),
                            locality: locality.clone(),
                            network: network.clone(),
                            uid: uid.clone(),
                            health_status: HealthStatus::Healthy,
                        },
                        service: svc.clone(),
                        labels: pod_labels.clone(),
                        service_account: service_account.clone(),
                        tls_mode,
                    });
                }
            }
        }
        out
    }

    /// Service instances implemented by a connected proxy
    ///
    /// Tries, in order: the proxy's pod and the services selecting it, then
    /// the metadata the proxy sent, then a scan of every Endpoints object for
    /// the proxy's addresses. Reports `NoService` when nothing matched.
    pub fn get_proxy_service_instances(&self, proxy: &Proxy) -> Vec<ServiceInstance> {
        let Some(proxy_ip) = proxy.primary_ip() else {
            self.report_no_service(proxy);
            return Vec::new();
        };

        let instances: Vec<ServiceInstance> = 'resolve: {
            let mut proxy_namespace = proxy.config_namespace.as_str();
            let pod = self.get_pod_by_ip(proxy_ip);

            if let Some(pod) = &pod {
                // A proxy claiming another network is not ours to answer for
                if proxy.metadata.network != self.resolve_network(proxy_ip) {
                    debug!(
                        proxy = %proxy.id,
                        network = %proxy.metadata.network,
                        "Proxy network does not match the registry"
                    );
                    return Vec::new();
                }
                proxy_namespace = pod.namespace.as_str();

                let services = self.get_pod_services(pod);
                if !services.is_empty() {
                    break 'resolve services
                        .iter()
                        .flat_map(|svc| self.proxy_instances_by_pod(pod, svc, proxy))
                        .collect();
                }
            }

            match self.proxy_instances_from_metadata(proxy) {
                Ok(instances) => break 'resolve instances,
                Err(e) => {
                    debug!(proxy = %proxy.id, error = %e, "Unable to resolve proxy from metadata");
                }
            }

            let mut endpoints = self.caches.endpoints.list();
            endpoints.sort_by_key(|ep| ep.key());

            let mut same_namespace = Vec::new();
            let mut other_namespaces = Vec::new();
            for ep in endpoints {
                let found = self.proxy_instances_by_endpoint(&ep, proxy);
                if ep.namespace == proxy_namespace {
                    same_namespace.extend(found);
                } else {
                    other_namespaces.extend(found);
                }
            }
            same_namespace.extend(other_namespaces);
            same_namespace
        };

        if instances.is_empty() {
            self.report_no_service(proxy);
        }
        instances
    }

    fn report_no_service(&self, proxy: &Proxy) {
        info!(proxy = %proxy.id, addresses = ?proxy.ip_addresses, "Empty list of services for proxy");
        self.status.report(ProxyStatus::NoService, &proxy.id, "");
    }

    /// Instances of one service selecting the proxy's pod
    fn proxy_instances_by_pod(
        &self,
        pod: &KubePod,
        service: &KubeService,
        proxy: &Proxy,
    ) -> Vec<ServiceInstance> {
        let hostname =
            service_hostname(&service.name, &service.namespace, &self.options.domain_suffix);
        let Some(svc) = self.registry.get(&hostname) else {
            return Vec::new();
        };
        let Some(pod_ip) = proxy.primary_ip() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for port in &service.ports {
            let Some(svc_port) = svc.ports.get(&port.name) else {
                continue;
            };
            let target = match find_port(pod, port) {
                Ok(target) => target,
                Err(e) => {
                    warn!(service = %hostname, error = %e, "Failed to find target port");
                    continue;
                }
            };
            for ip in &proxy.ip_addresses {
                out.extend(self.proxy_instance(
                    pod_ip,
                    ip,
                    target,
                    svc_port,
                    &svc,
                    HealthStatus::Healthy,
                ));
            }
        }
        out
    }

    /// Instances built from the metadata the proxy sent
    fn proxy_instances_from_metadata(&self, proxy: &Proxy) -> Result<Vec<ServiceInstance>> {
        let labels = proxy
            .workload_labels
            .first()
            .ok_or(RegistryError::NoWorkloadLabels)?;
        if proxy.metadata.cluster_id != self.options.cluster_id {
            return Err(RegistryError::ClusterMismatch {
                proxy: proxy.metadata.cluster_id.clone(),
                controller: self.options.cluster_id.clone(),
            });
        }

        let services = self.services_selecting(&proxy.config_namespace, labels);
        if services.is_empty() {
            return Err(RegistryError::NoMatchingService(
                proxy.config_namespace.clone(),
            ));
        }

        let address = proxy.primary_ip().unwrap_or_default();
        let network = self.resolve_network(address);
        let locality = proxy
            .locality
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        let mut out = Vec::new();
        for service in services {
            let hostname =
                service_hostname(&service.name, &service.namespace, &self.options.domain_suffix);
            let svc = self
                .registry
                .get(&hostname)
                .ok_or_else(|| RegistryError::ServiceNotFound(hostname.clone()))?;

            for port in &service.ports {
                let svc_port = svc.ports.get(&port.name).ok_or_else(|| {
                    RegistryError::PortNotFound {
                        name: service.name.clone(),
                        namespace: service.namespace.clone(),
                        port: port.name.clone(),
                    }
                })?;
                let target = find_port_from_metadata(port, &proxy.metadata.pod_ports)?;
                let number = u16::try_from(target).map_err(|_| RegistryError::PortNotFound {
                    name: service.name.clone(),
                    namespace: service.namespace.clone(),
                    port: target.to_string(),
                })?;

                out.push(ServiceInstance {
                    endpoint: NetworkEndpoint {
                        address: address.to_string(),
                        port: number,
                        service_port: svc_port.clone(),
                        locality: locality.clone(),
                        network: network.clone(),
                        uid: String::new(),
                        health_status: HealthStatus::Healthy,
                    },
                    service: svc.clone(),
                    labels: labels.clone(),
                    service_account: proxy.metadata.service_account.clone(),
                    tls_mode: TlsMode::default(),
                });
            }
        }
        Ok(out)
    }

    /// Instances of one Endpoints object listing any of the proxy's addresses
    fn proxy_instances_by_endpoint(
        &self,
        ep: &KubeEndpoints,
        proxy: &Proxy,
    ) -> Vec<ServiceInstance> {
        let hostname = service_hostname(&ep.name, &ep.namespace, &self.options.domain_suffix);
        let Some(svc) = self.registry.get(&hostname) else {
            return Vec::new();
        };
        let Some(pod_ip) = proxy.primary_ip() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for subset in &ep.subsets {
            for port in &subset.ports {
                let Some(svc_port) = svc.ports.get(&port.name) else {
                    continue;
                };
                for ip in &proxy.ip_addresses {
                    if subset.addresses.iter().any(|a| &a.ip == ip) {
                        out.extend(self.proxy_instance(
                            pod_ip,
                            ip,
                            port.port,
                            svc_port,
                            &svc,
                            HealthStatus::Healthy,
                        ));
                    }
                    if subset.not_ready_addresses.iter().any(|a| &a.ip == ip) {
                        out.extend(self.proxy_instance(
                            pod_ip,
                            ip,
                            port.port,
                            svc_port,
                            &svc,
                            HealthStatus::Unhealthy,
                        ));
                        self.status
                            .report(ProxyStatus::EndpointNotReady, &proxy.id, "");
                    }
                }
            }
        }
        out
    }

    /// One instance of a proxy address
    ///
    /// Labels, identity and locality come from the pod owning `pod_ip`.
    fn proxy_instance(
        &self,
        pod_ip: &str,
        address: &str,
        port: i32,
        svc_port: &Port,
        svc: &Arc<Service>,
        health_status: HealthStatus,
    ) -> Option<ServiceInstance> {
        let port = u16::try_from(port).ok()?;
        let pod = self.get_pod_by_ip(pod_ip);
        let (labels, locality, service_account) = match &pod {
            Some(pod) => (
                pod.labels.clone(),
                self.get_pod_locality(pod),
                secure_naming_san(pod, &self.options.trust_domain),
            ),
            None => Default::default(),
        };

        Some(ServiceInstance {
            endpoint: NetworkEndpoint {
                address: address.to_string(),
                port,
                service_port: svc_port.clone(),
                locality,
                network: self.resolve_network(address),
                uid: String::new(),
                health_status,
            },
            service: svc.clone(),
            labels,
            service_account,
            tls_mode: pod_tls_mode(pod.as_deref()),
        })
    }

    /// Identities of the workloads behind the given ports of `svc`
    ///
    /// The union of the pods' SPIFFE identities and the service's declared
    /// accounts, sorted.
    pub fn get_istio_service_accounts(&self, svc: &Arc<Service>, ports: &[u16]) -> Vec<String> {
        let mut accounts: BTreeSet<String> = BTreeSet::new();
        for port in ports {
            for instance in self.instances_by_port(svc, *port, &LabelsCollection::default()) {
                if !instance.service_account.is_empty() {
                    accounts.insert(instance.service_account);
                }
            }
        }
        accounts.extend(svc.service_accounts.iter().cloned());
        accounts.into_iter().collect()
    }

    /// Labels of the pod behind the proxy's primary address
    pub fn get_proxy_workload_labels(&self, proxy: &Proxy) -> LabelsCollection {
        proxy
            .primary_ip()
            .and_then(|ip| self.get_pod_by_ip(ip))
            .map(|pod| LabelsCollection::from(pod.labels.clone()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ContainerPort, ContainerSpec};

    fn pod_with_port(name: &str, port: i32, protocol: &str) -> KubePod {
        KubePod {
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                ports: vec![ContainerPort {
                    name: name.to_string(),
                    container_port: port,
                    protocol: protocol.to_string(),
                }],
            }],
            ..KubePod::new("web-0", "ns")
        }
    }

    #[test]
    fn test_find_port_by_number() {
        let pod = KubePod::new("web-0", "ns");
        let port = KubeServicePort::new("http", 80, TargetPort::Number(9376));
        assert_eq!(find_port(&pod, &port).unwrap(), 9376);
    }

    #[test]
    fn test_find_port_by_name_matches_protocol() {
        let pod = pod_with_port("web", 8080, "TCP");
        let port = KubeServicePort::new("http", 80, TargetPort::Name("web".to_string()));
        assert_eq!(find_port(&pod, &port).unwrap(), 8080);

        let udp_pod = pod_with_port("web", 8080, "UDP");
        assert!(matches!(
            find_port(&udp_pod, &port),
            Err(RegistryError::PortNotFound { .. })
        ));
    }

    #[test]
    fn test_find_port_from_metadata() {
        let pod_ports = vec![PodPort {
            name: "web".to_string(),
            container_port: 8080,
            protocol: "TCP".to_string(),
        }];
        let named = KubeServicePort::new("http", 80, TargetPort::Name("web".to_string()));
        assert_eq!(find_port_from_metadata(&named, &pod_ports).unwrap(), 8080);

        let untyped = vec![PodPort {
            name: "web".to_string(),
            container_port: 8080,
            protocol: String::new(),
        }];
        let udp = KubeServicePort {
            protocol: "UDP".to_string(),
            ..KubeServicePort::new("dns", 53, TargetPort::Name("web".to_string()))
        };
        assert_eq!(find_port_from_metadata(&udp, &untyped).unwrap(), 8080);

        let missing = KubeServicePort::new("grpc", 81, TargetPort::Name("grpc".to_string()));
        assert!(find_port_from_metadata(&missing, &pod_ports).is_err());

        let numbered = KubeServicePort::new("tcp", 82, TargetPort::Number(7000));
        assert_eq!(find_port_from_metadata(&numbered, &[]).unwrap(), 7000);
    }
}
