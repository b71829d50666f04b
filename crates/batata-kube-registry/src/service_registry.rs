//! Mesh service map
//!
//! Owns the hostname -> `Service` map and the statically computed instances of
//! `ExternalName` services. Both maps sit behind one lock so every mutation is
//! a single exclusive acquisition and readers never see them out of step.

use std::collections::HashMap;
use std::sync::Arc;

use batata_mesh::{Service, ServiceInstance};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Inner {
    services: HashMap<String, Arc<Service>>,
    external_name_instances: HashMap<String, Vec<ServiceInstance>>,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    inner: RwLock<Inner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service together with its external-name instances
    ///
    /// An empty `instances` list clears any previously stored instances.
    pub fn upsert(&self, service: Arc<Service>, instances: Vec<ServiceInstance>) {
        let hostname = service.hostname.clone();
        let mut inner = self.inner.write();
        if instances.is_empty() {
            inner.external_name_instances.remove(&hostname);
        } else {
            inner
                .external_name_instances
                .insert(hostname.clone(), instances);
        }
        inner.services.insert(hostname, service);
    }

    /// Remove a service and its external-name instances
    pub fn remove(&self, hostname: &str) -> Option<Arc<Service>> {
        let mut inner = self.inner.write();
        inner.external_name_instances.remove(hostname);
        inner.services.remove(hostname)
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<Service>> {
        self.inner.read().services.get(hostname).cloned()
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.inner.read().services.contains_key(hostname)
    }

    /// All services sorted by hostname
    pub fn list(&self) -> Vec<Arc<Service>> {
        let mut out: Vec<Arc<Service>> = self.inner.read().services.values().cloned().collect();
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        out
    }

    /// Stored instances of an external-name service
    pub fn external_instances(&self, hostname: &str) -> Option<Vec<ServiceInstance>> {
        self.inner
            .read()
            .external_name_instances
            .get(hostname)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batata_mesh::{
        HealthStatus, Labels, NetworkEndpoint, Port, PortList, Protocol, Resolution,
        ServiceAttributes, TlsMode,
    };

    fn service(hostname: &str) -> Arc<Service> {
        Arc::new(Service {
            hostname: hostname.to_string(),
            address: "0.0.0.0".to_string(),
            ports: PortList::from(vec![Port::new("http", 80, Protocol::Http)]),
            service_accounts: Vec::new(),
            mesh_external: false,
            resolution: Resolution::ClientSideLb,
            attributes: ServiceAttributes::default(),
        })
    }

    fn instance(service: &Arc<Service>) -> ServiceInstance {
        ServiceInstance {
            endpoint: NetworkEndpoint {
                address: "api.example.com".to_string(),
                port: 80,
                service_port: Port::new("http", 80, Protocol::Http),
                locality: String::new(),
                network: String::new(),
                uid: String::new(),
                health_status: HealthStatus::Healthy,
            },
            service: service.clone(),
            labels: Labels::new(),
            service_account: String::new(),
            tls_mode: TlsMode::Disabled,
        }
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ServiceRegistry::new();
        registry.upsert(service("b.ns.svc.cluster.local"), Vec::new());
        registry.upsert(service("a.ns.svc.cluster.local"), Vec::new());

        let hostnames: Vec<String> = registry.list().iter().map(|s| s.hostname.clone()).collect();
        assert_eq!(
            hostnames,
            vec!["a.ns.svc.cluster.local", "b.ns.svc.cluster.local"]
        );
    }

    #[test]
    fn test_upsert_replaces_external_instances() {
        let registry = ServiceRegistry::new();
        let svc = service("ext.ns.svc.cluster.local");

        registry.upsert(svc.clone(), vec![instance(&svc)]);
        assert_eq!(
            registry
                .external_instances("ext.ns.svc.cluster.local")
                .unwrap()
                .len(),
            1
        );

        registry.upsert(svc, Vec::new());
        assert!(registry.external_instances("ext.ns.svc.cluster.local").is_none());
    }

    #[test]
    fn test_remove_clears_both_maps() {
        let registry = ServiceRegistry::new();
        let svc = service("ext.ns.svc.cluster.local");
        registry.upsert(svc.clone(), vec![instance(&svc)]);

        assert!(registry.remove("ext.ns.svc.cluster.local").is_some());
        assert!(registry.get("ext.ns.svc.cluster.local").is_none());
        assert!(registry.external_instances("ext.ns.svc.cluster.local").is_none());
        assert!(registry.is_empty());
    }
}
