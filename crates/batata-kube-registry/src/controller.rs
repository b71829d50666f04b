//! Kubernetes registry controller
//!
//! The controller owns the raw object stores, the pod IP index, the mesh
//! service map and the task queue. Watch events enter through
//! [`Controller::on_watch_event`], which resolves them against the stores and
//! enqueues a task; the single queue worker then runs the handlers that turn
//! Kubernetes state into mesh services, endpoint sets and workload updates.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use batata_mesh::{
    Event, EventCounter, IstioEndpoint, NoopEventCounter, ProxyStatus, PushRequest, PushStatus,
    Service, ServiceAttributes, StatusReporter, XdsUpdater,
};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ControllerOptions, MeshNetworks};
use crate::conversion::{
    convert_service, external_name_instances, pod_tls_mode, secure_naming_san, service_hostname,
    workload_uid,
};
use crate::error::{RegistryError, Result};
use crate::locality::pod_locality;
use crate::network::NetworkResolver;
use crate::objects::{
    EndpointPort, KubeEndpoints, KubePod, KubeResource, KubeService, ResourceKind,
};
use crate::pod_cache::PodCache;
use crate::queue::{ChainHandler, Queue, Task, TaskHandler};
use crate::service_registry::ServiceRegistry;
use crate::store::{ObjectStore, Resource, ResourceCaches, ResourceEvent, StoreChange, WatchEvent};

/// Config kind pushed when a headless service's endpoints change
pub const SERVICE_ENTRY_KIND: &str = "ServiceEntry";

/// Observable lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    /// Started, waiting for the initial lists
    Syncing,
    Synced,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Syncing => "syncing",
            LifecycleState::Synced => "synced",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Controller {
    pub(crate) options: ControllerOptions,
    pub(crate) caches: ResourceCaches,
    pub(crate) pod_cache: PodCache,
    pub(crate) registry: ServiceRegistry,
    networks: RwLock<Arc<NetworkResolver>>,
    queue: Queue,
    updater: Arc<dyn XdsUpdater>,
    pub(crate) status: Arc<dyn StatusReporter>,
    events: Arc<dyn EventCounter>,
    service_handlers: ChainHandler<Service>,
    started: AtomicBool,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Controller {
    /// Create a controller pushing its changes to `updater`
    ///
    /// Diagnostics go to an in-memory [`PushStatus`] and watch events are not
    /// counted until replaced with the `with_*` builders.
    pub fn new(options: ControllerOptions, updater: Arc<dyn XdsUpdater>) -> Self {
        let networks = NetworkResolver::new(&options.mesh_networks, &options.cluster_id);
        let (stop_tx, _) = watch::channel(false);

        Self {
            queue: Queue::new(Duration::from_millis(options.retry_delay_ms)),
            networks: RwLock::new(Arc::new(networks)),
            caches: ResourceCaches::new(),
            pod_cache: PodCache::new(),
            registry: ServiceRegistry::new(),
            updater,
            status: Arc::new(PushStatus::new()),
            events: Arc::new(NoopEventCounter),
            service_handlers: ChainHandler::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_tx,
            options,
        }
    }

    pub fn with_status_reporter(mut self, status: Arc<dyn StatusReporter>) -> Self {
        self.status = status;
        self
    }

    pub fn with_event_counter(mut self, events: Arc<dyn EventCounter>) -> Self {
        self.events = events;
        self
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn cluster_id(&self) -> &str {
        &self.options.cluster_id
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mark the controller started; a stopped controller stays stopped
    pub fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!(cluster = %self.options.cluster_id, "Controller already stopped, not starting");
            return;
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            info!(
                cluster = %self.options.cluster_id,
                namespace = %self.options.watched_namespace,
                "Starting Kubernetes registry controller"
            );
        }
    }

    /// Signal every worker and watcher to exit
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(cluster = %self.options.cluster_id, "Stopping Kubernetes registry controller");
        }
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Receiver flipping to `true` once [`Controller::stop`] is called
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        if self.is_stopped() {
            LifecycleState::Stopped
        } else if !self.started.load(Ordering::SeqCst) {
            LifecycleState::Created
        } else if self.has_synced() {
            LifecycleState::Synced
        } else {
            LifecycleState::Syncing
        }
    }

    /// True once every watched type completed its initial list
    pub fn has_synced(&self) -> bool {
        self.caches.has_synced()
    }

    pub fn has_synced_kind(&self, kind: ResourceKind) -> bool {
        self.caches.has_synced_kind(kind)
    }

    /// Run the queue worker until the controller is stopped
    pub async fn run(self: Arc<Self>) {
        self.start();
        let stop = self.stop_signal();
        self.queue.run(self.as_ref(), stop).await;
    }

    /// Handle every queued task on the caller's task
    ///
    /// Returns the number of tasks handled successfully.
    pub async fn flush(&self) -> usize {
        self.queue.drain(self).await
    }

    // ========================================================================
    // Watch boundary
    // ========================================================================

    /// Apply one watch event to the stores and enqueue the resulting task
    pub fn on_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Restarted(kind) => {
                debug!(kind = %kind, "Watch (re)listing");
                match kind {
                    ResourceKind::Service => self.caches.services.begin_relist(),
                    ResourceKind::Endpoints => self.caches.endpoints.begin_relist(),
                    ResourceKind::Pod => self.caches.pods.begin_relist(),
                    ResourceKind::Node => self.caches.nodes.begin_relist(),
                }
            }
            WatchEvent::Applied(resource) => match resource {
                Resource::Service(obj) => self.apply_object(&self.caches.services, obj, Task::Service),
                Resource::Endpoints(obj) => {
                    self.apply_object(&self.caches.endpoints, obj, Task::Endpoints)
                }
                Resource::Pod(obj) => self.apply_object(&self.caches.pods, obj, Task::Pod),
                Resource::Node(obj) => self.apply_object(&self.caches.nodes, obj, Task::Node),
            },
            WatchEvent::Deleted(resource) => match resource {
                Resource::Service(obj) => {
                    self.delete_object(&self.caches.services, obj, Task::Service)
                }
                Resource::Endpoints(obj) => {
                    self.delete_object(&self.caches.endpoints, obj, Task::Endpoints)
                }
                Resource::Pod(obj) => self.delete_object(&self.caches.pods, obj, Task::Pod),
                Resource::Node(obj) => self.delete_object(&self.caches.nodes, obj, Task::Node),
            },
            WatchEvent::Synced(kind) => match kind {
                ResourceKind::Service => self.finish_relist(&self.caches.services, Task::Service),
                ResourceKind::Endpoints => {
                    self.finish_relist(&self.caches.endpoints, Task::Endpoints)
                }
                ResourceKind::Pod => self.finish_relist(&self.caches.pods, Task::Pod),
                ResourceKind::Node => self.finish_relist(&self.caches.nodes, Task::Node),
            },
        }
    }

    fn apply_object<T: KubeResource>(
        &self,
        store: &ObjectStore<T>,
        obj: T,
        task: fn(ResourceEvent<T>) -> Task,
    ) {
        match store.apply(obj) {
            StoreChange::Changed(event) => {
                self.events
                    .increment(T::KIND.as_str(), event.event().as_str());
                self.queue.push(task(event));
            }
            StoreChange::Unchanged => {
                self.events.increment(T::KIND.as_str(), "updatesame");
            }
        }
    }

    fn delete_object<T: KubeResource>(
        &self,
        store: &ObjectStore<T>,
        obj: T,
        task: fn(ResourceEvent<T>) -> Task,
    ) {
        let event = store.delete(obj);
        self.events.increment(T::KIND.as_str(), Event::Delete.as_str());
        self.queue.push(task(event));
    }

    fn finish_relist<T: KubeResource>(
        &self,
        store: &ObjectStore<T>,
        task: fn(ResourceEvent<T>) -> Task,
    ) {
        for event in store.finish_relist() {
            self.events.increment(T::KIND.as_str(), Event::Delete.as_str());
            self.queue.push(task(event));
        }
        info!(kind = %T::KIND, objects = store.len(), "Cache synced");
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Append a handler run after every service change
    ///
    /// Handlers run in registration order; a failing handler stops the rest.
    pub fn append_service_handler<F>(&self, f: F)
    where
        F: Fn(&Service, Event) -> Result<()> + Send + Sync + 'static,
    {
        self.service_handlers.append(Box::new(f));
    }

    fn on_service_event(&self, event: &ResourceEvent<KubeService>) -> Result<()> {
        let svc = event.object();
        let kind = event.event();
        debug!(service = %svc.name, namespace = %svc.namespace, event = %kind, "Handle service");

        let service = Arc::new(convert_service(
            svc,
            &self.options.domain_suffix,
            &self.options.cluster_id,
            &self.options.trust_domain,
        ));

        match kind {
            Event::Delete => {
                self.registry.remove(&service.hostname);
            }
            Event::Add | Event::Update => {
                let instances = external_name_instances(svc, &service);
                self.registry.upsert(service.clone(), instances);
            }
        }

        self.updater
            .service_changed(&self.options.cluster_id, &svc.name, &svc.namespace, kind);
        self.service_handlers.apply(&service, kind)
    }

    fn on_endpoints_event(&self, event: &ResourceEvent<KubeEndpoints>) -> Result<()> {
        self.push_endpoints(event.object(), event.event());
        Ok(())
    }

    fn push_endpoints(&self, ep: &KubeEndpoints, event: Event) {
        if self.options.enable_headless_service
            && let Some(svc) = self.caches.services.get_by_name(&ep.name, &ep.namespace)
            && svc.is_headless()
        {
            debug!(service = %ep.name, namespace = %ep.namespace, "Headless service endpoints changed, requesting full push");
            self.updater.config_update(PushRequest {
                full: true,
                namespaces_updated: BTreeSet::from([ep.namespace.clone()]),
                config_types_updated: BTreeSet::from([SERVICE_ENTRY_KIND.to_string()]),
            });
            return;
        }

        self.update_eds(ep, event);
    }

    /// Re-run EDS for every Endpoints object listing `ip` as a ready pod address
    fn refresh_endpoints_for_pod(&self, ip: &str, namespace: &str) {
        for ep in self.caches.endpoints.list() {
            if ep.namespace != namespace {
                continue;
            }
            let lists_ip = ep
                .subsets
                .iter()
                .flat_map(|s| s.addresses.iter())
                .any(|a| a.ip == ip && a.targets_pod());
            if lists_ip {
                debug!(endpoint = %ep.name, namespace = %ep.namespace, ip = %ip, "Pod arrived for endpoint");
                self.push_endpoints(&ep, Event::Update);
            }
        }
    }

    /// Push the full endpoint set of one Endpoints object
    fn update_eds(&self, ep: &KubeEndpoints, event: Event) {
        let hostname = service_hostname(&ep.name, &ep.namespace, &self.options.domain_suffix);
        let mut endpoints = Vec::new();

        if event != Event::Delete {
            for subset in &ep.subsets {
                for address in &subset.addresses {
                    let pod = self.pod_cache.get_pod_by_ip(&self.caches.pods, &address.ip);
                    if pod.is_none() && address.targets_pod() {
                        // Re-pushed once the pod shows up in the IP index
                        warn!(
                            endpoint = %ep.name,
                            namespace = %ep.namespace,
                            ip = %address.ip,
                            "Endpoint without pod"
                        );
                        self.status
                            .report(ProxyStatus::EndpointNoPod, &hostname, &address.ip);
                        continue;
                    }
                    endpoints.extend(self.build_istio_endpoints(
                        ep,
                        &address.ip,
                        pod.as_deref(),
                        &subset.ports,
                    ));
                }
            }
        }

        info!(
            endpoint = %ep.name,
            namespace = %ep.namespace,
            addresses = ?ep.ready_ips(),
            "Handle EDS endpoint"
        );
        self.updater.endpoints_changed(
            &self.options.cluster_id,
            &hostname,
            &ep.namespace,
            endpoints,
        );
    }

    fn build_istio_endpoints(
        &self,
        ep: &KubeEndpoints,
        ip: &str,
        pod: Option<&KubePod>,
        ports: &[EndpointPort],
    ) -> Vec<IstioEndpoint> {
        let (labels, locality, service_account, uid) = match pod {
            Some(pod) => (
                pod.labels.clone(),
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
        let tls_mode = pod_tls_mode(pod);
        let network = self.resolve_network(ip);

        ports
            .iter()
            .filter_map(|port| {
                let endpoint_port = u32::try_from(port.port).ok()?;
                Some(IstioEndpoint {
                    address: ip.to_string(),
                    endpoint_port,
                    service_port_name: port.name.clone(),
                    labels: labels.clone(),
                    uid: uid.clone(),
                    service_account: service_account.clone(),
                    network: network.clone(),
                    locality: locality.clone(),
                    attributes: ServiceAttributes {
                        name: ep.name.clone(),
                        namespace: ep.namespace.clone(),
                        ..Default::default()
                    },
                    tls_mode,
                })
            })
            .collect()
    }

    // ========================================================================
    // Read API
    // ========================================================================

    /// All mesh services sorted by hostname
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.registry.list()
    }

    pub fn get_service(&self, hostname: &str) -> Option<Arc<Service>> {
        self.registry.get(hostname)
    }

    pub fn get_pod_by_ip(&self, ip: &str) -> Option<Arc<KubePod>> {
        self.pod_cache.get_pod_by_ip(&self.caches.pods, ip)
    }

    /// `region/zone` of a pod, empty when unknown
    pub fn get_pod_locality(&self, pod: &KubePod) -> String {
        pod_locality(pod, &self.caches.nodes)
    }

    /// Replace the network lookup with one built from `mesh_networks`
    pub fn init_network_lookup(&self, mesh_networks: &MeshNetworks) {
        let resolver = NetworkResolver::new(mesh_networks, &self.options.cluster_id);
        info!(
            cidrs = resolver.len(),
            registry_network = ?resolver.registry_network(),
            "Network lookup initialized"
        );
        *self.networks.write() = Arc::new(resolver);
    }

    /// Network of an endpoint address, empty when none applies
    pub fn resolve_network(&self, ip: &str) -> String {
        let resolver = self.networks.read().clone();
        resolver.resolve_network(ip)
    }
}

impl TaskHandler for Controller {
    fn handle(&self, task: &Task) -> Result<()> {
        if self.is_stopped() {
            return Err(RegistryError::Stopped);
        }
        if !self.has_synced() {
            return Err(RegistryError::NotSynced);
        }

        match task {
            Task::Service(event) => self.on_service_event(event),
            Task::Endpoints(event) => self.on_endpoints_event(event),
            Task::Pod(event) => {
                if let Some(ip) = self.pod_cache.on_event(event, self.updater.as_ref()) {
                    self.refresh_endpoints_for_pod(&ip, &event.object().namespace);
                }
                Ok(())
            }
            // Nodes are only read through the store for locality
            Task::Node(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("cluster_id", &self.options.cluster_id)
            .field("state", &self.state())
            .field("services", &self.registry.len())
            .field("pod_ips", &self.pod_cache.len())
            .finish()
    }
}
