//! Registry to push pipeline bridge
//!
//! `PushBridge` is the in-process `XdsUpdater`: it records endpoint shards and
//! workload labels as registries report them and forwards a change event to
//! whoever drives proxy pushes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::model::{Event, IstioEndpoint, Labels};
use crate::snapshot::EndpointSnapshot;
use crate::traits::{PushRequest, XdsUpdater};

/// Change notification emitted for every registry update
#[derive(Debug, Clone, PartialEq)]
pub enum MeshChangeEvent {
    ServiceChanged {
        cluster_id: String,
        name: String,
        namespace: String,
        event: Event,
    },
    EndpointsChanged {
        cluster_id: String,
        hostname: String,
        namespace: String,
        version: String,
        endpoints: usize,
    },
    ConfigUpdate(PushRequest),
    WorkloadUpdate {
        ip: String,
        labels: Labels,
    },
}

/// In-process `XdsUpdater`
///
/// Updates never block the registry worker. Change events queue up on an
/// unbounded channel until the consumer takes them; they are only dropped,
/// with a warning, once the receiver is gone.
pub struct PushBridge {
    snapshot: Arc<EndpointSnapshot>,
    /// workload ip -> labels
    workloads: DashMap<String, Labels>,
    event_tx: mpsc::UnboundedSender<MeshChangeEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<MeshChangeEvent>>>,
    dropped: AtomicU64,
    full_pushes: AtomicU64,
}

impl PushBridge {
    /// Create a new push bridge
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            snapshot: Arc::new(EndpointSnapshot::new()),
            workloads: DashMap::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            dropped: AtomicU64::new(0),
            full_pushes: AtomicU64::new(0),
        }
    }

    /// Endpoint snapshot maintained by this bridge
    pub fn snapshot(&self) -> Arc<EndpointSnapshot> {
        self.snapshot.clone()
    }

    /// Take the change event receiver; only the first call gets it
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<MeshChangeEvent>> {
        self.event_rx.lock().take()
    }

    /// Labels last reported for a workload ip
    pub fn workload_labels(&self, ip: &str) -> Option<Labels> {
        self.workloads.get(ip).map(|e| e.value().clone())
    }

    /// Number of events dropped because the receiver was gone
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of full push requests received
    pub fn full_push_count(&self) -> u64 {
        self.full_pushes.load(Ordering::Relaxed)
    }

    /// Start a background task that drains change events into the log
    ///
    /// Used when no push server consumes the channel. Fails if the receiver
    /// was already taken.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>, MeshError> {
        let mut event_rx = self.take_receiver().ok_or(MeshError::AlreadyStarted)?;

        info!("Starting push bridge event consumer");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("Push bridge event consumer shutting down");
                        break;
                    }
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => log_event(&event),
                            None => break,
                        }
                    }
                }
            }
        }))
    }

    fn emit(&self, event: MeshChangeEvent) {
        if let Err(mpsc::error::SendError(event)) = self.event_tx.send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped = dropped, event = ?event, "Push event channel closed, dropping event");
        }
    }
}

impl Default for PushBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl XdsUpdater for PushBridge {
    fn service_changed(&self, cluster_id: &str, name: &str, namespace: &str, event: Event) {
        debug!(
            cluster_id = %cluster_id,
            service = %name,
            namespace = %namespace,
            event = %event,
            "Service changed"
        );
        if event == Event::Delete {
            self.snapshot.remove_service(cluster_id, name, namespace);
        }
        self.emit(MeshChangeEvent::ServiceChanged {
            cluster_id: cluster_id.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            event,
        });
    }

    fn endpoints_changed(
        &self,
        cluster_id: &str,
        hostname: &str,
        namespace: &str,
        endpoints: Vec<IstioEndpoint>,
    ) {
        let count = endpoints.len();
        let version = self.snapshot.update(cluster_id, hostname, namespace, endpoints);
        self.emit(MeshChangeEvent::EndpointsChanged {
            cluster_id: cluster_id.to_string(),
            hostname: hostname.to_string(),
            namespace: namespace.to_string(),
            version,
            endpoints: count,
        });
    }

    fn config_update(&self, request: PushRequest) {
        if request.full {
            self.full_pushes.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(MeshChangeEvent::ConfigUpdate(request));
    }

    fn workload_update(&self, ip: &str, labels: &Labels, _annotations: &Labels) {
        if labels.is_empty() {
            self.workloads.remove(ip);
        } else {
            self.workloads.insert(ip.to_string(), labels.clone());
        }
        self.emit(MeshChangeEvent::WorkloadUpdate {
            ip: ip.to_string(),
            labels: labels.clone(),
        });
    }
}

fn log_event(event: &MeshChangeEvent) {
    match event {
        MeshChangeEvent::ServiceChanged {
            cluster_id,
            name,
            namespace,
            event,
        } => {
            info!(cluster_id = %cluster_id, service = %name, namespace = %namespace, event = %event, "Service update");
        }
        MeshChangeEvent::EndpointsChanged {
            hostname,
            version,
            endpoints,
            ..
        } => {
            info!(hostname = %hostname, version = %version, endpoints = endpoints, "Endpoint update");
        }
        MeshChangeEvent::ConfigUpdate(request) => {
            info!(
                full = request.full,
                namespaces = ?request.namespaces_updated,
                "Config update"
            );
        }
        MeshChangeEvent::WorkloadUpdate { ip, labels } => {
            debug!(ip = %ip, labels = labels.len(), "Workload update");
        }
    }
}
