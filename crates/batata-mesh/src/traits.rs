//! Collaborator traits for dependency injection
//!
//! Registries push their changes through these traits, so the push pipeline,
//! the diagnostics store and the metrics backend can be swapped without the
//! registry depending on concrete implementations.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Event, IstioEndpoint, Labels};

/// Request for a full push, used when incremental EDS is not enough
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Whether every proxy config has to be regenerated
    pub full: bool,
    /// Namespaces whose config changed, empty means all
    pub namespaces_updated: BTreeSet<String>,
    /// Config kinds that changed, empty means all
    pub config_types_updated: BTreeSet<String>,
}

/// Receives incremental registry changes and drives downstream push
///
/// Every method is called synchronously from the registry's event worker.
/// Implementations must not block; they may enqueue on their own side.
pub trait XdsUpdater: Send + Sync {
    /// A service was added, updated or deleted
    fn service_changed(&self, cluster_id: &str, name: &str, namespace: &str, event: Event);

    /// The full endpoint set of a hostname changed in one cluster
    ///
    /// The set replaces whatever was previously known for that hostname and
    /// cluster. An empty set clears it.
    fn endpoints_changed(
        &self,
        cluster_id: &str,
        hostname: &str,
        namespace: &str,
        endpoints: Vec<IstioEndpoint>,
    );

    /// Config changed in a way that needs a (possibly full) push
    fn config_update(&self, request: PushRequest);

    /// A workload IP gained or lost its labels
    fn workload_update(&self, ip: &str, labels: &Labels, annotations: &Labels);
}

/// Conditions reported to the diagnostics sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyStatus {
    /// A connected proxy matched no service
    NoService,
    /// A proxy's address only appears in not-ready endpoint addresses
    EndpointNotReady,
    /// An endpoint references a pod that is not cached
    EndpointNoPod,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::NoService => "pilot_no_ip",
            ProxyStatus::EndpointNotReady => "pilot_endpoint_not_ready",
            ProxyStatus::EndpointNoPod => "endpoint_no_pod",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyed, best-effort diagnostics sink
pub trait StatusReporter: Send + Sync {
    /// Record `condition` for `key`; must not block
    fn report(&self, condition: ProxyStatus, key: &str, detail: &str);
}

/// Counts watch events by resource type and event kind
pub trait EventCounter: Send + Sync {
    fn increment(&self, resource_type: &str, event: &str);
}

/// Counter that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventCounter;

impl EventCounter for NoopEventCounter {
    fn increment(&self, _resource_type: &str, _event: &str) {}
}
