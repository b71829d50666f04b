//! Batata Service Mesh Model
//!
//! This crate holds the registry-agnostic side of the mesh control plane:
//! - `model` - services, instances, endpoints and proxies as the push pipeline sees them
//! - `traits` - collaborator seams registries push into (`XdsUpdater`, `StatusReporter`, `EventCounter`)
//! - `snapshot` - versioned endpoint shards per hostname
//! - `sync` - `PushBridge`, the in-process `XdsUpdater`
//! - `status` - `PushStatus`, the in-memory diagnostics store

pub mod error;
pub mod model;
pub mod snapshot;
pub mod status;
pub mod sync;
pub mod traits;

// Re-export commonly used types
pub use error::MeshError;
pub use model::{
    Event, HealthStatus, IstioEndpoint, Labels, LabelsCollection, Locality, NetworkEndpoint,
    PodPort, Port, PortList, Protocol, Proxy, ProxyMetadata, Resolution, Service,
    ServiceAttributes, ServiceInstance, TlsMode,
};
pub use snapshot::EndpointSnapshot;
pub use status::PushStatus;
pub use sync::{MeshChangeEvent, PushBridge};
pub use traits::{EventCounter, NoopEventCounter, ProxyStatus, PushRequest, StatusReporter, XdsUpdater};
