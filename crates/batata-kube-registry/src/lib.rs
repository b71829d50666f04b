//! Batata Kubernetes Registry
//!
//! Mirrors Kubernetes Services, Endpoints, Pods and Nodes into the mesh
//! service model:
//! - Converts services into mesh `Service`s keyed by hostname
//! - Turns endpoint changes into incremental EDS updates
//! - Indexes pod IPs and reports workload label changes
//! - Resolves the service instances behind a port or a connected proxy

pub mod config;
pub mod controller;
pub mod conversion;
pub mod error;
pub mod instances;
pub mod locality;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod objects;
pub mod pod_cache;
pub mod queue;
pub mod service_registry;
pub mod store;
pub mod watch;

pub use config::{ControllerOptions, MeshNetworks, NetworkConfig, NetworkEndpointSource};
pub use controller::{Controller, LifecycleState};
pub use error::{RegistryError, Result};
pub use objects::{
    ContainerPort, ContainerSpec, EndpointAddress, EndpointPort, EndpointSubset, KubeEndpoints,
    KubeNode, KubePod, KubeResource, KubeService, KubeServicePort, PodPhase, ResourceKind,
    ServiceType, TargetPort,
};
pub use store::{Resource, WatchEvent};
