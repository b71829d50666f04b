//! Error types for the Kubernetes registry

/// Error type for registry task handling and instance resolution
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Not every watched resource type finished its initial list yet
    #[error("registry caches not synced")]
    NotSynced,

    #[error("registry controller stopped")]
    Stopped,

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("proxy cluster {proxy} does not match registry cluster {controller}")]
    ClusterMismatch { proxy: String, controller: String },

    #[error("no matching target port {port} for {namespace}/{name}")]
    PortNotFound {
        name: String,
        namespace: String,
        port: String,
    },

    #[error("invalid CIDR {cidr} in network {network}")]
    InvalidCidr { cidr: String, network: String },

    #[error("proxy has no workload labels")]
    NoWorkloadLabels,

    #[error("no service selects proxy in namespace {0}")]
    NoMatchingService(String),
}

impl RegistryError {
    /// Whether a failed task should be held and retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::NotSynced)
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
