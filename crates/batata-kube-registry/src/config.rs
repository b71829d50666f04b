//! Registry configuration
//!
//! Options are read from an optional YAML file with the `config` crate. Every
//! field has a default, so an empty or missing file yields a working setup.

use std::path::Path;

use anyhow::Context;
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Kubernetes registry controller options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerOptions {
    /// Namespace to watch (empty = all namespaces)
    #[serde(default)]
    pub watched_namespace: String,

    /// Watch resync period in seconds
    #[serde(default = "default_resync_period")]
    pub resync_period_seconds: u64,

    /// DNS suffix of service hostnames
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,

    /// Id of the cluster this registry mirrors
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Trust domain used for SPIFFE identities
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,

    /// Delay before a task that failed the sync gate is retried
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Push headless services as full config updates instead of EDS
    #[serde(default = "default_true")]
    pub enable_headless_service: bool,

    /// Attach `kubernetes://<pod>.<namespace>` uids to endpoints
    #[serde(default)]
    pub enable_workload_uid: bool,

    #[serde(default)]
    pub mesh_networks: MeshNetworks,

    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_resync_period() -> u64 {
    60
}

fn default_domain_suffix() -> String {
    "cluster.local".to_string()
}

fn default_cluster_id() -> String {
    "Kubernetes".to_string()
}

fn default_trust_domain() -> String {
    "cluster.local".to_string()
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            watched_namespace: String::new(),
            resync_period_seconds: default_resync_period(),
            domain_suffix: default_domain_suffix(),
            cluster_id: default_cluster_id(),
            trust_domain: default_trust_domain(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_headless_service: true,
            enable_workload_uid: false,
            mesh_networks: MeshNetworks::default(),
            log_level: default_log_level(),
        }
    }
}

/// Named networks and the sources that place endpoints on them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNetworks {
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<NetworkEndpointSource>,
}

/// One endpoint source: either a CIDR or a whole registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpointSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_registry: Option<String>,
}

impl NetworkEndpointSource {
    pub fn cidr(cidr: impl Into<String>) -> Self {
        Self {
            from_cidr: Some(cidr.into()),
            from_registry: None,
        }
    }

    pub fn registry(cluster_id: impl Into<String>) -> Self {
        Self {
            from_cidr: None,
            from_registry: Some(cluster_id.into()),
        }
    }
}

impl ControllerOptions {
    /// Load options from a YAML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml).required(true))
            .build()
            .with_context(|| format!("Failed to read registry config {}", path.display()))?;

        config
            .try_deserialize()
            .with_context(|| format!("Invalid registry config {}", path.display()))
    }

    /// Parse options from YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Yaml))
            .build()
            .context("Failed to parse registry config")?
            .try_deserialize()
            .context("Invalid registry config")
    }
}
