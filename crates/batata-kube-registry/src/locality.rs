//! Pod locality resolution

use batata_mesh::model::LOCALITY_LABEL;
use tracing::warn;

use crate::objects::{KubeNode, KubePod};
use crate::store::ObjectStore;

pub const NODE_REGION_LABEL: &str = "failure-domain.beta.kubernetes.io/region";
pub const NODE_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";
pub const NODE_REGION_LABEL_GA: &str = "failure-domain.kubernetes.io/region";
pub const NODE_ZONE_LABEL_GA: &str = "failure-domain.kubernetes.io/zone";

/// Value of the GA label, falling back to the beta one
fn node_label<'a>(node: &'a KubeNode, beta: &str, ga: &str) -> &'a str {
    node.labels
        .get(ga)
        .filter(|v| !v.is_empty())
        .or_else(|| node.labels.get(beta))
        .map(String::as_str)
        .unwrap_or_default()
}

/// `region/zone` of a pod, empty when unknown
///
/// The pod's own `istio-locality` label wins; its `.` separators become `/`.
/// Otherwise the labels of the pod's node are used.
pub fn pod_locality(pod: &KubePod, nodes: &ObjectStore<KubeNode>) -> String {
    if let Some(locality) = pod.labels.get(LOCALITY_LABEL)
        && !locality.is_empty()
    {
        return locality.replace('.', "/");
    }

    let Some(node) = nodes.get(&pod.node_name) else {
        warn!(node = %pod.node_name, pod = %pod.name, namespace = %pod.namespace, "Unable to get node for pod");
        return String::new();
    };

    let region = node_label(&node, NODE_REGION_LABEL, NODE_REGION_LABEL_GA);
    let zone = node_label(&node, NODE_ZONE_LABEL, NODE_ZONE_LABEL_GA);
    if region.is_empty() && zone.is_empty() {
        return String::new();
    }

    format!("{}/{}", region, zone)
}
