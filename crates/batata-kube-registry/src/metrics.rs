// Metrics for the Kubernetes registry
// Watch events are counted per resource type and event kind

use batata_mesh::EventCounter;
use metrics::{counter, describe_counter};

pub const K8S_EVENTS_TOTAL: &str = "registry_k8s_events_total";

/// Initialize metric descriptions
/// Should be called once at startup, before any watcher runs
pub fn init_metrics() {
    describe_counter!(
        K8S_EVENTS_TOTAL,
        "Total number of Kubernetes watch events by resource type and event"
    );

    tracing::info!("Metrics initialized");
}

/// Record a watch event
pub fn record_k8s_event(resource_type: &str, event: &str) {
    counter!(K8S_EVENTS_TOTAL, "type" => resource_type.to_string(), "event" => event.to_string()).increment(1);
}

/// `EventCounter` backed by the global `metrics` recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsEventCounter;

impl EventCounter for MetricsEventCounter {
    fn increment(&self, resource_type: &str, event: &str) {
        record_k8s_event(resource_type, event);
    }
}
