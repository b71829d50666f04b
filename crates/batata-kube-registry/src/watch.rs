//! Kubernetes watchers feeding the controller
//!
//! One kube-runtime watcher per resource type. Services, pods and nodes are
//! watched first; the endpoints watcher only starts once those three caches
//! have synced, so endpoint handling can resolve pods and nodes.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service as K8sService};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::ControllerOptions;
use crate::controller::Controller;
use crate::objects::{KubeEndpoints, KubeNode, KubePod, KubeService, ResourceKind};
use crate::store::{Resource, WatchEvent};

/// Upper bound the API server accepts for a watch timeout
const MAX_WATCH_TIMEOUT_SECONDS: u64 = 290;

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Watcher config with the resync period mapped onto the watch timeout
pub fn watcher_config(options: &ControllerOptions) -> watcher::Config {
    let timeout = options
        .resync_period_seconds
        .clamp(1, MAX_WATCH_TIMEOUT_SECONDS) as u32;
    watcher::Config::default().timeout(timeout)
}

fn namespaced_api<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

fn service_resource(svc: &K8sService) -> Resource {
    KubeService::from(svc).into()
}

fn endpoints_resource(ep: &Endpoints) -> Resource {
    KubeEndpoints::from(ep).into()
}

fn pod_resource(pod: &Pod) -> Resource {
    KubePod::from(pod).into()
}

fn node_resource(node: &Node) -> Resource {
    KubeNode::from(node).into()
}

/// Map one kube-runtime event onto the controller's watch boundary
pub fn to_watch_event<K>(kind: ResourceKind, event: Event<K>, convert: fn(&K) -> Resource) -> WatchEvent {
    match event {
        Event::Init => WatchEvent::Restarted(kind),
        Event::InitApply(obj) | Event::Apply(obj) => WatchEvent::Applied(convert(&obj)),
        Event::Delete(obj) => WatchEvent::Deleted(convert(&obj)),
        Event::InitDone => WatchEvent::Synced(kind),
    }
}

/// Drive one event stream into the controller until stop or stream end
pub async fn forward_events<K, S>(
    controller: Arc<Controller>,
    kind: ResourceKind,
    stream: S,
    convert: fn(&K) -> Resource,
) where
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    let mut stop = controller.stop_signal();
    tokio::pin!(stream);
    info!(kind = %kind, "Starting watcher");

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            event = stream.next() => match event {
                Some(Ok(event)) => controller.on_watch_event(to_watch_event(kind, event, convert)),
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Watch error, backing off");
                }
                None => break,
            }
        }
    }

    info!(kind = %kind, "Watcher stopped");
}

fn spawn_watcher<K>(
    controller: &Arc<Controller>,
    kind: ResourceKind,
    api: Api<K>,
    convert: fn(&K) -> Resource,
) -> tokio::task::JoinHandle<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, watcher_config(controller.options())).default_backoff();
    tokio::spawn(forward_events(controller.clone(), kind, stream, convert))
}

/// Run every watcher until the controller is stopped
pub async fn run_watchers(controller: Arc<Controller>, client: Client) {
    let namespace = controller.options().watched_namespace.clone();
    let mut handles = vec![
        spawn_watcher(
            &controller,
            ResourceKind::Service,
            namespaced_api::<K8sService>(&client, &namespace),
            service_resource,
        ),
        spawn_watcher(
            &controller,
            ResourceKind::Pod,
            namespaced_api::<Pod>(&client, &namespace),
            pod_resource,
        ),
        spawn_watcher(
            &controller,
            ResourceKind::Node,
            Api::<Node>::all(client.clone()),
            node_resource,
        ),
    ];

    let mut stop = controller.stop_signal();
    let mut ticker = tokio::time::interval(SYNC_POLL_INTERVAL);
    let synced = || {
        [ResourceKind::Service, ResourceKind::Pod, ResourceKind::Node]
            .iter()
            .all(|kind| controller.has_synced_kind(*kind))
    };

    let stopped = loop {
        if synced() {
            break false;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break true;
                }
            }
        }
    };

    if stopped {
        debug!("Stopped before initial sync, endpoints watcher not started");
    } else {
        info!("Services, pods and nodes synced, starting endpoints watcher");
        handles.push(spawn_watcher(
            &controller,
            ResourceKind::Endpoints,
            namespaced_api::<Endpoints>(&client, &namespace),
            endpoints_resource,
        ));
    }

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Watcher task failed");
        }
    }
}
