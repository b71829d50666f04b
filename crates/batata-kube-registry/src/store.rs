//! Raw object stores fed by the watch boundary
//!
//! Each watched type has one `ObjectStore`, a concurrent map from
//! `namespace/name` to the last observed object. Applying a watch event to the
//! store pairs it with the previous state, so handlers only ever see
//! `ResourceEvent::{Added, Updated, Deleted}`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use batata_mesh::Event;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::objects::{
    KubeEndpoints, KubeNode, KubePod, KubeResource, KubeService, ResourceKind,
};

/// A resolved change of one object
#[derive(Debug)]
pub enum ResourceEvent<T> {
    Added(Arc<T>),
    Updated { old: Arc<T>, new: Arc<T> },
    /// Carries the last known state of the deleted object
    Deleted(Arc<T>),
}

impl<T> ResourceEvent<T> {
    /// The current object, or the final state for deletes
    pub fn object(&self) -> &Arc<T> {
        match self {
            ResourceEvent::Added(obj) => obj,
            ResourceEvent::Updated { new, .. } => new,
            ResourceEvent::Deleted(obj) => obj,
        }
    }

    pub fn event(&self) -> Event {
        match self {
            ResourceEvent::Added(_) => Event::Add,
            ResourceEvent::Updated { .. } => Event::Update,
            ResourceEvent::Deleted(_) => Event::Delete,
        }
    }
}

impl<T> Clone for ResourceEvent<T> {
    fn clone(&self) -> Self {
        match self {
            ResourceEvent::Added(obj) => ResourceEvent::Added(obj.clone()),
            ResourceEvent::Updated { old, new } => ResourceEvent::Updated {
                old: old.clone(),
                new: new.clone(),
            },
            ResourceEvent::Deleted(obj) => ResourceEvent::Deleted(obj.clone()),
        }
    }
}

/// Outcome of applying an object to a store
#[derive(Debug)]
pub enum StoreChange<T> {
    Changed(ResourceEvent<T>),
    /// Update equivalent to the stored object
    Unchanged,
}

/// Any watched object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Service(KubeService),
    Endpoints(KubeEndpoints),
    Pod(KubePod),
    Node(KubeNode),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Service(_) => ResourceKind::Service,
            Resource::Endpoints(_) => ResourceKind::Endpoints,
            Resource::Pod(_) => ResourceKind::Pod,
            Resource::Node(_) => ResourceKind::Node,
        }
    }
}

impl From<KubeService> for Resource {
    fn from(obj: KubeService) -> Self {
        Resource::Service(obj)
    }
}

impl From<KubeEndpoints> for Resource {
    fn from(obj: KubeEndpoints) -> Self {
        Resource::Endpoints(obj)
    }
}

impl From<KubePod> for Resource {
    fn from(obj: KubePod) -> Self {
        Resource::Pod(obj)
    }
}

impl From<KubeNode> for Resource {
    fn from(obj: KubeNode) -> Self {
        Resource::Node(obj)
    }
}

/// Event delivered by a resource watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A (re)list started; objects not re-applied before `Synced` are gone
    Restarted(ResourceKind),
    Applied(Resource),
    Deleted(Resource),
    /// The initial or re-list completed
    Synced(ResourceKind),
}

/// Concurrent store of the last observed objects of one type
#[derive(Debug)]
pub struct ObjectStore<T> {
    items: DashMap<String, Arc<T>>,
    synced: AtomicBool,
    /// Keys seen since the last `Restarted`, while a relist is running
    relist: Mutex<Option<HashSet<String>>>,
}

impl<T> Default for ObjectStore<T> {
    fn default() -> Self {
        Self {
            items: DashMap::new(),
            synced: AtomicBool::new(false),
            relist: Mutex::new(None),
        }
    }
}

impl<T: KubeResource> ObjectStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.items.get(key).map(|e| e.value().clone())
    }

    pub fn get_by_name(&self, name: &str, namespace: &str) -> Option<Arc<T>> {
        self.get(&crate::objects::key_func(name, namespace))
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the initial list completed
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Store an added or updated object
    pub fn apply(&self, obj: T) -> StoreChange<T> {
        let key = obj.key();
        if let Some(seen) = self.relist.lock().as_mut() {
            seen.insert(key.clone());
        }

        let new = Arc::new(obj);
        match self.items.insert(key, new.clone()) {
            None => StoreChange::Changed(ResourceEvent::Added(new)),
            Some(old) if new.is_equivalent(&old) => StoreChange::Unchanged,
            Some(old) => StoreChange::Changed(ResourceEvent::Updated { old, new }),
        }
    }

    /// Remove an object, resolving it to its last stored state
    pub fn delete(&self, obj: T) -> ResourceEvent<T> {
        let key = obj.key();
        match self.items.remove(&key) {
            Some((_, last)) => ResourceEvent::Deleted(last),
            None => ResourceEvent::Deleted(Arc::new(obj)),
        }
    }

    /// Start tracking keys for a relist
    pub fn begin_relist(&self) {
        *self.relist.lock() = Some(HashSet::new());
    }

    /// Finish a relist and mark the store synced
    ///
    /// Returns a delete for every stored object the relist did not deliver.
    pub fn finish_relist(&self) -> Vec<ResourceEvent<T>> {
        let seen = self.relist.lock().take();
        let mut deleted = Vec::new();

        if let Some(seen) = seen {
            let stale: Vec<String> = self
                .items
                .iter()
                .filter(|e| !seen.contains(e.key()))
                .map(|e| e.key().clone())
                .collect();
            for key in stale {
                if let Some((_, obj)) = self.items.remove(&key) {
                    debug!(kind = %T::KIND, key = %key, "Object vanished during relist");
                    deleted.push(ResourceEvent::Deleted(obj));
                }
            }
        }

        self.synced.store(true, Ordering::SeqCst);
        deleted
    }

    /// Mark the store synced without a relist, e.g. in tests
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }
}

/// The four raw stores the registry reads from
#[derive(Debug, Default)]
pub struct ResourceCaches {
    pub services: ObjectStore<KubeService>,
    pub endpoints: ObjectStore<KubeEndpoints>,
    pub pods: ObjectStore<KubePod>,
    pub nodes: ObjectStore<KubeNode>,
}

impl ResourceCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_synced_kind(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Service => self.services.has_synced(),
            ResourceKind::Endpoints => self.endpoints.has_synced(),
            ResourceKind::Pod => self.pods.has_synced(),
            ResourceKind::Node => self.nodes.has_synced(),
        }
    }

    /// True once every watched type completed its initial list
    pub fn has_synced(&self) -> bool {
        ResourceKind::ALL.iter().all(|k| self.has_synced_kind(*k))
    }
}
