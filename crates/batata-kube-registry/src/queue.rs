//! Single-worker task queue
//!
//! Watch events become `Task`s and are handled strictly in the order they were
//! pushed, one at a time. A task that fails because the caches have not
//! synced yet is held at the head of the queue and retried after
//! `retry_delay`, so no later task overtakes it. Any other failure is logged
//! and the task is dropped.

use std::time::Duration;

use batata_mesh::Event;
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::objects::{KubeEndpoints, KubeNode, KubePod, KubeResource, KubeService, ResourceKind};
use crate::store::ResourceEvent;

/// A unit of work for the queue worker
#[derive(Debug, Clone)]
pub enum Task {
    Service(ResourceEvent<KubeService>),
    Endpoints(ResourceEvent<KubeEndpoints>),
    Pod(ResourceEvent<KubePod>),
    Node(ResourceEvent<KubeNode>),
}

impl Task {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Task::Service(_) => ResourceKind::Service,
            Task::Endpoints(_) => ResourceKind::Endpoints,
            Task::Pod(_) => ResourceKind::Pod,
            Task::Node(_) => ResourceKind::Node,
        }
    }

    pub fn event(&self) -> Event {
        match self {
            Task::Service(e) => e.event(),
            Task::Endpoints(e) => e.event(),
            Task::Pod(e) => e.event(),
            Task::Node(e) => e.event(),
        }
    }

    /// Store key of the object the task is about
    pub fn key(&self) -> String {
        match self {
            Task::Service(e) => e.object().key(),
            Task::Endpoints(e) => e.object().key(),
            Task::Pod(e) => e.object().key(),
            Task::Node(e) => e.object().key(),
        }
    }
}

/// Dispatches tasks taken off the queue
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &Task) -> Result<(), RegistryError>;
}

/// Ordered task queue with a single consumer
pub struct Queue {
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    /// Head task waiting to be retried
    held: parking_lot::Mutex<Option<Task>>,
    retry_delay: Duration,
}

impl Queue {
    pub fn new(retry_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            held: parking_lot::Mutex::new(None),
            retry_delay,
        }
    }

    /// Append a task; never blocks
    pub fn push(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("Task queue closed, dropping task");
        }
    }

    /// Run the worker until `stop` flips to true
    pub async fn run<H: TaskHandler + ?Sized>(&self, handler: &H, mut stop: watch::Receiver<bool>) {
        let mut rx = self.rx.lock().await;
        info!("Task queue worker started");

        loop {
            if *stop.borrow() {
                break;
            }
            let held = self.held.lock().take();
            let task = match held {
                Some(task) => task,
                None => tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                },
            };

            let Err(error) = handler.handle(&task) else {
                continue;
            };
            if !self.on_failure(task, error) {
                continue;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!("Task queue worker stopped");
    }

    /// Handle every task queued right now, then return
    ///
    /// Stops at the first task failing with a retryable error; that task and
    /// everything behind it stay queued in order. Returns the number of tasks
    /// handled successfully.
    pub async fn drain<H: TaskHandler + ?Sized>(&self, handler: &H) -> usize {
        let mut rx = self.rx.lock().await;
        let mut handled = 0;

        loop {
            let held = self.held.lock().take();
            let task = match held {
                Some(task) => task,
                None => match rx.try_recv() {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };
            match handler.handle(&task) {
                Ok(()) => handled += 1,
                Err(e) => {
                    if self.on_failure(task, e) {
                        break;
                    }
                }
            }
        }

        handled
    }

    /// Hold a retryable task at the head, drop anything else.
    ///
    /// Returns true when the task was held.
    fn on_failure(&self, task: Task, error: RegistryError) -> bool {
        if !error.is_retryable() {
            warn!(
                kind = %task.kind(),
                key = %task.key(),
                event = %task.event(),
                error = %error,
                "Dropping failed task"
            );
            return false;
        }

        debug!(kind = %task.kind(), key = %task.key(), error = %error, "Retrying task");
        *self.held.lock() = Some(task);
        true
    }
}

/// Handler appended to a chain
pub type ChainFn<T> = Box<dyn Fn(&T, Event) -> Result<(), RegistryError> + Send + Sync>;

/// Ordered list of handlers; the first failure stops the chain
pub struct ChainHandler<T> {
    funcs: RwLock<Vec<ChainFn<T>>>,
}

impl<T> Default for ChainHandler<T> {
    fn default() -> Self {
        Self {
            funcs: RwLock::new(Vec::new()),
        }
    }
}

impl<T> ChainHandler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, f: ChainFn<T>) {
        self.funcs.write().push(f);
    }

    pub fn len(&self) -> usize {
        self.funcs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.read().is_empty()
    }

    pub fn apply(&self, obj: &T, event: Event) -> Result<(), RegistryError> {
        for f in self.funcs.read().iter() {
            f(obj, event)?;
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for ChainHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHandler")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Recorder {
        synced: AtomicBool,
        seen: parking_lot::Mutex<Vec<String>>,
        fail_key: Option<String>,
    }

    impl Recorder {
        fn new(synced: bool) -> Self {
            Self {
                synced: AtomicBool::new(synced),
                seen: parking_lot::Mutex::new(Vec::new()),
                fail_key: None,
            }
        }
    }

    impl TaskHandler for Recorder {
        fn handle(&self, task: &Task) -> Result<(), RegistryError> {
            if !self.synced.load(Ordering::SeqCst) {
                return Err(RegistryError::NotSynced);
            }
            if self.fail_key.as_deref() == Some(task.key().as_str()) {
                return Err(RegistryError::ServiceNotFound(task.key()));
            }
            self.seen.lock().push(task.key());
            Ok(())
        }
    }

    fn service_task(name: &str) -> Task {
        Task::Service(ResourceEvent::Added(Arc::new(KubeService::new(name, "ns"))))
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let queue = Queue::new(Duration::from_millis(10));
        let handler = Recorder::new(true);

        queue.push(service_task("a"));
        queue.push(service_task("b"));
        queue.push(service_task("c"));

        assert_eq!(queue.drain(&handler).await, 3);
        assert_eq!(*handler.seen.lock(), vec!["ns/a", "ns/b", "ns/c"]);
    }

    #[tokio::test]
    async fn test_not_synced_tasks_are_kept() {
        let queue = Queue::new(Duration::from_millis(10));
        let handler = Recorder::new(false);
        queue.push(service_task("a"));

        assert_eq!(queue.drain(&handler).await, 0);

        handler.synced.store(true, Ordering::SeqCst);
        assert_eq!(queue.drain(&handler).await, 1);
        assert_eq!(*handler.seen.lock(), vec!["ns/a"]);
    }

    #[tokio::test]
    async fn test_steady_state_failure_is_dropped() {
        let queue = Queue::new(Duration::from_millis(10));
        let mut handler = Recorder::new(true);
        handler.fail_key = Some("ns/bad".to_string());

        queue.push(service_task("bad"));
        queue.push(service_task("good"));

        assert_eq!(queue.drain(&handler).await, 1);
        assert_eq!(queue.drain(&handler).await, 0);
        assert_eq!(*handler.seen.lock(), vec!["ns/good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_after_delay() {
        let queue = Arc::new(Queue::new(Duration::from_secs(1)));
        let handler = Arc::new(Recorder::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);

        queue.push(service_task("a"));

        let worker = {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move { queue.run(handler.as_ref(), stop_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handler.seen.lock().is_empty());

        handler.synced.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*handler.seen.lock(), vec!["ns/a"]);

        stop_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_keeps_order_behind_unsynced_task() {
        let queue = Queue::new(Duration::from_millis(10));
        let handler = Recorder::new(false);
        queue.push(service_task("a"));
        queue.push(service_task("b"));

        assert_eq!(queue.drain(&handler).await, 0);

        handler.synced.store(true, Ordering::SeqCst);
        queue.push(service_task("c"));
        assert_eq!(queue.drain(&handler).await, 3);
        assert_eq!(*handler.seen.lock(), vec!["ns/a", "ns/b", "ns/c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_lets_later_tasks_overtake_a_retry() {
        let queue = Arc::new(Queue::new(Duration::from_secs(1)));
        let handler = Arc::new(Recorder::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move { queue.run(handler.as_ref(), stop_rx).await })
        };

        queue.push(service_task("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        handler.synced.store(true, Ordering::SeqCst);
        queue.push(service_task("b"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handler.seen.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*handler.seen.lock(), vec!["ns/a", "ns/b"]);

        stop_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[test]
    fn test_chain_stops_at_first_error() {
        let chain: ChainHandler<String> = ChainHandler::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        chain.append(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::NoWorkloadLabels)
        }));
        let c = calls.clone();
        chain.append(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(chain.apply(&"svc".to_string(), Event::Add).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.len(), 2);
    }
}
