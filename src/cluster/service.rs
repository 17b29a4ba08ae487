//! Cluster Service
//!
//! Owns the current [`ClusterState`] and applies update tasks one at a time
//! on a dedicated update loop. After every applied task the registered
//! listeners are notified, in registration order, before the next task
//! starts.
//!
//! The registry lock is only held to swap the state and snapshot the
//! listeners, never while a task or a listener runs. Publishing the state
//! and taking the snapshot happen under the same lock, so a listener
//! registered while a round is being delivered sees that round's state as
//! the current one and is only notified of later rounds.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use super::{ClusterChangedEvent, ClusterState};
use crate::error::{Error, Result};

/// Receives cluster state changes from a [`ClusterService`]
pub trait ClusterStateListener: Send + Sync {
    /// Called on the update loop after a new state was applied
    fn cluster_changed(&self, event: &ClusterChangedEvent);

    /// Called once when the service closes while the listener is registered.
    ///
    /// A round already delivering on the update loop stops at the next
    /// listener once the service is closed, but a `cluster_changed` call in
    /// progress on another thread may still finish after `on_close`.
    fn on_close(&self) {}
}

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Result of [`ClusterService::register_unless`]
#[derive(Debug)]
pub enum Registration {
    /// The condition already held for this state; nothing was registered
    Satisfied(Arc<ClusterState>),
    /// The listener was registered and will see every later state
    Registered,
    /// The service is closed; nothing was registered
    Closed,
}

type Transition = Box<dyn FnOnce(&ClusterState) -> Result<ClusterState> + Send>;
type UpdateResult = Result<Option<Arc<ClusterState>>>;

/// A queued state update
struct UpdateTask {
    source: Arc<str>,
    transition: Transition,
    responder: oneshot::Sender<UpdateResult>,
}

impl UpdateTask {
    fn respond(self, result: UpdateResult) {
        // The submitter may have dropped its handle
        let _ = self.responder.send(result);
    }
}

/// Completion of a submitted update task.
///
/// Resolves to `Ok(Some(state))` once applied, `Ok(None)` if the task was
/// dropped because the service closed, or the error the transition
/// returned. Dropping it does not cancel the task.
#[must_use = "dropping a PendingUpdate does not cancel it, but its outcome is lost"]
pub struct PendingUpdate {
    rx: oneshot::Receiver<UpdateResult>,
}

impl PendingUpdate {
    fn dropped() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(None));
        Self { rx }
    }
}

impl Future for PendingUpdate {
    type Output = UpdateResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Ok(None)))
    }
}

struct Registry {
    state: Arc<ClusterState>,
    listeners: Vec<(ListenerId, Arc<dyn ClusterStateListener>)>,
    closed: bool,
}

struct Shared {
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one task and notify listeners
    fn apply(&self, task: UpdateTask) {
        let previous = {
            let registry = self.registry();
            if registry.closed {
                tracing::debug!("Dropping update [{}]: cluster service closed", task.source);
                drop(registry);
                task.respond(Ok(None));
                return;
            }
            Arc::clone(&registry.state)
        };

        let transition = task.transition;
        let next = match catch_unwind(AssertUnwindSafe(|| transition(previous.as_ref()))) {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                tracing::warn!("Cluster state update [{}] failed: {}", task.source, e);
                let _ = task.responder.send(Err(e));
                return;
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!("Cluster state update [{}] panicked: {}", task.source, reason);
                let _ = task.responder.send(Err(Error::Transition {
                    task: task.source.to_string(),
                    reason,
                }));
                return;
            }
        };

        let next = Arc::new(next.stamped(previous.version() + 1));
        let listeners = {
            let mut registry = self.registry();
            registry.state = Arc::clone(&next);
            registry.listeners.clone()
        };

        tracing::debug!(
            "Applied cluster state update [{}]: {} ({} listeners)",
            task.source,
            next,
            listeners.len()
        );

        let event = ClusterChangedEvent::new(Arc::clone(&task.source), Arc::clone(&next), previous);
        if event.master_changed() {
            tracing::info!(
                "Cluster master changed to [{}] by [{}]",
                next.master_node_id().unwrap_or("-"),
                task.source
            );
        }
        if event.nodes_changed() {
            tracing::info!("Cluster membership changed: {} nodes by [{}]", next.size(), task.source);
        }

        for (id, listener) in listeners {
            if self.registry().closed {
                tracing::debug!("Cluster service closed, skipping {} for version {}", id, next.version());
                continue;
            }
            tracing::trace!("Notifying {} of version {}", id, next.version());
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener.cluster_changed(&event))) {
                tracing::error!(
                    "{} panicked while handling update [{}]: {}",
                    id,
                    task.source,
                    panic_message(panic.as_ref())
                );
            }
        }

        let _ = task.responder.send(Ok(Some(next)));
    }
}

/// Holds the current cluster state and serializes updates to it
pub struct ClusterService {
    shared: Arc<Shared>,
    tasks: Mutex<Option<mpsc::UnboundedSender<UpdateTask>>>,
    next_listener_id: AtomicU64,
    runtime: Handle,
}

impl ClusterService {
    /// Create the service with its initial state and spawn its update loop on `runtime`
    pub fn new(initial_state: ClusterState, runtime: &Handle) -> Arc<Self> {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                state: Arc::new(initial_state),
                listeners: Vec::new(),
                closed: false,
            }),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<UpdateTask>();
        let loop_shared = Arc::clone(&shared);
        runtime.spawn(async move {
            tracing::debug!("Cluster state update loop started");
            while let Some(task) = rx.recv().await {
                loop_shared.apply(task);
            }
            tracing::debug!("Cluster state update loop stopped");
        });

        Arc::new(Self {
            shared,
            tasks: Mutex::new(Some(tx)),
            next_listener_id: AtomicU64::new(1),
            runtime: runtime.clone(),
        })
    }

    /// Create the service on the runtime of the calling task
    pub fn start(initial_state: ClusterState) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("cluster service needs a tokio runtime: {}", e)))?;
        Ok(Self::new(initial_state, &runtime))
    }

    /// The most recently applied state
    pub fn state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.shared.registry().state)
    }

    /// Runtime the service runs its update loop and timers on
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Queue a state update.
    ///
    /// Tasks are applied in submission order. After `close` the task is
    /// dropped without running and the returned handle resolves to `Ok(None)`.
    pub fn submit_state_update_task<F>(&self, source: impl Into<String>, transition: F) -> PendingUpdate
    where
        F: FnOnce(&ClusterState) -> Result<ClusterState> + Send + 'static,
    {
        let source: Arc<str> = Arc::from(source.into());
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tasks.as_ref() else {
            tracing::debug!("Ignoring update [{}] submitted after close", source);
            return PendingUpdate::dropped();
        };

        let (responder, rx) = oneshot::channel();
        let task = UpdateTask {
            source,
            transition: Box::new(transition),
            responder,
        };

        if let Err(mpsc::error::SendError(task)) = tx.send(task) {
            tracing::warn!("Cluster state update loop is gone, dropping [{}]", task.source);
            task.respond(Ok(None));
        }

        PendingUpdate { rx }
    }

    /// Allocate an id for a listener that will be registered later
    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener for future state changes.
    ///
    /// Registering on a closed service is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn ClusterStateListener>) -> ListenerId {
        let id = self.next_listener_id();
        let mut registry = self.shared.registry();
        if registry.closed {
            tracing::debug!("Not registering {}: cluster service closed", id);
        } else {
            registry.listeners.push((id, listener));
        }
        id
    }

    /// Atomically check the current state and register when the check fails.
    ///
    /// The check runs first, so a closed service still reports `Satisfied`
    /// for a state that already matches. `satisfied` runs under the registry
    /// lock: it must be cheap and must not call back into this service.
    /// No state change can land between the check and the registration.
    pub fn register_unless<F>(
        &self,
        id: ListenerId,
        satisfied: F,
        listener: Arc<dyn ClusterStateListener>,
    ) -> Registration
    where
        F: FnOnce(&ClusterState) -> bool,
    {
        let mut registry = self.shared.registry();
        if satisfied(registry.state.as_ref()) {
            return Registration::Satisfied(Arc::clone(&registry.state));
        }

        if registry.closed {
            return Registration::Closed;
        }

        registry.listeners.push((id, listener));
        tracing::trace!("Registered {} at version {}", id, registry.state.version());
        Registration::Registered
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.shared.registry();
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.shared.registry().listeners.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry().closed
    }

    /// Close the service.
    ///
    /// Queued tasks that have not started are dropped, every registered
    /// listener receives `on_close` and the registry is cleared. Calling it
    /// again has no effect.
    pub fn close(&self) {
        let listeners = {
            let mut registry = self.shared.registry();
            if registry.closed {
                return;
            }
            registry.closed = true;
            std::mem::take(&mut registry.listeners)
        };

        // Dropping the sender lets the update loop drain and exit
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        tracing::info!("Closing cluster service, releasing {} listeners", listeners.len());

        for (id, listener) in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener.on_close())) {
                tracing::error!("{} panicked while handling close: {}", id, panic_message(panic.as_ref()));
            }
        }
    }
}

impl Drop for ClusterService {
    fn drop(&mut self) {
        self.close();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DiscoveryNode;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        versions: Mutex<Vec<u64>>,
        closes: AtomicUsize,
    }

    impl ClusterStateListener for Recorder {
        fn cluster_changed(&self, event: &ClusterChangedEvent) {
            self.versions.lock().unwrap().push(event.state().version());
        }

        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service() -> Arc<ClusterService> {
        let local = DiscoveryNode::new("node-1", "127.0.0.1:9300");
        ClusterService::start(ClusterState::initial("test", local)).unwrap()
    }

    fn add_member(id: &'static str) -> impl FnOnce(&ClusterState) -> Result<ClusterState> + Send {
        move |state| {
            state
                .builder()
                .add_node(DiscoveryNode::new(id, "127.0.0.1:0"))
                .build()
        }
    }

    #[tokio::test]
    async fn test_updates_apply_in_order() {
        let service = service();
        let recorder = Arc::new(Recorder::default());
        service.add_listener(recorder.clone());

        let pending: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|id| service.submit_state_update_task(format!("add-{}", id), add_member(id)))
            .collect();

        let mut last = 0;
        for update in pending {
            let state = update.await.unwrap().unwrap();
            assert!(state.version() > last);
            last = state.version();
        }

        assert_eq!(*recorder.versions.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(service.state().version(), 4);
        assert_eq!(service.state().size(), 5);
    }

    #[tokio::test]
    async fn test_failed_transition_leaves_state_unchanged() {
        let service = service();
        let before = service.state();

        let failed = service
            .submit_state_update_task("bad", |_| Err(Error::InvalidState("rejected".into())))
            .await;
        assert!(matches!(failed, Err(Error::InvalidState(_))));

        let panicked = service
            .submit_state_update_task("panics", |_| panic!("transition blew up"))
            .await;
        match panicked {
            Err(Error::Transition { task, reason }) => {
                assert_eq!(task, "panics");
                assert!(reason.contains("blew up"));
            }
            other => panic!("unexpected result: {:?}", other.map(|s| s.map(|s| s.version()))),
        }

        assert_eq!(service.state().version(), before.version());

        // Later tasks still apply
        let applied = service.submit_state_update_task("ok", add_member("x")).await.unwrap();
        assert_eq!(applied.unwrap().version(), before.version() + 1);
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_block_others() {
        struct Panicky;
        impl ClusterStateListener for Panicky {
            fn cluster_changed(&self, _event: &ClusterChangedEvent) {
                panic!("listener failure");
            }
        }

        let service = service();
        service.add_listener(Arc::new(Panicky));
        let recorder = Arc::new(Recorder::default());
        service.add_listener(recorder.clone());

        service.submit_state_update_task("add", add_member("a")).await.unwrap();
        assert_eq!(*recorder.versions.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let service = service();
        let recorder = Arc::new(Recorder::default());
        let id = service.add_listener(recorder.clone());

        service.submit_state_update_task("one", add_member("a")).await.unwrap();
        assert!(service.remove_listener(id));
        assert!(!service.remove_listener(id));
        service.submit_state_update_task("two", add_member("b")).await.unwrap();

        assert_eq!(*recorder.versions.lock().unwrap(), vec![1]);
        assert_eq!(service.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_listener_added_during_round_sees_only_later_rounds() {
        struct Registrar {
            service: std::sync::Weak<ClusterService>,
            late: Arc<Recorder>,
            done: AtomicUsize,
        }

        impl ClusterStateListener for Registrar {
            fn cluster_changed(&self, _event: &ClusterChangedEvent) {
                if self.done.fetch_add(1, Ordering::SeqCst) == 0 {
                    if let Some(service) = self.service.upgrade() {
                        service.add_listener(self.late.clone());
                    }
                }
            }
        }

        let service = service();
        let late = Arc::new(Recorder::default());
        service.add_listener(Arc::new(Registrar {
            service: Arc::downgrade(&service),
            late: late.clone(),
            done: AtomicUsize::new(0),
        }));

        service.submit_state_update_task("one", add_member("a")).await.unwrap();
        assert!(late.versions.lock().unwrap().is_empty());

        service.submit_state_update_task("two", add_member("b")).await.unwrap();
        assert_eq!(*late.versions.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_register_unless() {
        let service = service();
        let recorder = Arc::new(Recorder::default());

        let id = service.next_listener_id();
        let registration = service.register_unless(id, |s| s.size() == 1, recorder.clone());
        assert!(matches!(registration, Registration::Satisfied(ref s) if s.version() == 0));
        assert_eq!(service.listener_count(), 0);

        let registration = service.register_unless(id, |s| s.has_master(), recorder.clone());
        assert!(matches!(registration, Registration::Registered));
        assert_eq!(service.listener_count(), 1);

        service.close();
        let registration = service.register_unless(id, |_| false, recorder.clone());
        assert!(matches!(registration, Registration::Closed));

        // A matching state is still reported after close
        let registration = service.register_unless(id, |s| s.size() == 1, recorder.clone());
        assert!(matches!(registration, Registration::Satisfied(_)));
        assert_eq!(service.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_close_during_round_skips_remaining_listeners() {
        struct Closer(std::sync::Weak<ClusterService>);

        impl ClusterStateListener for Closer {
            fn cluster_changed(&self, _event: &ClusterChangedEvent) {
                if let Some(service) = self.0.upgrade() {
                    service.close();
                }
            }
        }

        let service = service();
        service.add_listener(Arc::new(Closer(Arc::downgrade(&service))));
        let recorder = Arc::new(Recorder::default());
        service.add_listener(recorder.clone());

        let applied = service.submit_state_update_task("add", add_member("a")).await.unwrap();
        assert_eq!(applied.unwrap().version(), 1);

        assert!(service.is_closed());
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert!(recorder.versions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_updates() {
        let service = service();
        let recorder = Arc::new(Recorder::default());
        service.add_listener(recorder.clone());

        service.close();
        service.close();
        assert!(service.is_closed());
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(service.listener_count(), 0);

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let outcome = service
            .submit_state_update_task("late", move |state| {
                counter.fetch_add(1, Ordering::SeqCst);
                state.builder().build()
            })
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(service.state().version(), 0);
        assert!(recorder.versions.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_drops_queued_tasks() {
        let service = service();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();

        // Block the update loop so later tasks stay queued
        let first = service.submit_state_update_task("blocker", move |state| {
            let _ = gate_rx.recv();
            state.builder().build()
        });
        let queued = service.submit_state_update_task("queued", add_member("a"));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        service.close();
        gate_tx.send(()).unwrap();

        assert!(first.await.unwrap().is_some());
        assert!(queued.await.unwrap().is_none());
        assert_eq!(service.state().version(), 1);
    }
}
