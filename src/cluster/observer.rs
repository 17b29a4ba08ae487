//! Cluster State Observer
//!
//! Waits for a predicate over [`ClusterState`] to hold on the current or a
//! future state, delivering exactly one outcome per wait: the matching
//! state, the close of the cluster service, or a timeout.
//!
//! Each wait is driven by an [`ObserverContext`]:
//!
//! ```text
//! Init --(predicate holds now)------------------------> Matched
//! Init --(service closed)-----------------------------> Closed
//! Init --(registered)--> Waiting --(predicate holds)--> Matched
//!                                --(service closed)---> Closed
//!                                --(timer fired)------> TimedOut
//!                                --(cancelled)--------> Cancelled
//! ```
//!
//! State notifications arrive on the service's update loop and timeouts on
//! a timer task, so the terminal transition is claimed with a single atomic
//! update that only succeeds from a non-terminal state. Whoever claims it
//! deregisters, cancels the timer and invokes the listener; everyone else
//! does nothing. A cancelled wait invokes no callback at all.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::{ClusterChangedEvent, ClusterService, ClusterState, ClusterStateListener, ListenerId, Registration};
use crate::error::{Error, Result};

/// Callbacks for the outcome of a wait. Exactly one is invoked per wait.
///
/// Callbacks run on the update loop, the timer task or the waiting caller,
/// so they must not block or wait for another update of the same service.
pub trait Listener: Send + Sync + 'static {
    /// The predicate holds for `state`
    fn on_new_cluster_state(&self, state: Arc<ClusterState>);

    /// The cluster service closed before the predicate held
    fn on_cluster_service_close(&self);

    /// Nothing matched within `timeout`
    fn on_timeout(&self, timeout: Duration);
}

/// Predicate evaluated against cluster states
pub type StatePredicate = Arc<dyn Fn(&ClusterState) -> bool + Send + Sync>;

/// Progress of a single wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitState {
    Init = 0,
    Waiting = 1,
    Matched = 2,
    Closed = 3,
    TimedOut = 4,
    Cancelled = 5,
}

impl WaitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WaitState::Init,
            1 => WaitState::Waiting,
            2 => WaitState::Matched,
            3 => WaitState::Closed,
            4 => WaitState::TimedOut,
            _ => WaitState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WaitState::Init | WaitState::Waiting)
    }
}

/// Outcome of [`ClusterStateObserver::wait_for`]
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Matched(Arc<ClusterState>),
    Closed,
    TimedOut(Duration),
}

impl WaitOutcome {
    /// Turn anything but a match into an error
    pub fn into_result(self) -> Result<Arc<ClusterState>> {
        match self {
            WaitOutcome::Matched(state) => Ok(state),
            WaitOutcome::Closed => Err(Error::Closed),
            WaitOutcome::TimedOut(timeout) => Err(Error::WaitTimeout(timeout)),
        }
    }
}

/// State shared between an observer and the waits it started
struct Observed {
    state: Mutex<Arc<ClusterState>>,
    timed_out: AtomicBool,
}

impl Observed {
    fn get(&self) -> Arc<ClusterState> {
        Arc::clone(&self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set(&self, state: Arc<ClusterState>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// One wait: registered on the service until it reaches a terminal state
pub struct ObserverContext {
    id: ListenerId,
    state: AtomicU8,
    predicate: StatePredicate,
    listener: Box<dyn Listener>,
    service: Weak<ClusterService>,
    observed: Arc<Observed>,
    timer: Mutex<Option<AbortHandle>>,
}

impl ObserverContext {
    pub fn wait_state(&self) -> WaitState {
        WaitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Claim the terminal state. Returns false if another outcome won.
    fn finish(&self, outcome: WaitState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if WaitState::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(outcome as u8)
                }
            })
            .is_ok()
    }

    /// Move from Init to Waiting unless an outcome already landed
    fn mark_waiting(&self) {
        let _ = self.state.compare_exchange(
            WaitState::Init as u8,
            WaitState::Waiting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
        }
    }

    fn deregister(&self) {
        if let Some(service) = self.service.upgrade() {
            service.remove_listener(self.id);
        }
    }

    fn matched(&self, state: Arc<ClusterState>) {
        if !self.finish(WaitState::Matched) {
            return;
        }
        self.deregister();
        self.cancel_timer();
        tracing::debug!("{} matched cluster state version {}", self.id, state.version());
        self.observed.set(Arc::clone(&state));
        self.listener.on_new_cluster_state(state);
    }

    fn closed(&self) {
        if !self.finish(WaitState::Closed) {
            return;
        }
        self.cancel_timer();
        tracing::debug!("{} released: cluster service closed", self.id);
        self.listener.on_cluster_service_close();
    }

    fn timed_out(&self, timeout: Duration) {
        if !self.finish(WaitState::TimedOut) {
            return;
        }
        self.deregister();
        tracing::debug!("{} timed out after {:?}", self.id, timeout);
        self.observed.timed_out.store(true, Ordering::Release);
        self.listener.on_timeout(timeout);
    }

    fn cancel(&self) {
        if !self.finish(WaitState::Cancelled) {
            return;
        }
        self.deregister();
        self.cancel_timer();
        tracing::trace!("{} cancelled", self.id);
    }

    fn arm_timer(self: &Arc<Self>, runtime: &tokio::runtime::Handle, timeout: Duration) {
        let context = Arc::clone(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            context.timed_out(timeout);
        });

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.wait_state().is_terminal() {
            // Resolved before the timer was stored; nobody else will cancel it
            handle.abort();
        } else {
            *timer = Some(handle.abort_handle());
        }
    }
}

impl ClusterStateListener for ObserverContext {
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        if self.wait_state().is_terminal() {
            return;
        }
        if (self.predicate)(event.state().as_ref()) {
            self.matched(Arc::clone(event.state()));
        }
    }

    fn on_close(&self) {
        self.closed();
    }
}

/// Handle to a wait started with [`ClusterStateObserver::wait_for_change`]
#[derive(Clone)]
pub struct WaitHandle {
    context: Arc<ObserverContext>,
}

impl WaitHandle {
    pub fn state(&self) -> WaitState {
        self.context.wait_state()
    }

    pub fn is_resolved(&self) -> bool {
        self.state().is_terminal()
    }

    /// Abandon the wait: deregister it and stop its timer without invoking
    /// the listener. Does nothing once the wait is resolved.
    pub fn cancel(&self) {
        self.context.cancel();
    }
}

/// Cancels a wait when the future awaiting it is dropped early
struct CancelOnDrop(WaitHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Observes a cluster service, starting from the state it was created at.
///
/// An observer may carry an overall timeout measured from its creation;
/// waits without an explicit timeout only get the remaining time.
pub struct ClusterStateObserver {
    service: Arc<ClusterService>,
    observed: Arc<Observed>,
    timeout: Option<Duration>,
    started: Instant,
}

impl ClusterStateObserver {
    /// Observer without an overall timeout
    pub fn new(service: Arc<ClusterService>) -> Self {
        let state = service.state();
        Self::with_state(service, state, None)
    }

    /// Observer whose waits must all complete within `timeout` of now
    pub fn with_timeout(service: Arc<ClusterService>, timeout: Duration) -> Self {
        let state = service.state();
        Self::with_state(service, state, Some(timeout))
    }

    /// Observer starting from a state the caller already read
    pub fn with_state(service: Arc<ClusterService>, state: Arc<ClusterState>, timeout: Option<Duration>) -> Self {
        Self {
            service,
            observed: Arc::new(Observed {
                state: Mutex::new(state),
                timed_out: AtomicBool::new(false),
            }),
            timeout,
            started: Instant::now(),
        }
    }

    /// Last state this observer saw match (or started from)
    pub fn observed_state(&self) -> Arc<ClusterState> {
        self.observed.get()
    }

    /// Whether any wait of this observer ended in a timeout
    pub fn is_timed_out(&self) -> bool {
        self.observed.timed_out.load(Ordering::Acquire)
    }

    /// Wait for any state newer than the observed one
    pub fn wait_for_next_change(&self, listener: impl Listener, timeout: Option<Duration>) -> WaitHandle {
        self.wait_for_next_change_matching(|_| true, listener, timeout)
    }

    /// Wait for a state newer than the observed one for which `predicate` holds
    pub fn wait_for_next_change_matching<P>(
        &self,
        predicate: P,
        listener: impl Listener,
        timeout: Option<Duration>,
    ) -> WaitHandle
    where
        P: Fn(&ClusterState) -> bool + Send + Sync + 'static,
    {
        let observed_version = self.observed.get().version();
        self.wait_for_change(
            move |state| state.version() > observed_version && predicate(state),
            listener,
            timeout,
        )
    }

    /// Wait until `predicate` holds for the current or a future state.
    ///
    /// When it already holds, `on_new_cluster_state` runs before this
    /// returns, even if the service is already closed. Without a timeout
    /// (explicit or the observer's) the wait lasts until a match or the
    /// service closes.
    ///
    /// The first evaluation runs under the service's registry lock, so
    /// `predicate` must only look at the state it is given: calling back
    /// into the [`ClusterService`] from it (`state`, `listener_count`, ...)
    /// deadlocks.
    pub fn wait_for_change<P>(&self, predicate: P, listener: impl Listener, timeout: Option<Duration>) -> WaitHandle
    where
        P: Fn(&ClusterState) -> bool + Send + Sync + 'static,
    {
        let timeout = timeout.or_else(|| {
            self.timeout
                .map(|total| total.saturating_sub(self.started.elapsed()))
        });

        let context = Arc::new(ObserverContext {
            id: self.service.next_listener_id(),
            state: AtomicU8::new(WaitState::Init as u8),
            predicate: Arc::new(predicate),
            listener: Box::new(listener),
            service: Arc::downgrade(&self.service),
            observed: Arc::clone(&self.observed),
            timer: Mutex::new(None),
        });

        let predicate = Arc::clone(&context.predicate);
        let registration = self.service.register_unless(
            context.id,
            |state| predicate(state),
            Arc::clone(&context) as Arc<dyn ClusterStateListener>,
        );

        match registration {
            Registration::Satisfied(state) => context.matched(state),
            Registration::Closed => context.closed(),
            Registration::Registered => {
                context.mark_waiting();
                tracing::trace!("{} waiting for cluster state change (timeout {:?})", context.id, timeout);
                match timeout {
                    Some(timeout) if timeout.is_zero() => context.timed_out(timeout),
                    Some(timeout) => context.arm_timer(self.service.runtime(), timeout),
                    None => {}
                }
            }
        }

        WaitHandle { context }
    }

    /// Async form of [`wait_for_change`](Self::wait_for_change).
    ///
    /// Dropping the future before it resolves cancels the wait.
    pub async fn wait_for<P>(&self, predicate: P, timeout: Option<Duration>) -> WaitOutcome
    where
        P: Fn(&ClusterState) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let _guard = CancelOnDrop(self.wait_for_change(predicate, ChannelListener::new(tx), timeout));
        // The sender only disappears without a value if the service was dropped unclosed
        rx.await.unwrap_or(WaitOutcome::Closed)
    }

    /// Async form of [`wait_for_next_change_matching`](Self::wait_for_next_change_matching)
    pub async fn wait_for_next<P>(&self, predicate: P, timeout: Option<Duration>) -> WaitOutcome
    where
        P: Fn(&ClusterState) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let _guard = CancelOnDrop(self.wait_for_next_change_matching(predicate, ChannelListener::new(tx), timeout));
        rx.await.unwrap_or(WaitOutcome::Closed)
    }
}

/// Forwards the outcome of a wait into a oneshot channel
struct ChannelListener {
    tx: Mutex<Option<oneshot::Sender<WaitOutcome>>>,
}

impl ChannelListener {
    fn new(tx: oneshot::Sender<WaitOutcome>) -> Self {
        Self { tx: Mutex::new(Some(tx)) }
    }

    fn send(&self, outcome: WaitOutcome) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Listener for ChannelListener {
    fn on_new_cluster_state(&self, state: Arc<ClusterState>) {
        self.send(WaitOutcome::Matched(state));
    }

    fn on_cluster_service_close(&self) {
        self.send(WaitOutcome::Closed);
    }

    fn on_timeout(&self, timeout: Duration) {
        self.send(WaitOutcome::TimedOut(timeout));
    }
}
