//! State manager — the single writer of the run projection
//!
//! Subscribes to every event on the bus, applies each to the projection in
//! arrival order and publishes the new version. Change listeners run on a
//! separate dispatcher task fed by an unbounded channel, so a slow listener
//! never holds up the apply loop. Readers take a read lock only long enough
//! to build a snapshot, so every read is a coherent point-in-time view.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::projection::{Projection, DEFAULT_HISTORY_CAPACITY};
use super::query::QueryInterface;
use super::types::*;
use crate::events::{Event, EventBus, EventStream};

/// Error type for state manager operations
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("State manager already started")]
    AlreadyStarted,

    #[error("No Tokio runtime available to run the processing loop")]
    NoRuntime,

    #[error("State manager is consuming the bus; direct ingest is disabled")]
    Running,
}

/// Result type for state manager operations
pub type StateResult<T> = Result<T, StateError>;

/// How long `stop` lets queued notifications drain before cancelling listeners
pub const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type ChangeCallback =
    Arc<dyn Fn(StateChange) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Listener {
    id: u64,
    filter: ChangeFilter,
    callback: ChangeCallback,
}

/// Registered change listeners
#[derive(Default)]
pub(crate) struct Listeners {
    entries: RwLock<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
}

impl Listeners {
    fn add(&self, filter: ChangeFilter, callback: ChangeCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Listener {
                id,
                filter,
                callback,
            }));
        id
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|l| l.id != id);
        before != entries.len()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Notify every interested listener; returns how many succeeded.
    ///
    /// A listener that errors or panics is logged and skipped.
    async fn notify(&self, change: &StateChange) -> usize {
        let interested: Vec<Arc<Listener>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.filter.accepts(change.category))
            .cloned()
            .collect();

        let mut delivered = 0;
        for listener in interested {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
                (listener.callback)(change.clone())
            }));
            let outcome = match call {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    listener = listener.id,
                    version = change.version,
                    error = %e,
                    "State listener failed"
                ),
                Err(_) => warn!(
                    listener = listener.id,
                    version = change.version,
                    "State listener panicked"
                ),
            }
        }
        delivered
    }
}

/// Handle returned by `subscribe`; call `unsubscribe` to stop notifications
#[derive(Debug)]
pub struct Unsubscribe {
    listeners: Weak<Listeners>,
    id: u64,
}

impl Unsubscribe {
    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.listeners
            .upgrade()
            .map(|listeners| listeners.remove(self.id))
            .unwrap_or(false)
    }
}

/// State shared between the manager, its loop and query handles
pub(crate) struct ManagerShared {
    projection: RwLock<Projection>,
    listeners: Arc<Listeners>,
    version_tx: watch::Sender<u64>,
}

impl ManagerShared {
    fn new(history_capacity: usize) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            projection: RwLock::new(Projection::with_history_capacity(history_capacity)),
            listeners: Arc::new(Listeners::default()),
            version_tx,
        }
    }

    /// Run `f` against the projection under the read lock
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Projection) -> R) -> R {
        let projection = self
            .projection
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&projection)
    }

    /// Apply one event under the write lock and publish the new version
    fn apply(&self, event: &Event) -> StateChange {
        let change = self
            .projection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(event);
        self.version_tx.send_replace(change.version);

        debug!(
            version = change.version,
            category = %change.category,
            event_type = %change.event_type,
            "Event applied"
        );
        change
    }

    pub(crate) fn subscribe<F, Fut>(&self, filter: ChangeFilter, callback: F) -> Unsubscribe
    where
        F: Fn(StateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: ChangeCallback = Arc::new(move |change: StateChange| callback(change).boxed());
        let id = self.listeners.add(filter, callback);
        Unsubscribe {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    pub(crate) fn version_receiver(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
    dispatch_cancel: CancellationToken,
    dispatcher: JoinHandle<u64>,
}

impl Worker {
    fn cancel_all(&self) {
        self.cancel.cancel();
        self.dispatch_cancel.cancel();
    }
}

/// Sole consumer of the full event stream and owner of the projection
pub struct StateManager {
    bus: EventBus,
    shared: Arc<ManagerShared>,
    started: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl StateManager {
    /// Create a manager reading from `bus`; call `start` to begin processing
    pub fn new(bus: EventBus) -> Self {
        Self::with_history_capacity(bus, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(bus: EventBus, history_capacity: usize) -> Self {
        Self {
            bus,
            shared: Arc::new(ManagerShared::new(history_capacity)),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Subscribe to `"*"` and spawn the processing loop.
    ///
    /// The subscription exists when this returns, so events emitted
    /// afterwards are seen. Only one start per instance is allowed.
    pub fn start(&self) -> StateResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StateError::NoRuntime)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StateError::AlreadyStarted);
        }

        let stream = self.bus.subscribe("*");
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let dispatch_cancel = CancellationToken::new();
        let dispatcher = runtime.spawn(dispatch_changes(
            self.shared.listeners.clone(),
            notify_rx,
            dispatch_cancel.clone(),
        ));

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(process_events(
            self.shared.clone(),
            stream,
            notify_tx,
            cancel.clone(),
        ));

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker {
            cancel,
            handle,
            dispatch_cancel,
            dispatcher,
        });
        info!("State manager started");
        Ok(())
    }

    /// Stop the processing loop and the listener dispatcher. Idempotent.
    ///
    /// Notifications already queued get up to `LISTENER_DRAIN_TIMEOUT` to
    /// finish; listeners still running after that are cancelled.
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut worker) = worker else {
            return;
        };

        worker.cancel.cancel();
        match (&mut worker.handle).await {
            Ok(applied) => info!(applied, "State manager stopped"),
            Err(e) if e.is_cancelled() => debug!("State manager loop cancelled"),
            Err(e) => warn!(error = %e, "State manager loop panicked"),
        }

        // The loop owned the only sender, so the dispatcher ends once drained
        let drained = tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, &mut worker.dispatcher).await;
        let dispatched = match drained {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = LISTENER_DRAIN_TIMEOUT.as_millis() as u64,
                    "Listeners did not finish in time, cancelling"
                );
                worker.dispatch_cancel.cancel();
                (&mut worker.dispatcher).await
            }
        };
        match dispatched {
            Ok(notified) => debug!(notified, "Listener dispatcher stopped"),
            Err(e) if e.is_cancelled() => debug!("Listener dispatcher cancelled"),
            Err(e) => warn!(error = %e, "Listener dispatcher panicked"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Apply one event directly and notify listeners inline.
    ///
    /// For replaying into a manager that never consumes the bus. Once
    /// `start` has been called the processing loop is the only writer and
    /// this returns `StateError::Running`.
    pub async fn ingest(&self, event: Event) -> StateResult<StateChange> {
        if self.started.load(Ordering::SeqCst) {
            return Err(StateError::Running);
        }
        let change = self.shared.apply(&event);
        self.shared.listeners.notify(&change).await;
        Ok(change)
    }

    /// Current projection version
    pub fn version(&self) -> u64 {
        self.shared.read(|p| p.version())
    }

    /// Wait until the projection reaches `version`. Returns false on timeout.
    pub async fn wait_for_version(&self, version: u64, timeout: Duration) -> bool {
        let mut rx = self.shared.version_receiver();
        tokio::time::timeout(timeout, rx.wait_for(|v| *v >= version))
            .await
            .map(|reached| reached.is_ok())
            .unwrap_or(false)
    }

    /// Register a change listener for a category, or for everything
    pub fn subscribe<F, Fut>(&self, filter: impl Into<ChangeFilter>, callback: F) -> Unsubscribe
    where
        F: Fn(StateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.subscribe(filter.into(), callback)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Read-only facade sharing this manager's projection
    pub fn query(&self) -> QueryInterface {
        QueryInterface::new(self.shared.clone())
    }

    // =========================================================================
    // Snapshot builders
    // =========================================================================

    pub fn build_agent_tree(&self) -> AgentTree {
        self.shared.read(|p| p.build_agent_tree())
    }

    pub fn build_negotiation_snapshot(&self) -> NegotiationSnapshot {
        self.shared.read(|p| p.build_negotiation_snapshot())
    }

    pub fn build_token_usage(&self) -> TokenUsageSummary {
        self.shared.read(|p| p.build_token_usage())
    }

    pub fn build_trace_timeline(&self) -> TraceTimeline {
        self.shared.read(|p| p.build_trace_timeline())
    }

    pub fn build_snapshot(&self) -> RunSnapshot {
        self.shared.read(|p| p.build_snapshot())
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.cancel_all();
        }
    }
}

async fn process_events(
    shared: Arc<ManagerShared>,
    mut stream: EventStream,
    notify_tx: mpsc::UnboundedSender<StateChange>,
    cancel: CancellationToken,
) -> u64 {
    let mut applied = 0;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let change = shared.apply(&event);
        applied += 1;
        if notify_tx.send(change).is_err() {
            debug!("Listener dispatcher gone, change not delivered");
        }
    }
    applied
}

/// Run listeners for each change in version order
async fn dispatch_changes(
    listeners: Arc<Listeners>,
    mut changes: mpsc::UnboundedReceiver<StateChange>,
    cancel: CancellationToken,
) -> u64 {
    let mut notified = 0;
    loop {
        let change = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = changes.recv() => match next {
                Some(change) => change,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = listeners.notify(&change) => notified += 1,
        }
    }
    notified
}
