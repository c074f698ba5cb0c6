//! Checkpoint service loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::CheckpointStore;
use super::{Checkpoint, CheckpointConfig, CheckpointError, CheckpointResult, MANUAL_TRIGGER};
use crate::events::{Event, EventBus, EventStream};
use crate::state::QueryInterface;

struct ServiceInner {
    query: QueryInterface,
    store: Arc<dyn CheckpointStore>,
    config: CheckpointConfig,
    saved: AtomicU64,
    /// Bus events fully handled by the loop, triggers or not
    seen_tx: watch::Sender<u64>,
}

impl ServiceInner {
    async fn checkpoint(&self, trigger: &str) -> CheckpointResult<Checkpoint> {
        let checkpoint = Checkpoint::new(trigger, self.query.get_snapshot());
        self.store.save(&checkpoint).await?;
        self.saved.fetch_add(1, Ordering::Relaxed);
        info!(
            trigger,
            version = checkpoint.version(),
            id = %checkpoint.id,
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Checkpoint after the projection has caught up with `event`
    async fn on_trigger(&self, event: &Event) {
        let settled = self
            .query
            .wait_until_applied(event, self.config.settle_timeout)
            .await;
        if !settled {
            warn!(
                event_type = event.event_type(),
                timeout_ms = self.config.settle_timeout.as_millis() as u64,
                "Projection did not apply trigger event in time; checkpointing current state"
            );
        }

        if let Err(e) = self.checkpoint(event.event_type()).await {
            warn!(event_type = event.event_type(), error = %e, "Checkpoint failed");
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Persists snapshots whenever a trigger event crosses the bus
pub struct CheckpointService {
    bus: EventBus,
    inner: Arc<ServiceInner>,
    worker: Mutex<Option<Worker>>,
}

impl CheckpointService {
    pub fn new(
        bus: EventBus,
        query: QueryInterface,
        store: Arc<dyn CheckpointStore>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            bus,
            inner: Arc::new(ServiceInner {
                query,
                store,
                config,
                saved: AtomicU64::new(0),
                seen_tx: watch::channel(0).0,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Subscribe to `"*"` and start watching for triggers
    pub fn start(&self) -> CheckpointResult<()> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| CheckpointError::NoRuntime)?;
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(CheckpointError::AlreadyStarted);
        }

        let stream = self.bus.subscribe("*");
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(watch_triggers(self.inner.clone(), stream, cancel.clone()));
        *worker = Some(Worker { cancel, handle });

        info!(triggers = ?self.inner.config.triggers, "Checkpoint service started");
        Ok(())
    }

    /// Stop watching. A checkpoint in progress is abandoned.
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Checkpoint service task failed");
            }
        }
        info!(saved = self.saved_count(), "Checkpoint service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Save a `manual` checkpoint of the current projection
    pub async fn checkpoint_now(&self) -> CheckpointResult<Checkpoint> {
        self.inner.checkpoint(MANUAL_TRIGGER).await
    }

    /// Checkpoints saved by this service so far
    pub fn saved_count(&self) -> u64 {
        self.inner.saved.load(Ordering::Relaxed)
    }

    /// Wait until the loop has handled `count` bus events. Returns false on timeout.
    ///
    /// Used to let the last trigger finish before `stop`.
    pub async fn wait_for_seen(&self, count: u64, timeout: Duration) -> bool {
        let mut rx = self.inner.seen_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|seen| *seen >= count))
            .await
            .map(|reached| reached.is_ok())
            .unwrap_or(false)
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.store
    }
}

impl Drop for CheckpointService {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.cancel.cancel();
        }
    }
}

async fn watch_triggers(
    inner: Arc<ServiceInner>,
    mut stream: EventStream,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        if inner.config.is_trigger(event.event_type()) {
            debug!(event_type = event.event_type(), "Checkpoint trigger");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = inner.on_trigger(&event) => {}
            }
        }
        inner.seen_tx.send_modify(|seen| *seen += 1);
    }
}
