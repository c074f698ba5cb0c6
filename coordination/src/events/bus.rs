//! Event bus for run coordination
//!
//! Pattern-routed pub/sub over bounded per-subscriber queues. Each
//! subscription owns a Tokio mpsc channel; `emit` snapshots the active
//! subscriptions under a short lock and then delivers without holding it.
//! A subscriber whose queue stays full past the put timeout loses that
//! event; emission itself never blocks indefinitely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::types::Event;

/// Queue capacity used by `subscribe`
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// How long `emit` waits on a full subscriber queue before dropping
pub const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(1);

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Queue capacity for subscriptions created with `subscribe`
    pub default_capacity: usize,
    /// Bounded wait per subscriber when its queue is full
    pub put_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_QUEUE_CAPACITY,
            put_timeout: DEFAULT_PUT_TIMEOUT,
        }
    }
}

impl EventBusConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(capacity) = std::env::var("COORD_BUS_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.default_capacity = capacity;
        }
        if let Some(ms) = std::env::var("COORD_BUS_PUT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.put_timeout = Duration::from_millis(ms);
        }

        config
    }
}

/// Whole-string glob matched against `event_type`.
///
/// `*` matches any run of characters including `.`, so `"agent.*"` also
/// matches `"agent.nested.thing"`. A pattern that fails to compile as a
/// glob is compared literally.
#[derive(Debug, Clone)]
enum EventPattern {
    Glob(glob::Pattern),
    Exact(String),
}

impl EventPattern {
    fn parse(pattern: &str) -> Self {
        match glob::Pattern::new(pattern) {
            Ok(glob) => Self::Glob(glob),
            Err(e) => {
                warn!(pattern, error = %e, "Invalid subscription pattern, using exact match");
                Self::Exact(pattern.to_string())
            }
        }
    }

    fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Glob(glob) => glob.matches(event_type),
            Self::Exact(exact) => exact == event_type,
        }
    }
}

/// Bus-side half of a subscription
struct Subscription {
    id: u64,
    pattern: EventPattern,
    sender: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Enqueue with a bounded wait. Returns whether the event was accepted.
    async fn put(&self, event: Event, timeout: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = tokio::time::timeout(timeout, self.sender.send(event)) => match sent {
                Ok(Ok(())) => true,
                // Receiver dropped between snapshot and delivery
                Ok(Err(_)) => false,
                Err(_) => {
                    warn!(subscription = self.id, "Subscriber queue full, event dropped");
                    false
                }
            },
        }
    }
}

struct BusInner {
    config: EventBusConfig,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn subscriptions(&self) -> MutexGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) -> bool {
        let mut subs = self.subscriptions();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }
}

/// Event bus with per-subscriber bounded queues
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new event bus with default configuration
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create an event bus with explicit configuration
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Subscribe to events whose type matches `pattern`
    pub fn subscribe(&self, pattern: &str) -> EventStream {
        self.subscribe_with_capacity(pattern, self.inner.config.default_capacity)
    }

    /// Subscribe with an explicit queue capacity (clamped to at least 1)
    pub fn subscribe_with_capacity(&self, pattern: &str, capacity: usize) -> EventStream {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let subscription = Arc::new(Subscription {
            id,
            pattern: EventPattern::parse(pattern),
            sender,
            cancel: cancel.clone(),
        });

        let count = {
            let mut subs = self.inner.subscriptions();
            subs.push(subscription);
            subs.len()
        };
        debug!(subscription = id, pattern, capacity, subscribers = count, "Subscribed");

        EventStream {
            id,
            pattern: pattern.to_string(),
            receiver,
            cancel,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Cancel a stream and remove its subscription. Safe to call repeatedly.
    pub fn unsubscribe(&self, stream: &EventStream) {
        stream.cancel.cancel();
        if self.inner.remove(stream.id) {
            debug!(subscription = stream.id, "Unsubscribed");
        }
    }

    /// Deliver an event to every matching subscription.
    ///
    /// Returns how many subscribers accepted the event. Subscribers that
    /// stay full past the put timeout miss it; that is not an error.
    pub async fn emit(&self, event: Event) -> usize {
        let snapshot: Vec<Arc<Subscription>> = self.inner.subscriptions().clone();

        let event_type = event.event_type().to_string();
        let targets: Vec<&Arc<Subscription>> = snapshot
            .iter()
            .filter(|s| !s.cancel.is_cancelled() && s.pattern.matches(&event_type))
            .collect();

        if targets.is_empty() {
            trace!(event_type = %event_type, "Event emitted (no matching subscribers)");
            return 0;
        }

        let timeout = self.inner.config.put_timeout;
        let deliveries = targets.iter().map(|s| s.put(event.clone(), timeout));
        let delivered = join_all(deliveries).await.into_iter().filter(|ok| *ok).count();

        if delivered < targets.len() {
            debug!(
                event_type = %event_type,
                matched = targets.len(),
                delivered,
                "Event partially delivered"
            );
        } else {
            trace!(event_type = %event_type, delivered, "Event emitted");
        }

        delivered
    }

    /// Wait for the next event matching `pattern`.
    ///
    /// The temporary subscription is removed on return, on timeout, and
    /// when the returned future is dropped.
    pub async fn once(&self, pattern: &str, timeout: Option<Duration>) -> Option<Event> {
        let mut stream = self.subscribe_with_capacity(pattern, 1);

        let event = match timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .ok()
                .flatten(),
            None => stream.next().await,
        };

        self.unsubscribe(&stream);
        event
    }

    /// Number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions().len()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Single-consumer stream over one subscription's queue.
///
/// Dropping the stream unsubscribes it.
pub struct EventStream {
    id: u64,
    pattern: String,
    receiver: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    bus: Weak<BusInner>,
}

impl EventStream {
    /// Wait for the next event; `None` once the stream is cancelled.
    pub async fn next(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }

    /// Take an already-queued event without waiting
    pub fn try_next(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Stop accepting events and end iteration
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pattern this stream was subscribed with
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl futures::Stream<Item = Event> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|event| (event, stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
