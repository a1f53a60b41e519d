//! Live flow event fan-out
//!
//! Every subscriber owns a bounded queue. Publishing serializes the event
//! once and offers the payload to each queue with `try_send`, so a slow or
//! stalled viewer only ever loses its own events and never holds up the
//! writer. Delivery is at-most-once and FIFO per subscriber.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::{FlowEvent, FlowSummary};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 500;
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// First frame of every live stream: reconnect after one second.
pub const SSE_RETRY_FRAME: &str = "retry: 1000\n\n";
pub const SSE_KEEPALIVE_FRAME: &str = ": keepalive\n\n";

type Payload = Arc<str>;

/// What a subscriber sees next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Serialized event JSON
    Event(Payload),
    /// Nothing arrived within the idle window
    KeepAlive,
}

impl BusMessage {
    /// Render as one server-sent-events frame.
    pub fn to_sse_frame(&self) -> String {
        match self {
            BusMessage::Event(payload) => format!("data: {}\n\n", payload),
            BusMessage::KeepAlive => SSE_KEEPALIVE_FRAME.to_string(),
        }
    }
}

/// Counters for bus health.
#[derive(Debug, Default)]
struct BusMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped_full: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    /// Offers refused because a subscriber's queue was full
    pub dropped_full: u64,
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Payload>>>,
    next_id: AtomicU64,
    capacity: usize,
    keepalive: Duration,
    metrics: BusMetrics,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Payload>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            tracing::debug!("Event subscriber {} deregistered", id);
        }
    }
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY, DEFAULT_KEEPALIVE_INTERVAL)
    }
}

impl EventBus {
    pub fn new(capacity: usize, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                keepalive,
                metrics: BusMetrics::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn stats(&self) -> BusStats {
        let metrics = &self.inner.metrics;
        BusStats {
            subscribers: self.subscriber_count(),
            published: metrics.published.load(Ordering::Relaxed),
            delivered: metrics.delivered.load(Ordering::Relaxed),
            dropped_full: metrics.dropped_full.load(Ordering::Relaxed),
        }
    }

    /// Register a new subscriber. Only events published afterwards are seen.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut subscribers = self.inner.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        tracing::debug!("Event subscriber {} registered ({} active)", id, total);

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
            keepalive: self.inner.keepalive,
        }
    }

    /// Deregister a subscriber. Idempotent; dropping the handle does the same.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.remove(subscription.id);
    }

    /// Offer an event to every subscriber without waiting. Returns how many
    /// queues accepted it.
    pub fn publish(&self, event: &FlowEvent) -> usize {
        let payload: Payload = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!("Failed to serialize flow event: {}", e);
                return 0;
            }
        };
        self.publish_payload(payload)
    }

    pub fn publish_summary(&self, summary: FlowSummary) -> usize {
        self.publish(&FlowEvent::Flow(summary))
    }

    fn publish_payload(&self, payload: Payload) -> usize {
        let metrics = &self.inner.metrics;
        metrics.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut dropped = 0u64;
        let mut closed = Vec::new();
        {
            let subscribers = self.inner.lock();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(Arc::clone(&payload)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => dropped += 1,
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.inner.lock();
            for id in &closed {
                subscribers.remove(id);
            }
        }
        if dropped > 0 {
            tracing::trace!("Dropped event for {} full subscriber queues", dropped);
        }

        metrics.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        metrics.dropped_full.fetch_add(dropped, Ordering::Relaxed);
        delivered
    }
}

/// Receiving end of one subscriber. Deregisters itself on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Payload>,
    bus: Weak<BusInner>,
    keepalive: Duration,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or a keep-alive marker after the idle window. `None` once
    /// the bus itself is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
            Ok(Some(payload)) => Some(BusMessage::Event(payload)),
            Ok(None) => None,
            Err(_) => Some(BusMessage::KeepAlive),
        }
    }

    /// Already-queued event, if any.
    pub fn try_next(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
