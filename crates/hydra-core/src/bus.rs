use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::event::{Event, EventKind};

/// Retention ring capacity; reconnecting clients further behind than this
/// receive a gap sentinel and must reconcile via REST.
pub const MAX_EVENTS: usize = 2_000;

/// Per-subscriber channel capacity. A subscriber that falls this far behind
/// is dropped rather than back-pressuring publishers.
pub const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<Event>>,
}

struct BusInner {
    ring: VecDeque<Arc<Event>>,
    next_id: u64,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

/// The result of `subscribe`: retained events newer than the requested id,
/// then a live receiver that continues where the replay left off.
pub struct Subscription {
    pub replay: Vec<Arc<Event>>,
    /// True when the requested `since` id precedes the ring floor, meaning
    /// events were lost between `since` and the start of `replay`.
    pub gap: bool,
    pub rx: mpsc::Receiver<Arc<Event>>,
}

/// Single append-only event log with monotonic ids and subscriber fan-out.
///
/// Publishers never block: each subscriber owns a bounded buffer, and a full
/// buffer drops that subscriber (the client reconnects and backfills).
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                ring: VecDeque::with_capacity(MAX_EVENTS),
                next_id: 0,
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
        })
    }

    /// Append an event to the log and fan it out. Returns the assigned id.
    pub async fn publish(&self, kind: EventKind) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let event = Arc::new(Event {
            id: inner.next_id,
            timestamp: Utc::now(),
            kind,
        });

        inner.ring.push_back(Arc::clone(&event));
        if inner.ring.len() > MAX_EVENTS {
            inner.ring.pop_front();
        }

        inner.subscribers.retain(|sub| match sub.tx.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = sub.id, "event subscriber overflowed, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "event subscriber closed");
                false
            }
        });

        event.id
    }

    /// Subscribe with replay of retained events newer than `since` (all
    /// retained events when `since` is None), then live delivery.
    pub async fn subscribe(&self, since: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().await;

        let since = since.unwrap_or(0);
        let floor = inner.ring.front().map(|e| e.id).unwrap_or(inner.next_id + 1);
        // A gap exists when events between `since` and the ring floor are gone.
        let gap = since + 1 < floor && inner.next_id > since;

        let replay: Vec<Arc<Event>> = inner
            .ring
            .iter()
            .filter(|e| e.id > since)
            .cloned()
            .collect();

        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        inner.subscribers.push(Subscriber { id, tx });

        Subscription { replay, gap, rx }
    }

    /// Pull-mode backfill: retained events with id > `since`, in id order.
    pub async fn snapshot_since(&self, since: u64) -> Vec<Arc<Event>> {
        let inner = self.inner.lock().await;
        inner.ring.iter().filter(|e| e.id > since).cloned().collect()
    }

    /// Retained events with a timestamp strictly after `since`.
    pub async fn snapshot_after(&self, since: chrono::DateTime<Utc>) -> Vec<Arc<Event>> {
        let inner = self.inner.lock().await;
        inner.ring.iter().filter(|e| e.timestamp > since).cloned().collect()
    }

    /// Id of the most recently published event (0 before the first publish).
    pub async fn last_id(&self) -> u64 {
        self.inner.lock().await.next_id
    }

    /// Number of live subscribers (used by tests and the health endpoint).
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}
