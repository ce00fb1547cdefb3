//! Session Event Bus
//!
//! Fans per-chip session events out to any number of subscribers. Each
//! subscriber owns a bounded queue; a subscriber that cannot keep up is
//! evicted rather than allowed to stall the publisher or silently miss events.
//!
//! A chip's topic remembers the last status-bearing event so a new subscriber
//! learns the current state immediately. Subscribe and publish take the same
//! per-chip entry lock, so the replayed snapshot is never duplicated or
//! skipped by a concurrent publish.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};

use crate::error::ErrorKind;
use crate::protocol::InboundMessage;
use crate::session::{ChipId, Session, SessionStatus};

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

const FIREHOSE_CAPACITY: usize = 1024;

/// A single event on a chip's stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    StatusChanged {
        status: SessionStatus,
        reconnect_attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<ErrorKind>,
        at: DateTime<Utc>,
    },
    QrUpdated {
        status: SessionStatus,
        qr_payload: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    MessageReceived(InboundMessage),
    Error {
        status: SessionStatus,
        error: ErrorKind,
        message: String,
        at: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// State of a chip nobody has connected yet.
    pub fn idle() -> Self {
        Self::StatusChanged {
            status: SessionStatus::Disconnected,
            reconnect_attempts: 0,
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn status_changed(session: &Session, reason: Option<ErrorKind>) -> Self {
        Self::StatusChanged {
            status: session.status,
            reconnect_attempts: session.reconnect_attempts,
            reason,
            at: session.last_transition_at,
        }
    }

    pub fn qr_updated(session: &Session) -> Self {
        Self::QrUpdated {
            status: session.status,
            qr_payload: session.qr_payload.clone().unwrap_or_default(),
            expires_at: session.qr_expires_at,
            at: session.last_transition_at,
        }
    }

    pub fn error(session: &Session, error: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            status: session.status,
            error,
            message: message.into(),
            at: session.last_transition_at,
        }
    }

    /// Status this event moves the chip to; `None` for chat messages.
    pub fn status(&self) -> Option<SessionStatus> {
        match self {
            Self::StatusChanged { status, .. }
            | Self::QrUpdated { status, .. }
            | Self::Error { status, .. } => Some(*status),
            Self::MessageReceived(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::QrUpdated { .. } => "qr_updated",
            Self::MessageReceived(_) => "message_received",
            Self::Error { .. } => "error",
        }
    }
}

/// An event addressed to one chip; the form written to the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipEvent {
    pub chip_id: ChipId,
    #[serde(flatten)]
    pub event: SessionEvent,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ChipEvent>,
}

struct Topic {
    last: SessionEvent,
    subscribers: Vec<Subscriber>,
}

impl Topic {
    fn new() -> Self {
        Self {
            last: SessionEvent::idle(),
            subscribers: Vec::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.last.status() == Some(SessionStatus::Disconnected)
    }
}

struct BusInner {
    topics: DashMap<ChipId, Topic>,
    firehose: broadcast::Sender<ChipEvent>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl BusInner {
    fn unsubscribe(&self, chip_id: &ChipId, id: u64) {
        if let Some(mut topic) = self.topics.get_mut(chip_id) {
            topic.subscribers.retain(|s| s.id != id);
        }
        self.topics.remove_if(chip_id, |_, topic| topic.is_idle());
    }
}

/// Per-chip fan-out of session events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE)
    }
}

impl EventBus {
    /// Create a bus whose subscribers buffer up to `queue_capacity` events.
    pub fn new(queue_capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(FIREHOSE_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                firehose,
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Subscribe to a chip. The first item is always the chip's current state.
    pub fn subscribe(&self, chip_id: &ChipId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut topic = self.inner.topics.entry(chip_id.clone()).or_insert_with(Topic::new);
            // Fresh queue with capacity >= 1, cannot be full
            let _ = tx.try_send(ChipEvent {
                chip_id: chip_id.clone(),
                event: topic.last.clone(),
            });
            topic.subscribers.push(Subscriber { id, tx });
        }

        tracing::debug!(chip_id = %chip_id, subscriber = id, "subscribed");

        Subscription {
            chip_id: chip_id.clone(),
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Every event for every chip, for cross-chip consumers.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ChipEvent> {
        self.inner.firehose.subscribe()
    }

    /// Deliver an event to all live subscribers of the chip. Never blocks.
    pub fn publish(&self, chip_id: &ChipId, event: SessionEvent) {
        let chip_event = ChipEvent {
            chip_id: chip_id.clone(),
            event,
        };

        {
            let mut topic = self.inner.topics.entry(chip_id.clone()).or_insert_with(Topic::new);
            if chip_event.event.status().is_some() {
                topic.last = chip_event.event.clone();
            }

            topic.subscribers.retain(|subscriber| {
                match subscriber.tx.try_send(chip_event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            chip_id = %chip_id,
                            subscriber = subscriber.id,
                            "subscriber queue full, evicting"
                        );
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });

            let _ = self.inner.firehose.send(chip_event.clone());
        }

        self.inner.topics.remove_if(chip_id, |_, topic| topic.is_idle());
    }

    /// Number of live subscriptions across all chips.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .topics
            .iter()
            .map(|topic| topic.subscribers.len())
            .sum()
    }

    pub fn subscribers_for(&self, chip_id: &ChipId) -> usize {
        self.inner
            .topics
            .get(chip_id)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }

    /// Chips with retained state or subscribers.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }
}

/// A live subscription to one chip's events. Dropping it unsubscribes.
pub struct Subscription {
    chip_id: ChipId,
    id: u64,
    rx: mpsc::Receiver<ChipEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn chip_id(&self) -> &ChipId {
        &self.chip_id
    }

    /// Next event, or `None` once the subscription has been evicted.
    pub async fn recv(&mut self) -> Option<ChipEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ChipEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.chip_id, self.id);
        }
    }
}
