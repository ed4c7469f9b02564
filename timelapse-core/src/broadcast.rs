//! Non-blocking fan-out of log lines and status snapshots to live viewers.
//!
//! Every subscriber owns a bounded queue. [`BroadcastHub::publish`] never
//! awaits: when a queue is full the event is dropped for that subscriber only,
//! and queues whose receiver is gone are pruned on the spot.
//!
//! ```text
//!    publish(event)
//!        │            (snapshot of registry, taken under read lock)
//!        ├──try_send──► [queue L1] ─► /stream/logs client
//!        ├──try_send──► [queue L2] ─► /stream/logs client
//!        └──try_send──► [queue S1] ─► /stream/status client
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::{logs::LogLine, status::RunStatus};

pub const DEFAULT_LOG_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_STATUS_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Log,
    Status,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Log(LogLine),
    Status(RunStatus),
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::Log(_) => EventKind::Log,
            HubEvent::Status(_) => EventKind::Status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Queue depth per subscriber kind.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub log_capacity: usize,
    pub status_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CHANNEL_CAPACITY,
            status_capacity: DEFAULT_STATUS_CHANNEL_CAPACITY,
        }
    }
}

impl HubConfig {
    fn capacity_for(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Log => self.log_capacity,
            EventKind::Status => self.status_capacity,
        }
        .max(1)
    }
}

struct SubscriberEntry {
    kind: EventKind,
    sender: mpsc::Sender<HubEvent>,
}

struct HubInner {
    subscribers: RwLock<HashMap<SubscriberId, SubscriberEntry>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    config: HubConfig,
}

impl HubInner {
    fn remove(&self, id: SubscriberId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }
}

/// Registry of live subscriber queues. Cheap to clone; clones share the
/// same registry.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("log_subscribers", &self.subscriber_count(EventKind::Log))
            .field(
                "status_subscribers",
                &self.subscriber_count(EventKind::Status),
            )
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let id = SubscriberId(
            self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1,
        );
        let (sender, receiver) =
            mpsc::channel(self.inner.config.capacity_for(kind));

        self.inner
            .subscribers
            .write()
            .insert(id, SubscriberEntry { kind, sender });
        debug!(subscriber = %id, ?kind, "subscriber registered");

        Subscription {
            id,
            kind,
            receiver,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deregisters `id`. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.inner.remove(id) {
            debug!(subscriber = %id, "subscriber removed");
        }
    }

    /// Delivers `event` to every subscriber of its kind and returns how many
    /// queues accepted it.
    pub fn publish(&self, event: HubEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<(SubscriberId, mpsc::Sender<HubEvent>)> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(id, entry)| (*id, entry.sender.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscriber = %id, ?kind, "dropped event: queue full");
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut guard = self.inner.subscribers.write();
            for id in closed {
                guard.remove(&id);
                debug!(subscriber = %id, "pruned closed subscriber");
            }
        }

        delivered
    }

    pub fn publish_log(&self, line: LogLine) -> usize {
        self.publish(HubEvent::Log(line))
    }

    pub fn publish_status(&self, status: RunStatus) -> usize {
        self.publish(HubEvent::Status(status))
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .values()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Removes every subscriber. Their queues drain and then report closed,
    /// which ends any stream built on them.
    pub fn close_all(&self) -> usize {
        let removed = {
            let mut guard = self.inner.subscribers.write();
            let removed = guard.len();
            guard.clear();
            removed
        };
        debug!(removed, "closed all subscribers");
        removed
    }

    /// Total events dropped on full queues since the hub was created.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of one subscriber. Dropping it deregisters the subscriber.
pub struct Subscription {
    id: SubscriberId,
    kind: EventKind,
    receiver: mpsc::Receiver<HubEvent>,
    hub: Weak<HubInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Waits for the next event. Returns `None` once the subscriber has been
    /// removed from the hub and its queue is drained.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade()
            && inner.remove(self.id)
        {
            debug!(subscriber = %self.id, "subscriber dropped");
        }
    }
}
