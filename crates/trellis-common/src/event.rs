//! Registry event pub/sub
//!
//! Subscribers register per topic and receive events over a bounded channel.
//! Publishing never blocks: a full subscriber misses the event, a closed one is
//! pruned. Subscriptions end with an explicit [`Subscription::unsubscribe`].

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::ServiceRecord;

/// Default per-subscriber channel capacity
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Service record changes within a network
    Records { network: String },
    /// Membership changes of one pool
    Pool { network: String, pool: String },
}

impl Topic {
    pub fn records(network: impl Into<String>) -> Self {
        Topic::Records {
            network: network.into(),
        }
    }

    pub fn pool(network: impl Into<String>, pool: impl Into<String>) -> Self {
        Topic::Pool {
            network: network.into(),
            pool: pool.into(),
        }
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Records { network } => write!(f, "records/{}", network),
            Topic::Pool { network, pool } => write!(f, "pools/{}/{}", network, pool),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordEventKind {
    Add,
    Down,
    Del,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub kind: RecordEventKind,
    pub network: String,
    pub name: String,
    /// Record state after the change; absent for deletions
    pub record: Option<ServiceRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolEventKind {
    MemberAdd,
    MemberDel,
    PoolDel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub network: String,
    pub pool: String,
    pub member: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RegistryEvent {
    Record(RecordEvent),
    Pool(PoolEvent),
}

impl RegistryEvent {
    pub fn topic(&self) -> Topic {
        match self {
            RegistryEvent::Record(e) => Topic::records(&e.network),
            RegistryEvent::Pool(e) => Topic::pool(&e.network, &e.pool),
        }
    }
}

type SubscriberMap = HashMap<Topic, Vec<(u64, mpsc::Sender<RegistryEvent>)>>;

/// Topic-keyed publish/subscribe registry
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, tx));
        debug!(topic = %topic, id, "Subscriber registered");
        Subscription {
            id,
            topic,
            rx,
            bus: self.clone(),
        }
    }

    /// Deliver an event to every subscriber of its topic, returning the
    /// number of subscribers that received it.
    pub fn publish(&self, event: RegistryEvent) -> usize {
        let topic = event.topic();
        let mut delivered = 0;
        let mut closed = Vec::new();

        if let Some(subs) = self.subscribers.read().get(&topic) {
            for (id, tx) in subs {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic = %topic, id, "Subscriber channel full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subs = self.subscribers.write();
            if let Some(list) = subs.get_mut(&topic) {
                list.retain(|(id, _)| !closed.contains(id));
                if list.is_empty() {
                    subs.remove(&topic);
                }
            }
        }

        delivered
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers.read().get(topic).map_or(0, Vec::len)
    }

    fn remove(&self, topic: &Topic, id: u64) {
        let mut subs = self.subscribers.write();
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subs.remove(topic);
            }
        }
    }
}

/// Receiving end of a topic subscription
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::Receiver<RegistryEvent>,
    bus: EventBus,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait for the next event; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<RegistryEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RegistryEvent> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.rx.close();
        self.bus.remove(&self.topic, self.id);
        debug!(topic = %self.topic, id = self.id, "Subscriber removed");
    }
}
