//! In-process publish/subscribe bus for charging commands
//!
//! Topics come in two namespaces, one per car and one per charger. The bus owns
//! the topic → callback table; a subscriber only keeps a [`Subscription`] guard
//! that removes its callback when dropped, so an agent never ends up owned by
//! the bus it listens to.
//!
//! Delivery is fire-and-forget: publishing to a topic without subscribers
//! silently drops the message, and there is no acknowledgement. Callbacks run on
//! the publisher's task in publish order, which keeps a single topic ordered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{CarCommand, CarId, ChargerCommand, ChargerId, ErrorKind};

/// Default topic prefix
pub const DEFAULT_PREFIX: &str = "ttm4115/g11";

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Prefix prepended to every topic path
    pub prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl BusConfig {
    /// Set the topic prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Address of a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Car(CarId),
    Charger(ChargerId),
}

impl Topic {
    /// Full topic path under the given prefix
    pub fn path(&self, prefix: &str) -> String {
        match self {
            Topic::Car(id) => format!("{}/cars/{}", prefix, id),
            Topic::Charger(id) => format!("{}/chargers/{}", prefix, id),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Car(id) => write!(f, "cars/{}", id),
            Topic::Charger(id) => write!(f, "chargers/{}", id),
        }
    }
}

/// A message handed to a subscriber callback
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Full topic path the message was published on
    pub topic: String,
    /// Raw JSON payload
    pub payload: Vec<u8>,
}

/// Errors raised when publishing
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Message bus unreachable")]
    Unreachable,

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::Unreachable => ErrorKind::Connectivity,
            BusError::Encode(_) => ErrorKind::Internal,
        }
    }
}

type Callback = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<(u64, Callback)>>,
}

struct Inner {
    config: BusConfig,
    registry: RwLock<Registry>,
    partitioned: AtomicBool,
}

/// Handle to the shared bus; cheap to clone
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("prefix", &self.inner.config.prefix)
            .field("partitioned", &self.is_partitioned())
            .finish()
    }
}

impl MessageBus {
    /// Create a new bus
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(Registry::default()),
                partitioned: AtomicBool::new(false),
            }),
        }
    }

    /// Full path of a topic on this bus
    pub fn topic_path(&self, topic: &Topic) -> String {
        topic.path(&self.inner.config.prefix)
    }

    /// Register a callback for a topic. The callback stays registered until
    /// the returned guard is dropped.
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.write();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .topics
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        drop(registry);

        debug!("Bus: Subscribed #{} to {}", id, self.topic_path(&topic));

        Subscription {
            id,
            topic,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .registry
            .read()
            .topics
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Publish raw bytes. Returns how many subscribers received the message.
    pub fn publish_raw(&self, topic: &Topic, payload: Vec<u8>) -> Result<usize, BusError> {
        if self.is_partitioned() {
            warn!("Bus: Dropping publish to {}, bus is partitioned", topic);
            return Err(BusError::Unreachable);
        }

        // Snapshot callbacks so none run under the registry lock
        let callbacks: Vec<Callback> = self
            .inner
            .registry
            .read()
            .topics
            .get(topic)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        let path = self.topic_path(topic);
        if callbacks.is_empty() {
            debug!("Bus: No subscribers on {}, message dropped", path);
            return Ok(0);
        }

        debug!(
            "Bus: Publishing to {} ({} subscribers): {}",
            path,
            callbacks.len(),
            String::from_utf8_lossy(&payload)
        );

        for callback in &callbacks {
            callback(Delivery {
                topic: path.clone(),
                payload: payload.clone(),
            });
        }

        Ok(callbacks.len())
    }

    /// Serialize and publish any command
    pub fn publish<T: Serialize>(&self, topic: &Topic, command: &T) -> Result<usize, BusError> {
        let payload = serde_json::to_vec(command)?;
        self.publish_raw(topic, payload)
    }

    /// Publish a command to a charger topic
    pub fn publish_to_charger(
        &self,
        charger_id: ChargerId,
        command: &ChargerCommand,
    ) -> Result<usize, BusError> {
        self.publish(&Topic::Charger(charger_id), command)
    }

    /// Publish a command to a car topic
    pub fn publish_to_car(&self, car_id: &CarId, command: &CarCommand) -> Result<usize, BusError> {
        self.publish(&Topic::Car(car_id.clone()), command)
    }

    /// Make every publish fail until [`MessageBus::heal`] is called
    pub fn partition(&self) {
        info!("Bus: Partitioned");
        self.inner.partitioned.store(true, Ordering::SeqCst);
    }

    /// Undo [`MessageBus::partition`]
    pub fn heal(&self) {
        info!("Bus: Healed");
        self.inner.partitioned.store(false, Ordering::SeqCst);
    }

    pub fn is_partitioned(&self) -> bool {
        self.inner.partitioned.load(Ordering::SeqCst)
    }
}

/// Registration guard returned by [`MessageBus::subscribe`]
pub struct Subscription {
    id: u64,
    topic: Topic,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };

        let mut registry = inner.registry.write();
        if let Some(subs) = registry.topics.get_mut(&self.topic) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                registry.topics.remove(&self.topic);
            }
        }
        debug!("Bus: Unsubscribed #{} from {}", self.id, self.topic);
    }
}
