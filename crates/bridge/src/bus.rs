use crate::{BridgeError, QosProfile, qos::Durability};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::{
    any::{Any, type_name},
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) trait TopicEntry: Send + Sync {
    fn publisher_count(&self) -> usize;
    fn subscription_count(&self) -> usize;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub(crate) struct ServiceEntry {
    pub(crate) id: u64,
    pub(crate) endpoint: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub(crate) struct Registry {
    topics: Mutex<HashMap<String, Arc<dyn TopicEntry>>>,
    pub(crate) services: Mutex<HashMap<String, ServiceEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Handle to the shared transport. Cloning is cheap; all clones see the same
/// topics and services.
#[derive(Clone, Default)]
pub struct Bus {
    pub(crate) registry: Arc<Registry>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher<T>(&self, topic: &str, qos: QosProfile) -> Result<Publisher<T>, BridgeError>
    where
        T: Clone + Send + 'static,
    {
        let topic = self.topic::<T>(topic)?;
        topic.publishers.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(topic = %topic.name, ?qos, "Publisher created");
        Ok(Publisher { topic, qos })
    }

    pub fn subscribe<T>(&self, topic: &str, qos: QosProfile) -> Result<Subscription<T>, BridgeError>
    where
        T: Clone + Send + 'static,
    {
        let topic = self.topic::<T>(topic)?;
        let (tx, rx) = match qos.depth() {
            Some(depth) => crossbeam_channel::bounded(depth),
            None => crossbeam_channel::unbounded(),
        };
        let slot = Slot {
            id: self.registry.next_id(),
            qos,
            tx,
            rx: rx.clone(),
        };

        if qos.durability == Durability::TransientLocal
            && let Some((offered, msg)) = lock(&topic.latched).clone()
            && offered.is_compatible_with(&qos)
        {
            slot.offer(msg);
        }

        let id = slot.id;
        lock(&topic.subscribers).push(slot);
        tracing::debug!(topic = %topic.name, ?qos, "Subscription created");
        Ok(Subscription { topic, id, rx })
    }

    pub fn publisher_count(&self, topic: &str) -> usize {
        lock(&self.registry.topics)
            .get(topic)
            .map_or(0, |t| t.publisher_count())
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        lock(&self.registry.topics)
            .get(topic)
            .map_or(0, |t| t.subscription_count())
    }

    pub fn has_service(&self, name: &str) -> bool {
        lock(&self.registry.services).contains_key(name)
    }

    fn topic<T>(&self, name: &str) -> Result<Arc<Topic<T>>, BridgeError>
    where
        T: Clone + Send + 'static,
    {
        let mut topics = lock(&self.registry.topics);

        if let Some(existing) = topics.get(name) {
            return Arc::clone(existing)
                .into_any()
                .downcast::<Topic<T>>()
                .map_err(|_| BridgeError::TopicTypeMismatch {
                    topic: name.to_string(),
                    requested: type_name::<T>(),
                });
        }

        let topic = Arc::new(Topic::<T>::new(name));
        topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }
}

struct Slot<T> {
    id: u64,
    qos: QosProfile,
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Slot<T> {
    /// Enqueue, evicting the oldest message while the queue is full.
    fn offer(&self, mut msg: T) -> bool {
        loop {
            match self.tx.try_send(msg) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    let _ = self.rx.try_recv();
                    msg = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

struct Topic<T> {
    name: String,
    subscribers: Mutex<Vec<Slot<T>>>,
    latched: Mutex<Option<(QosProfile, T)>>,
    publishers: AtomicUsize,
}

impl<T> Topic<T> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: Mutex::new(Vec::new()),
            latched: Mutex::new(None),
            publishers: AtomicUsize::new(0),
        }
    }
}

impl<T: Send + 'static> TopicEntry for Topic<T> {
    fn publisher_count(&self) -> usize {
        self.publishers.load(Ordering::Acquire)
    }

    fn subscription_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct Publisher<T> {
    topic: Arc<Topic<T>>,
    qos: QosProfile,
}

impl<T: Clone + Send + 'static> Publisher<T> {
    pub fn topic(&self) -> &str {
        &self.topic.name
    }

    pub fn qos(&self) -> QosProfile {
        self.qos
    }

    /// Deliver `msg` to every QoS-compatible subscription. Returns the number
    /// of subscriptions that received it.
    pub fn publish(&self, msg: T) -> usize {
        if self.qos.durability == Durability::TransientLocal {
            *lock(&self.topic.latched) = Some((self.qos, msg.clone()));
        }

        let subscribers = lock(&self.topic.subscribers);
        subscribers
            .iter()
            .filter(|slot| self.qos.is_compatible_with(&slot.qos))
            .filter(|slot| slot.offer(msg.clone()))
            .count()
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.topic.publishers.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(topic = %self.topic.name, "Publisher destroyed");
    }
}

pub struct Subscription<T> {
    topic: Arc<Topic<T>>,
    id: u64,
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn topic(&self) -> &str {
        &self.topic.name
    }

    /// Underlying queue, for use with `crossbeam_channel::Select`.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        lock(&self.topic.subscribers).retain(|slot| slot.id != self.id);
        tracing::debug!(topic = %self.topic.name, "Subscription destroyed");
    }
}
