//! Fan-out of broker messages to live observer streams.
//!
//! Each observer owns a set of literal topics. Broker-level subscriptions are
//! reference counted across observers: the first observer interested in a
//! topic subscribes it at the broker, the last one to leave unsubscribes it.
//! Baseline topics of the bridge are never touched here.

use crate::broker::{BrokerError, BrokerHandle};
use crate::topic;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub type ObserverId = u64;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Observer {0} is not registered")]
    UnknownObserver(ObserverId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub topic: String,
    pub payload: Bytes,
}

struct Observer {
    topics: HashSet<String>,
    tx: mpsc::Sender<RelayMessage>,
}

pub struct EventRelay {
    broker: Arc<BrokerHandle>,
    buffer: usize,
    next_id: AtomicU64,
    observers: RwLock<HashMap<ObserverId, Observer>>,
    /// Topic -> number of observers claiming it. Held across broker calls.
    interest: Mutex<HashMap<String, usize>>,
}

/// Splits a comma-delimited topic list, dropping blank entries.
pub fn parse_topic_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl EventRelay {
    pub fn new(broker: Arc<BrokerHandle>, buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            broker,
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            observers: RwLock::new(HashMap::new()),
            interest: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a new observer interested in `topics`.
    pub async fn open<I>(self: &Arc<Self>, topics: I) -> ObserverSession
    where
        I: IntoIterator<Item = String>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.observers.write().await.insert(
            id,
            Observer {
                topics: HashSet::new(),
                tx,
            },
        );

        let session = ObserverSession {
            id,
            relay: self.clone(),
            rx,
            closed: false,
        };
        if let Err(e) = self.subscribe(id, topics).await {
            warn!(observer = id, "Observer vanished while subscribing: {}", e);
        }
        session
    }

    /// Adds topics to an observer. Topics it already holds are ignored.
    /// Returns how many topics were newly added.
    pub async fn subscribe<I>(&self, id: ObserverId, topics: I) -> Result<usize, RelayError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut interest = self.interest.lock().await;
        let mut added = 0;

        for topic in topics {
            if topic.is_empty() {
                continue;
            }
            let inserted = {
                let mut observers = self.observers.write().await;
                let observer = observers.get_mut(&id).ok_or(RelayError::UnknownObserver(id))?;
                observer.topics.insert(topic.clone())
            };
            if !inserted {
                continue;
            }
            added += 1;

            let count = interest.entry(topic.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.broker_subscribe(&topic).await;
            }
        }

        debug!(observer = id, added, "Observer subscriptions updated");
        Ok(added)
    }

    /// Removes an observer and releases topics nobody else wants. Returns
    /// `false` when the observer was already gone.
    pub async fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut interest = self.interest.lock().await;
        let Some(observer) = self.observers.write().await.remove(&id) else {
            return false;
        };

        // Counts settle before any broker call; a cancelled close leaves none behind.
        let mut released = Vec::new();
        for topic in observer.topics {
            if let Some(count) = interest.get_mut(&topic) {
                *count -= 1;
                if *count == 0 {
                    interest.remove(&topic);
                    released.push(topic);
                }
            }
        }

        for topic in &released {
            self.broker_unsubscribe(topic).await;
        }

        info!(observer = id, "Observer disconnected");
        true
    }

    /// Delivers a message to every observer holding exactly `topic`.
    /// Returns the number of observers that accepted it.
    pub async fn dispatch(&self, topic: &str, payload: &Bytes) -> usize {
        let observers = self.observers.read().await;
        let mut delivered = 0;

        for (id, observer) in observers.iter() {
            if !observer.topics.contains(topic) {
                continue;
            }
            let message = RelayMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match observer.tx.try_send(message) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(observer = id, topic, "Observer is lagging, message dropped")
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(observer = id, topic, "Observer stream closed, message dropped")
                }
            }
        }

        delivered
    }

    /// Re-issues broker subscriptions for every claimed topic. Called after
    /// the broker connection is re-established.
    pub async fn resubscribe_all(&self) {
        let interest = self.interest.lock().await;
        for topic in interest.keys() {
            self.broker_subscribe(topic).await;
        }
    }

    pub async fn topic_interest(&self, topic: &str) -> usize {
        self.interest.lock().await.get(topic).copied().unwrap_or(0)
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    async fn broker_subscribe(&self, topic: &str) {
        if topic::is_baseline(topic) {
            return;
        }
        match self.broker.subscribe(topic).await {
            Ok(()) => info!(topic, "Subscribed to topic"),
            Err(BrokerError::NotConnected) => {
                debug!(topic, "Broker offline, subscription deferred until reconnect")
            }
            Err(e) => warn!(topic, "Failed to subscribe to topic: {}", e),
        }
    }

    async fn broker_unsubscribe(&self, topic: &str) {
        if topic::is_baseline(topic) {
            return;
        }
        match self.broker.unsubscribe(topic).await {
            Ok(()) => info!(topic, "Unsubscribed from topic"),
            Err(BrokerError::NotConnected) => debug!(topic, "Broker offline, nothing to unsubscribe"),
            Err(e) => warn!(topic, "Failed to unsubscribe from topic: {}", e),
        }
    }
}

/// A live observer. Dropping it releases the observer's subscriptions.
pub struct ObserverSession {
    id: ObserverId,
    relay: Arc<EventRelay>,
    rx: mpsc::Receiver<RelayMessage>,
    closed: bool,
}

impl ObserverSession {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.rx.recv().await
    }

    pub async fn close(mut self) {
        self.closed = true;
        self.relay.unsubscribe(self.id).await;
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let relay = self.relay.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    relay.unsubscribe(id).await;
                });
            }
            Err(_) => warn!(observer = id, "No runtime to release observer subscriptions"),
        }
    }
}
