use crate::broker::{BrokerError, BrokerHandle, ConnectionState};
use crate::models::{CommandMessage, HighEnergyEvent, RegistrationMessage};
use crate::registry::{Announcement, DataOutcome, DeviceRegistry, RegistryError};
use crate::relay::EventRelay;
use crate::topic::{self, InboundRoute};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{ConnectionError, Event, EventLoop, Packet};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, error, info, trace, warn};

/// Light bulb switched off whenever any tracker reports high energy usage.
const HIGH_ENERGY_TARGET: &str = "light_bulb_1";

/// Ordered queues inbound registry work is spread over, keyed by device.
const INBOUND_LANES: usize = 8;

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Publish(#[from] BrokerError),
}

/// Where broker events come from. rumqttc's `EventLoop` in production.
#[async_trait]
pub trait EventSource: Send {
    async fn poll(&mut self) -> Result<Event, ConnectionError>;
}

#[async_trait]
impl EventSource for EventLoop {
    async fn poll(&mut self) -> Result<Event, ConnectionError> {
        EventLoop::poll(self).await
    }
}

struct Inbound {
    topic: String,
    payload: Bytes,
}

/// Applies inbound messages to the registry and reacts to events.
struct InboundRouter {
    broker: Arc<BrokerHandle>,
    registry: Arc<DeviceRegistry>,
}

/// Owns the broker event loop: tracks connection state, restores
/// subscriptions on every connect and routes inbound messages.
///
/// Messages touching the same device are applied in arrival order; distinct
/// devices are spread over independent lanes.
pub struct MqttService {
    broker: Arc<BrokerHandle>,
    relay: Arc<EventRelay>,
    router: Arc<InboundRouter>,
    lanes: Vec<mpsc::UnboundedSender<Inbound>>,
    reconnect_interval: Duration,
}

impl MqttService {
    /// Spawns the inbound lane workers, so it must run inside a Tokio runtime.
    /// The workers stop once the service is dropped.
    pub fn new(
        broker: Arc<BrokerHandle>,
        registry: Arc<DeviceRegistry>,
        relay: Arc<EventRelay>,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        let router = Arc::new(InboundRouter {
            broker: broker.clone(),
            registry,
        });
        let lanes = (0..INBOUND_LANES)
            .map(|lane| spawn_lane(lane, router.clone()))
            .collect();

        Arc::new(Self {
            broker,
            relay,
            router,
            lanes,
            reconnect_interval,
        })
    }

    /// Drives the event loop forever. rumqttc reconnects on the next poll
    /// after an error, so the loop only has to wait out the backoff.
    pub async fn run<E: EventSource>(self: Arc<Self>, mut events: E) {
        info!("Starting MQTT service...");
        let mut backoff = FixedInterval::new(self.reconnect_interval);
        self.broker.set_state(ConnectionState::Connecting);

        loop {
            match events.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker.");
                    self.on_connected();
                    // Subscribing goes through the client queue that this
                    // loop drains, so it must not be awaited here.
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.restore_subscriptions().await;
                    });
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.on_message(publish.topic, publish.payload).await;
                }
                Ok(Event::Outgoing(outgoing)) => {
                    trace!("Outgoing event: {:?}", outgoing);
                }
                Ok(event) => {
                    debug!("Unhandled event: {:?}", event);
                }
                Err(e) => {
                    error!("Error in MQTT event loop: {:?}", e);
                    self.on_connection_lost();
                    let retry_interval = backoff.next().unwrap_or(self.reconnect_interval);
                    warn!("Lost connection to MQTT broker. Retrying in {:?}...", retry_interval);
                    sleep(retry_interval).await;
                }
            }
        }
    }

    pub fn on_connected(&self) {
        self.broker.set_state(ConnectionState::Connected);
    }

    pub fn on_connection_lost(&self) {
        self.broker.set_state(ConnectionState::Connecting);
    }

    /// Re-issues the baseline and observer subscriptions. The broker forgets
    /// them when a clean session drops. Stops early if the connection is
    /// lost again meanwhile; the next connect starts over.
    pub async fn restore_subscriptions(&self) {
        for baseline in topic::BASELINE_TOPICS {
            match self.broker.subscribe(baseline).await {
                Ok(()) => info!("Subscribed to {}", baseline),
                Err(BrokerError::NotConnected) => {
                    debug!("Connection lost before subscriptions were restored");
                    return;
                }
                Err(e) => error!("Failed to subscribe to {}: {}", baseline, e),
            }
        }
        if self.broker.is_connected() {
            self.relay.resubscribe_all().await;
        }
    }

    /// Fans the message out to observers, then queues the registry work on
    /// the lane owning its device.
    pub async fn on_message(&self, topic: String, payload: Bytes) {
        debug!(topic = %topic, bytes = payload.len(), "Received message");
        self.relay.dispatch(&topic, &payload).await;

        let lane = lane_for(&ordering_key(&topic, &payload), self.lanes.len());
        if let Err(mpsc::error::SendError(dropped)) = self.lanes[lane].send(Inbound { topic, payload }) {
            error!(topic = %dropped.topic, lane, "Inbound lane is gone, message dropped");
        }
    }

    /// Applies one inbound message. Unroutable topics are ignored.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> Result<(), InboundError> {
        self.router.route(topic, payload).await
    }
}

fn spawn_lane(lane: usize, router: Arc<InboundRouter>) -> mpsc::UnboundedSender<Inbound> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
    tokio::spawn(async move {
        while let Some(Inbound { topic, payload }) = rx.recv().await {
            if let Err(e) = router.route(&topic, &payload).await {
                warn!(topic = %topic, "Dropping inbound message: {}", e);
            }
        }
        debug!(lane, "Inbound lane closed");
    });
    tx
}

/// The device a message is about. Registrations name it in the payload;
/// anything without a device falls back to its topic.
fn ordering_key<'a>(topic: &'a str, payload: &[u8]) -> Cow<'a, str> {
    match topic::classify(topic) {
        InboundRoute::DeviceData(device_id) => Cow::Borrowed(device_id),
        InboundRoute::Registration => serde_json::from_slice::<RegistrationMessage>(payload)
            .map(|message| Cow::Owned(message.device_id))
            .unwrap_or(Cow::Borrowed(topic)),
        InboundRoute::HighEnergyUsage | InboundRoute::Unrouted => Cow::Borrowed(topic),
    }
}

fn lane_for(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

impl InboundRouter {
    async fn route(&self, topic: &str, payload: &[u8]) -> Result<(), InboundError> {
        match topic::classify(topic) {
            InboundRoute::Registration => {
                let message: RegistrationMessage = serde_json::from_slice(payload)?;
                let outcome = self
                    .registry
                    .announce(&message.device_id, &message.device_type)
                    .await?;
                match outcome {
                    Announcement::Created => info!(device_id = %message.device_id, "Device registered and saved."),
                    Announcement::Updated => info!(device_id = %message.device_id, "Device already registered and updated."),
                }
            }
            InboundRoute::HighEnergyUsage => {
                let event: HighEnergyEvent = serde_json::from_slice(payload)?;
                info!(
                    device_id = %event.device_id,
                    event_type = ?event.event_type,
                    value = %event.value,
                    "High energy usage event received"
                );
                let command = serde_json::to_vec(&CommandMessage {
                    command: "turn_off".to_string(),
                })?;
                self.broker
                    .publish(&topic::commands_topic(HIGH_ENERGY_TARGET), command, false)
                    .await?;
                info!(target_device = HIGH_ENERGY_TARGET, "Command sent to light bulb to turn off");
            }
            InboundRoute::DeviceData(device_id) => {
                let data: Value = serde_json::from_slice(payload)?;
                if let DataOutcome::Updated(status) = self.registry.apply_data(device_id, data).await? {
                    debug!(device_id, %status, "Device data applied");
                }
            }
            InboundRoute::Unrouted => {
                trace!(topic, "No handler for topic");
            }
        }
        Ok(())
    }
}
