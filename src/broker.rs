use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("MQTT broker is not connected")]
    NotConnected,
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT transport error: {0}")]
    Transport(String),
}

/// The raw operations the bridge needs from an MQTT client.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError>;
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
}

/// `BrokerLink` over a rumqttc client. Calls resolve once the request has
/// been queued for the event loop.
pub struct RumqttLink {
    client: AsyncClient,
}

impl RumqttLink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BrokerLink for RumqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }
}

/// Process-wide handle to the single broker connection.
///
/// Every operation fails fast with [`BrokerError::NotConnected`] unless the
/// connection is up; nothing here retries.
pub struct BrokerHandle {
    link: Arc<dyn BrokerLink>,
    state: watch::Sender<ConnectionState>,
}

impl BrokerHandle {
    pub fn new(link: Arc<dyn BrokerLink>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self { link, state })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "MQTT connection state changed");
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.link.publish(topic, payload, retain).await?;
        debug!(topic, retain, "Message published");
        Ok(())
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.link.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.link.unsubscribe(topic).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn operations_fail_fast_while_disconnected() {
        let link = Arc::new(RecordingLink::default());
        let handle = BrokerHandle::new(link.clone());
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        assert!(matches!(
            handle.publish("devices/d1/commands", b"{}".to_vec(), false).await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(handle.subscribe("a/b").await, Err(BrokerError::NotConnected)));

        handle.set_state(ConnectionState::Connecting);
        assert!(matches!(handle.unsubscribe("a/b").await, Err(BrokerError::NotConnected)));
        assert!(link.calls().is_empty());
    }

    #[tokio::test]
    async fn operations_reach_the_link_when_connected() {
        let (link, handle) = connected_handle();
        handle.publish("t/1", b"1".to_vec(), true).await.unwrap();
        handle.subscribe("t/2").await.unwrap();
        handle.unsubscribe("t/2").await.unwrap();

        assert_eq!(
            link.calls(),
            vec![
                LinkCall::Publish { topic: "t/1".into(), payload: b"1".to_vec(), retain: true },
                LinkCall::Subscribe("t/2".into()),
                LinkCall::Unsubscribe("t/2".into()),
            ]
        );
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let (_link, handle) = connected_handle();
        let mut rx = handle.watch_state();
        handle.set_state(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }
}
