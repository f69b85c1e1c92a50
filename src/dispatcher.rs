use crate::broker::{BrokerError, BrokerHandle};
use crate::models::{CommandMessage, DeviceStatus, DeviceType, RegistrationMessage};
use crate::registry::{DeviceRegistry, RegistryError, StatusOutcome};
use crate::topic::{self, TopicError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command is required")]
    EmptyCommand,
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Failed to look up device {device_id}: {source}")]
    Lookup {
        device_id: String,
        #[source]
        source: RegistryError,
    },
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    /// Nothing reached the device and the registry is untouched.
    #[error("Failed to send command to {device_id}: {source}")]
    PublishFailed {
        device_id: String,
        #[source]
        source: BrokerError,
    },
    /// The command was delivered; only the bookkeeping failed.
    #[error("Command delivered to {device_id} but status update failed: {source}")]
    StatusUpdateFailed {
        device_id: String,
        #[source]
        source: RegistryError,
    },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("Device {0} not registered.")]
    DeviceNotRegistered(String),
    #[error("Failed to look up device {device_id}: {source}")]
    Lookup {
        device_id: String,
        #[source]
        source: RegistryError,
    },
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to publish event: {0}")]
    PublishFailed(#[from] BrokerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub command: String,
    /// Status derived from the command, `None` if it left status alone.
    pub status: Option<DeviceStatus>,
}

pub struct CommandDispatcher {
    broker: Arc<BrokerHandle>,
    registry: Arc<DeviceRegistry>,
}

impl CommandDispatcher {
    pub fn new(broker: Arc<BrokerHandle>, registry: Arc<DeviceRegistry>) -> Arc<Self> {
        Arc::new(Self { broker, registry })
    }

    pub async fn send_command(&self, device_id: &str, command: &str) -> Result<CommandReceipt, CommandError> {
        if command.is_empty() {
            return Err(CommandError::EmptyCommand);
        }

        match self.registry.exists(device_id).await {
            Ok(true) => {}
            Ok(false) => return Err(CommandError::DeviceNotFound(device_id.to_string())),
            Err(source) => {
                return Err(CommandError::Lookup {
                    device_id: device_id.to_string(),
                    source,
                })
            }
        }

        let payload = serde_json::to_vec(&CommandMessage {
            command: command.to_string(),
        })?;
        self.broker
            .publish(&topic::commands_topic(device_id), payload, false)
            .await
            .map_err(|source| {
                error!(device_id, command, "Failed to send command: {}", source);
                CommandError::PublishFailed {
                    device_id: device_id.to_string(),
                    source,
                }
            })?;
        info!(device_id, command, "Command sent to device");

        let status = match self.registry.apply_command_status(device_id, command).await {
            Ok(StatusOutcome::Updated(status)) => Some(status),
            Ok(StatusOutcome::NoStatusChange) => None,
            Err(source) if DeviceStatus::from_command(command).is_none() => {
                warn!(device_id, command, "Failed to log command: {}", source);
                None
            }
            Err(source) => {
                error!(device_id, command, "Failed to update device status: {}", source);
                return Err(CommandError::StatusUpdateFailed {
                    device_id: device_id.to_string(),
                    source,
                });
            }
        };

        Ok(CommandReceipt {
            command: command.to_string(),
            status,
        })
    }

    /// Publishes a user-supplied event. Device-scoped topics require the
    /// device to be registered.
    pub async fn publish_event(&self, topic: &str, message: &Value) -> Result<(), PublishError> {
        topic::validate_user_topic(topic)?;

        if let Some(device_id) = topic::scoped_device_id(topic) {
            let exists = self
                .registry
                .exists(device_id)
                .await
                .map_err(|source| PublishError::Lookup {
                    device_id: device_id.to_string(),
                    source,
                })?;
            if !exists {
                return Err(PublishError::DeviceNotRegistered(device_id.to_string()));
            }
        }

        let payload = serde_json::to_vec(message)?;
        self.broker.publish(topic, payload, false).await?;
        info!(topic, "Event published");
        Ok(())
    }

    /// Announces an operator registration on `devices/register` (retained).
    /// Failures are logged only; the registration itself already succeeded.
    pub async fn announce_registration(&self, device_id: &str, device_type: DeviceType) {
        let message = RegistrationMessage {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
        };
        let result = match serde_json::to_vec(&message) {
            Ok(payload) => self
                .broker
                .publish(topic::REGISTER_TOPIC, payload, true)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => info!(device_id, "Published device registration event"),
            Err(e) => error!(device_id, "Failed to publish device registration event: {}", e),
        }
    }
}
