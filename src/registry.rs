use crate::db::{DeviceStore, StoreError};
use crate::models::{CommandMessage, Device, DeviceStatus, DeviceType};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("deviceId must not be empty")]
    InvalidDeviceId,
    #[error("Invalid deviceType '{0}'")]
    InvalidDeviceType(String),
    #[error("Device {0} already exists")]
    AlreadyExists(String),
    #[error("Device {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a broker-sourced registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    Updated(DeviceStatus),
    /// The device is not registered; nothing was stored.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Updated(DeviceStatus),
    NoStatusChange,
}

/// One async mutex per device id, dropped again once nobody holds it.
#[derive(Default)]
struct DeviceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct DeviceLockGuard<'a> {
    owner: &'a DeviceLocks,
    device_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DeviceLocks {
    async fn lock(&self, device_id: &str) -> DeviceLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(device_id.to_string()).or_default().clone()
        };
        // Built before the wait so an abandoned wait still prunes its entry.
        let mut guard = DeviceLockGuard {
            owner: self,
            device_id: device_id.to_string(),
            guard: None,
        };
        guard.guard = Some(lock.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for DeviceLockGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the last reference when idle.
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.device_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.device_id);
        }
    }
}

/// Owns device records. Mutations for one device id are serialized; distinct
/// ids proceed independently.
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    locks: DeviceLocks,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks: DeviceLocks::default(),
        })
    }

    fn validate(device_id: &str, device_type: &str) -> Result<DeviceType, RegistryError> {
        if device_id.is_empty() {
            return Err(RegistryError::InvalidDeviceId);
        }
        device_type
            .parse::<DeviceType>()
            .map_err(RegistryError::InvalidDeviceType)
    }

    /// Operator registration. A duplicate id is an error.
    pub async fn register(&self, device_id: &str, device_type: &str) -> Result<(), RegistryError> {
        let device_type = Self::validate(device_id, device_type)?;
        let _guard = self.locks.lock(device_id).await;

        if !self.store.insert(&Device::new(device_id, device_type)).await? {
            return Err(RegistryError::AlreadyExists(device_id.to_string()));
        }
        info!(device_id, %device_type, "Device registered");
        Ok(())
    }

    /// Device self-announcement. Creates the record or updates its type.
    pub async fn announce(&self, device_id: &str, device_type: &str) -> Result<Announcement, RegistryError> {
        let device_type = Self::validate(device_id, device_type)?;
        let _guard = self.locks.lock(device_id).await;

        if self.store.upsert_type(device_id, device_type).await? {
            info!(device_id, %device_type, "Device registered from broker announcement");
            Ok(Announcement::Created)
        } else {
            info!(device_id, %device_type, "Device already registered, type updated");
            Ok(Announcement::Updated)
        }
    }

    pub async fn find(&self, device_id: &str) -> Result<Device, RegistryError> {
        self.store
            .find(device_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(device_id.to_string()))
    }

    pub async fn exists(&self, device_id: &str) -> Result<bool, RegistryError> {
        Ok(self.store.find(device_id).await?.is_some())
    }

    /// Stores telemetry verbatim and recomputes status from it.
    pub async fn apply_data(&self, device_id: &str, payload: Value) -> Result<DataOutcome, RegistryError> {
        let _guard = self.locks.lock(device_id).await;

        let Some(device) = self.store.find(device_id).await? else {
            warn!(device_id, "Received data from unregistered device. Ignoring message.");
            return Ok(DataOutcome::Ignored);
        };

        let status = DeviceStatus::from_data(device.device_type, &payload);
        if !self.store.update_data(device_id, &payload, status).await? {
            return Ok(DataOutcome::Ignored);
        }
        debug!(device_id, %status, "Data and status updated");
        Ok(DataOutcome::Updated(status))
    }

    /// Logs an issued command and applies the status it implies, if any.
    pub async fn apply_command_status(
        &self,
        device_id: &str,
        command: &str,
    ) -> Result<StatusOutcome, RegistryError> {
        let _guard = self.locks.lock(device_id).await;

        let payload = serde_json::to_value(CommandMessage {
            command: command.to_string(),
        })
        .map_err(StoreError::from)?;
        let status = DeviceStatus::from_command(command);

        if !self.store.record_command(device_id, &payload, status).await? {
            return Err(RegistryError::NotFound(device_id.to_string()));
        }

        Ok(match status {
            Some(status) => {
                info!(device_id, %status, "Device status updated from command");
                StatusOutcome::Updated(status)
            }
            None => StatusOutcome::NoStatusChange,
        })
    }
}
