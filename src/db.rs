use crate::models::{Device, DeviceStatus, DeviceType};
use async_trait::async_trait;
use log::{error, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt device record: {0}")]
    Corrupt(String),
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Key-value view of persisted devices, keyed by device id.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    /// Inserts a new record. Returns `false` when the id is already taken.
    async fn insert(&self, device: &Device) -> Result<bool, StoreError>;

    /// Creates the record or replaces its type. Returns `true` when created.
    async fn upsert_type(&self, device_id: &str, device_type: DeviceType) -> Result<bool, StoreError>;

    /// Returns `false` when no record matched.
    async fn update_data(
        &self,
        device_id: &str,
        data: &Value,
        status: DeviceStatus,
    ) -> Result<bool, StoreError>;

    /// Appends to the command log and optionally replaces the status.
    /// Returns `false` when no record matched.
    async fn record_command(
        &self,
        device_id: &str,
        command: &Value,
        status: Option<DeviceStatus>,
    ) -> Result<bool, StoreError>;
}

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Opens (or creates) the database file and ensures the schema exists.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        });
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let store = Self { pool };
        store.initialize_db()?;
        Ok(store)
    }

    /// Initializes the database schema.
    fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY NOT NULL,
            device_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('off', 'active', 'triggered')),
            data TEXT,
            commands TEXT NOT NULL DEFAULT '[]'
        );
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }
}

type DeviceRow = (String, String, String, Option<String>, String);

fn decode_row(row: DeviceRow) -> Result<Device, StoreError> {
    let (device_id, device_type, status, data, commands) = row;
    let device_type = device_type
        .parse::<DeviceType>()
        .map_err(|t| StoreError::Corrupt(format!("unknown device type '{}' for {}", t, device_id)))?;
    let status = status
        .parse::<DeviceStatus>()
        .map_err(|s| StoreError::Corrupt(format!("unknown status '{}' for {}", s, device_id)))?;
    let data = data.map(|raw| serde_json::from_str(&raw)).transpose()?;
    let commands = serde_json::from_str(&commands)?;

    Ok(Device {
        device_id,
        device_type,
        status,
        data,
        commands,
    })
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn find(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT device_id, device_type, status, data, commands
                     FROM devices WHERE device_id = ?1",
                    params![device_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;
            row.map(decode_row).transpose()
        })
        .await
    }

    async fn insert(&self, device: &Device) -> Result<bool, StoreError> {
        let device_id = device.device_id.clone();
        let device_type = device.device_type.as_str();
        let status = device.status.as_str();
        let data = device.data.as_ref().map(serde_json::to_string).transpose()?;
        let commands = serde_json::to_string(&device.commands)?;

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO devices (device_id, device_type, status, data, commands)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(device_id) DO NOTHING",
                params![device_id, device_type, status, data, commands],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn upsert_type(&self, device_id: &str, device_type: DeviceType) -> Result<bool, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let created = tx.execute(
                "INSERT INTO devices (device_id, device_type) VALUES (?1, ?2)
                 ON CONFLICT(device_id) DO NOTHING",
                params![device_id, device_type.as_str()],
            )? == 1;
            if !created {
                tx.execute(
                    "UPDATE devices SET device_type = ?2 WHERE device_id = ?1",
                    params![device_id, device_type.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn update_data(
        &self,
        device_id: &str,
        data: &Value,
        status: DeviceStatus,
    ) -> Result<bool, StoreError> {
        let device_id = device_id.to_string();
        let data = serde_json::to_string(data)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE devices SET data = ?2, status = ?3 WHERE device_id = ?1",
                params![device_id, data, status.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn record_command(
        &self,
        device_id: &str,
        command: &Value,
        status: Option<DeviceStatus>,
    ) -> Result<bool, StoreError> {
        let device_id = device_id.to_string();
        let command = serde_json::to_string(command)?;
        let status = status.map(|s| s.as_str());
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE devices
                 SET commands = json_insert(commands, '$[#]', json(?2)),
                     status = COALESCE(?3, status)
                 WHERE device_id = ?1",
                params![device_id, command, status],
            )?;
            Ok(updated > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("devices.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn insert_then_find_returns_defaults() {
        let (_dir, store) = open_store();
        assert!(store.insert(&Device::new("d1", DeviceType::LightBulb)).await.unwrap());

        let device = store.find("d1").await.unwrap().unwrap();
        assert_eq!(device.device_type, DeviceType::LightBulb);
        assert_eq!(device.status, DeviceStatus::Active);
        assert!(device.data.is_none());
        assert!(device.commands.is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_is_refused() {
        let (_dir, store) = open_store();
        assert!(store.insert(&Device::new("d1", DeviceType::LightBulb)).await.unwrap());
        assert!(!store.insert(&Device::new("d1", DeviceType::DoorBell)).await.unwrap());

        let device = store.find("d1").await.unwrap().unwrap();
        assert_eq!(device.device_type, DeviceType::LightBulb);
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_type() {
        let (_dir, store) = open_store();
        assert!(store.upsert_type("d1", DeviceType::SmartSwitch).await.unwrap());
        assert!(!store.upsert_type("d1", DeviceType::EnergyTracker).await.unwrap());

        let device = store.find("d1").await.unwrap().unwrap();
        assert_eq!(device.device_type, DeviceType::EnergyTracker);
    }

    #[tokio::test]
    async fn data_and_commands_persist() {
        let (_dir, store) = open_store();
        store.insert(&Device::new("d1", DeviceType::LightBulb)).await.unwrap();

        let payload = json!({ "status": "OFF", "brightness": 10 });
        assert!(store.update_data("d1", &payload, DeviceStatus::Off).await.unwrap());
        assert!(store
            .record_command("d1", &json!({ "command": "blink" }), None)
            .await
            .unwrap());
        assert!(store
            .record_command("d1", &json!({ "command": "turn_on" }), Some(DeviceStatus::Active))
            .await
            .unwrap());

        let device = store.find("d1").await.unwrap().unwrap();
        assert_eq!(device.data, Some(payload));
        assert_eq!(device.status, DeviceStatus::Active);
        assert_eq!(
            device.commands,
            vec![json!({ "command": "blink" }), json!({ "command": "turn_on" })]
        );
    }

    #[tokio::test]
    async fn updates_to_missing_devices_match_nothing() {
        let (_dir, store) = open_store();
        assert!(!store.update_data("ghost", &json!({}), DeviceStatus::Active).await.unwrap());
        assert!(!store
            .record_command("ghost", &json!({ "command": "turn_off" }), Some(DeviceStatus::Off))
            .await
            .unwrap());
        assert!(store.find("ghost").await.unwrap().is_none());
    }
}
