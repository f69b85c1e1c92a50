use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    LightBulb,
    EnergyTracker,
    SmartSwitch,
    DoorBell,
    SecurityCamera,
}

impl DeviceType {
    pub const ALL: [DeviceType; 5] = [
        DeviceType::LightBulb,
        DeviceType::EnergyTracker,
        DeviceType::SmartSwitch,
        DeviceType::DoorBell,
        DeviceType::SecurityCamera,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::LightBulb => "light_bulb",
            DeviceType::EnergyTracker => "energy_tracker",
            DeviceType::SmartSwitch => "smart_switch",
            DeviceType::DoorBell => "door_bell",
            DeviceType::SecurityCamera => "security_camera",
        }
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Off,
    #[default]
    Active,
    Triggered,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Off => "off",
            DeviceStatus::Active => "active",
            DeviceStatus::Triggered => "triggered",
        }
    }

    /// Status implied by a telemetry payload for a device of the given type.
    pub fn from_data(device_type: DeviceType, payload: &Value) -> Self {
        match device_type {
            DeviceType::LightBulb => match payload.get("status").and_then(Value::as_str) {
                Some("ON") => DeviceStatus::Active,
                _ => DeviceStatus::Off,
            },
            _ => DeviceStatus::Active,
        }
    }

    /// Status implied by a user command, `None` when the command does not
    /// touch status.
    pub fn from_command(command: &str) -> Option<Self> {
        match command {
            "turn_off" => Some(DeviceStatus::Off),
            "turn_on" => Some(DeviceStatus::Active),
            _ => None,
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(DeviceStatus::Off),
            "active" => Ok(DeviceStatus::Active),
            "triggered" => Ok(DeviceStatus::Triggered),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub data: Option<Value>,
    pub commands: Vec<Value>,
}

impl Device {
    pub fn new(device_id: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            status: DeviceStatus::default(),
            data: None,
            commands: Vec::new(),
        }
    }
}

/// Payload on `devices/register`, sent by devices and by the bridge itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationMessage {
    pub device_id: String,
    pub device_type: String,
}

/// Payload on `devices/<id>/commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
}

/// Payload on `events/high_energy_usage`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighEnergyEvent {
    pub device_id: String,
    #[serde(default)]
    pub event_type: Option<String>,
    pub value: Value,
}
