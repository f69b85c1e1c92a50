use thiserror::Error;

pub const REGISTER_TOPIC: &str = "devices/register";
pub const HIGH_ENERGY_TOPIC: &str = "events/high_energy_usage";
pub const DEVICE_DATA_WILDCARD: &str = "devices/+/data";

/// Topics the bridge keeps subscribed for its whole lifetime.
pub const BASELINE_TOPICS: [&str; 3] = [REGISTER_TOPIC, HIGH_ENERGY_TOPIC, DEVICE_DATA_WILDCARD];

const DEVICES_ROOT: &str = "devices";
const EVENTS_ROOT: &str = "events";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("'{0}' is not a device topic")]
    NotADeviceTopic(String),
    #[error("Invalid topic format: '{0}'")]
    InvalidFormat(String),
}

/// A topic of the shape `devices/<id>/<suffix>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTopic<'a> {
    pub device_id: &'a str,
    pub suffix: &'a str,
}

/// Which handler an inbound broker message belongs to. Evaluated in order,
/// first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute<'a> {
    Registration,
    HighEnergyUsage,
    DeviceData(&'a str),
    Unrouted,
}

pub fn parse_device_topic(topic: &str) -> Result<DeviceTopic<'_>, TopicError> {
    let not_device = || TopicError::NotADeviceTopic(topic.to_string());

    let rest = topic
        .strip_prefix(DEVICES_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(not_device)?;
    let (device_id, suffix) = rest.split_once('/').ok_or_else(not_device)?;

    if device_id.is_empty() || suffix.is_empty() {
        return Err(not_device());
    }

    Ok(DeviceTopic { device_id, suffix })
}

/// Accepts `(devices|events)/segment(/segment)*` where every segment is
/// made of ASCII letters, digits and underscores.
pub fn validate_user_topic(topic: &str) -> Result<(), TopicError> {
    let invalid = || TopicError::InvalidFormat(topic.to_string());

    let mut segments = topic.split('/');
    match segments.next() {
        Some(DEVICES_ROOT) | Some(EVENTS_ROOT) => {}
        _ => return Err(invalid()),
    }

    let mut seen = 0usize;
    for segment in segments {
        if segment.is_empty() || !segment.chars().all(is_segment_char) {
            return Err(invalid());
        }
        seen += 1;
    }

    if seen == 0 {
        return Err(invalid());
    }
    Ok(())
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Device id a user-published topic is scoped to, if any.
pub fn scoped_device_id(topic: &str) -> Option<&str> {
    let mut segments = topic.split('/');
    match (segments.next(), segments.next()) {
        (Some(DEVICES_ROOT), Some(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}

pub fn classify(topic: &str) -> InboundRoute<'_> {
    if topic == REGISTER_TOPIC {
        return InboundRoute::Registration;
    }
    if topic == HIGH_ENERGY_TOPIC {
        return InboundRoute::HighEnergyUsage;
    }
    match parse_device_topic(topic) {
        Ok(DeviceTopic { device_id, suffix: "data" }) => InboundRoute::DeviceData(device_id),
        _ => InboundRoute::Unrouted,
    }
}

pub fn commands_topic(device_id: &str) -> String {
    format!("{DEVICES_ROOT}/{device_id}/commands")
}

pub fn data_topic(device_id: &str) -> String {
    format!("{DEVICES_ROOT}/{device_id}/data")
}

pub fn is_baseline(topic: &str) -> bool {
    BASELINE_TOPICS.contains(&topic)
}
