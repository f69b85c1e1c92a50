use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: String,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_reconnect_interval_ms: u64,

    pub http_bind_addr: String,
    pub http_port: u16,
    pub database_path: String,
    pub relay_buffer: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_reconnect_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.mqtt_keep_alive_secs == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEP_ALIVE_SECS must be greater than zero".to_string(),
            ));
        }
        if self.relay_buffer == 0 {
            return Err(ConfigError::ParsingError(
                "RELAY_BUFFER must be greater than zero".to_string(),
            ));
        }
        if self.mqtt_host.is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_HOST".to_string()));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            mqtt_host: var("MQTT_HOST", "localhost"),
            mqtt_port: parse(&var("MQTT_PORT", "1883"), "MQTT_PORT must be a valid port")?,
            mqtt_username: var("MQTT_USERNAME", ""),
            mqtt_password: var("MQTT_PASSWORD", ""),
            mqtt_client_id: lookup("MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("device_bridge_{}", Uuid::new_v4())),
            mqtt_keep_alive_secs: parse(
                &var("MQTT_KEEP_ALIVE_SECS", "10"),
                "MQTT_KEEP_ALIVE_SECS must be a valid number",
            )?,
            mqtt_reconnect_interval_ms: parse(
                &var("MQTT_RECONNECT_INTERVAL_MS", "1000"),
                "MQTT_RECONNECT_INTERVAL_MS must be a valid number",
            )?,

            http_bind_addr: var("HTTP_BIND_ADDR", "0.0.0.0"),
            http_port: parse(&var("PORT", "3000"), "PORT must be a valid port")?,
            database_path: var("DATABASE_PATH", "smarthome.db"),
            relay_buffer: parse(&var("RELAY_BUFFER", "256"), "RELAY_BUFFER must be a valid number")?,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_bind_addr, self.http_port)
    }
}

fn parse<T: std::str::FromStr>(raw: &str, message: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(message.to_string()))
}
