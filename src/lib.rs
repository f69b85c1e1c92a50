//! Bridges an MQTT device bus with a persisted device registry and live
//! HTTP observers.
//!
//! ```text
//! devices -> broker -> MqttService -> { DeviceRegistry, EventRelay -> SSE }
//! HTTP    -> CommandDispatcher -> broker -> devices
//! ```

pub mod broker;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod models;
pub mod mqtt_service;
pub mod registry;
pub mod relay;
pub mod rest_server;
pub mod service_utils;
pub mod topic;
