use crate::broker::{BrokerHandle, RumqttLink};
use crate::config::Config;
use crate::mqtt_service::MqttService;
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&config.mqtt_client_id, &config.mqtt_host, config.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs));
    mqtt_options.set_clean_session(true);

    if !config.mqtt_username.is_empty() && !config.mqtt_password.is_empty() {
        mqtt_options.set_credentials(&config.mqtt_username, &config.mqtt_password);
    }
    mqtt_options
}

/// Build the broker handle and its (not yet polled) event loop.
pub fn connect_broker(config: &Config) -> (Arc<BrokerHandle>, EventLoop) {
    info!(
        "Configuring MQTT broker at {}:{} as '{}'...",
        config.mqtt_host, config.mqtt_port, config.mqtt_client_id
    );
    let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CHANNEL_CAPACITY);
    (BrokerHandle::new(Arc::new(RumqttLink::new(client))), eventloop)
}

/// Start the MQTT service
pub fn start_mqtt_service(mqtt_service: Arc<MqttService>, eventloop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(mqtt_service.run(eventloop))
}

/// Resolves once the process is asked to stop.
pub async fn handle_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        std::future::pending::<()>().await;
    }
    info!("Bridge is shutting down...");
}
