use device_bridge::config::Config;
use device_bridge::db::SqliteStore;
use device_bridge::dispatcher::CommandDispatcher;
use device_bridge::mqtt_service::MqttService;
use device_bridge::registry::DeviceRegistry;
use device_bridge::relay::EventRelay;
use device_bridge::rest_server::{run_rest_server, AppState};
use device_bridge::service_utils::{connect_broker, handle_shutdown, start_mqtt_service};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let store = match SqliteStore::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open device database: {:?}", e);
            return;
        }
    };
    info!("Database {} opened successfully.", config.database_path);

    let (broker, eventloop) = connect_broker(&config);
    let registry = DeviceRegistry::new(store);
    let relay = EventRelay::new(broker.clone(), config.relay_buffer);
    let dispatcher = CommandDispatcher::new(broker.clone(), registry.clone());
    let mqtt_service = MqttService::new(
        broker.clone(),
        registry.clone(),
        relay.clone(),
        Duration::from_millis(config.mqtt_reconnect_interval_ms),
    );

    let mqtt_task = start_mqtt_service(mqtt_service, eventloop);

    let listener = match TcpListener::bind(config.http_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {:?}", config.http_addr(), e);
            mqtt_task.abort();
            return;
        }
    };

    let state = AppState {
        registry,
        dispatcher,
        relay,
    };
    if let Err(e) = run_rest_server(listener, state, handle_shutdown()).await {
        error!("REST server failed: {:?}", e);
    }

    mqtt_task.abort();
    info!("All services shut down successfully.");
}
