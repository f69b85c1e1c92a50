use crate::dispatcher::{CommandDispatcher, CommandError, PublishError};
use crate::models::DeviceType;
use crate::registry::{DeviceRegistry, RegistryError};
use crate::relay::{parse_topic_list, EventRelay, ObserverSession, RelayMessage};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

const BODY_LIMIT_BYTES: usize = 64 * 1024;
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub relay: Arc<EventRelay>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    device_id: Option<String>,
    device_type: Option<String>,
}

#[derive(Deserialize)]
struct CommandRequest {
    command: Option<String>,
}

#[derive(Deserialize)]
struct PublishRequest {
    topic: Option<String>,
    message: Option<Value>,
}

#[derive(Deserialize)]
struct SubscribeQuery {
    topics: Option<String>,
}

/// One event on the subscription stream.
#[derive(Serialize)]
struct StreamMessage {
    topic: String,
    message: String,
}

/// JSON error body with a status code.
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }

    fn not_found() -> Self {
        Self(StatusCode::NOT_FOUND, "Device not found.".to_string())
    }

    fn internal(message: impl Into<String>) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(json!({ "message": text.into() }))).into_response()
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// An event body counts as missing when it is null, false, zero or "".
fn required_value(value: Option<Value>) -> Option<Value> {
    value.filter(|v| match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

/// Root handler
async fn root_handler() -> &'static str {
    "Server is running"
}

async fn register_device(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let (Some(device_id), Some(device_type)) = (required(request.device_id), required(request.device_type))
    else {
        return Err(ApiError::bad_request("deviceId and deviceType are required."));
    };

    match state.registry.register(&device_id, &device_type).await {
        Ok(()) => {}
        Err(RegistryError::InvalidDeviceType(_)) => return Err(ApiError::bad_request("Invalid deviceType.")),
        Err(RegistryError::AlreadyExists(_)) => return Err(ApiError::bad_request("Device already exists.")),
        Err(RegistryError::InvalidDeviceId) => {
            return Err(ApiError::bad_request("deviceId and deviceType are required."))
        }
        Err(e) => {
            error!("Device registration failed: {}", e);
            return Err(ApiError::internal("Failed to register device."));
        }
    }

    if let Ok(device_type) = device_type.parse::<DeviceType>() {
        state.dispatcher.announce_registration(&device_id, device_type).await;
    }

    Ok(message(StatusCode::CREATED, "Device registered successfully."))
}

async fn device_data(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.find(&device_id).await {
        Ok(device) => Ok(Json(json!({ "data": device.data }))),
        Err(RegistryError::NotFound(_)) => Err(ApiError::not_found()),
        Err(e) => {
            error!("Failed to retrieve device data: {}", e);
            Err(ApiError::internal("Failed to retrieve device data."))
        }
    }
}

async fn device_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.find(&device_id).await {
        Ok(device) => Ok(Json(json!({ "status": device.status }))),
        Err(RegistryError::NotFound(_)) => Err(ApiError::not_found()),
        Err(e) => {
            error!("Failed to retrieve device status: {}", e);
            Err(ApiError::internal("Failed to retrieve device status."))
        }
    }
}

async fn send_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let Some(command) = required(request.command) else {
        return Err(ApiError::bad_request("Command is required."));
    };

    match state.dispatcher.send_command(&device_id, &command).await {
        Ok(receipt) => {
            let mut text = format!("Command '{}' sent to device {}.", receipt.command, device_id);
            if let Some(status) = receipt.status {
                text.push_str(&format!(" Status updated to '{}'.", status));
            }
            Ok(message(StatusCode::OK, text))
        }
        Err(CommandError::EmptyCommand) => Err(ApiError::bad_request("Command is required.")),
        Err(CommandError::DeviceNotFound(_)) => Err(ApiError::not_found()),
        Err(CommandError::StatusUpdateFailed { .. }) => {
            Err(ApiError::internal("Failed to update device status."))
        }
        Err(e) => {
            error!("Failed to send command: {}", e);
            Err(ApiError::internal("Failed to send command."))
        }
    }
}

async fn publish_event(
    State(state): State<AppState>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let (Some(topic), Some(event)) = (
        required(request.topic),
        required_value(request.message),
    ) else {
        return Err(ApiError::bad_request("topic and message are required."));
    };

    match state.dispatcher.publish_event(&topic, &event).await {
        Ok(()) => Ok(message(StatusCode::OK, "Event published successfully.")),
        Err(PublishError::InvalidTopic(_)) => Err(ApiError::bad_request("Invalid topic format.")),
        Err(e @ PublishError::DeviceNotRegistered(_)) => Err(ApiError::bad_request(e.to_string())),
        Err(e) => {
            error!("Failed to publish event: {}", e);
            Err(ApiError::internal("Failed to publish event."))
        }
    }
}

fn stream_event(relayed: RelayMessage) -> Result<Event, axum::Error> {
    Event::default().json_data(StreamMessage {
        message: String::from_utf8_lossy(&relayed.payload).into_owned(),
        topic: relayed.topic,
    })
}

/// The stream owns the observer session, so a client disconnect drops the
/// session and releases its topics.
fn observer_stream(session: ObserverSession) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(session, |mut session| async move {
        let relayed = session.recv().await?;
        Some((stream_event(relayed), session))
    })
}

async fn subscribe_events(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let topics = query.topics.map(|raw| parse_topic_list(&raw)).unwrap_or_default();
    if topics.is_empty() {
        return Err(ApiError::bad_request("topics query parameter is required."));
    }

    info!("User subscribed to topics: {}", topics.join(", "));
    let session = state.relay.open(topics).await;

    Ok(Sse::new(observer_stream(session)).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/devices/register", post(register_device))
        .route("/devices/{device_id}/data", get(device_data))
        .route("/devices/{device_id}/status", get(device_status))
        .route("/devices/{device_id}/commands", post(send_command))
        .route("/events/publish", post(publish_event))
        .route("/events/subscribe", get(subscribe_events))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the REST API until `shutdown` resolves.
pub async fn run_rest_server<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Server is running on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{connected_handle, RecordingLink};
    use crate::broker::{BrokerHandle, ConnectionState};
    use crate::registry::testing::sqlite_registry;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct TestServer {
        _dir: TempDir,
        base: String,
        link: Arc<RecordingLink>,
        broker: Arc<BrokerHandle>,
        relay: Arc<EventRelay>,
        client: reqwest::Client,
    }

    async fn spawn_server() -> TestServer {
        let (dir, registry) = sqlite_registry();
        let (link, broker) = connected_handle();
        let relay = EventRelay::new(broker.clone(), 16);
        let dispatcher = CommandDispatcher::new(broker.clone(), registry.clone());
        let state = AppState {
            registry,
            dispatcher,
            relay: relay.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(run_rest_server(listener, state, std::future::pending()));

        TestServer {
            _dir: dir,
            base,
            link,
            broker,
            relay,
            client: reqwest::Client::new(),
        }
    }

    impl TestServer {
        async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
            let response = self
                .client
                .post(format!("{}{}", self.base, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
            (status, response.json().await.unwrap())
        }

        async fn get(&self, path: &str) -> (StatusCode, Value) {
            let response = self.client.get(format!("{}{}", self.base, path)).send().await.unwrap();
            let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
            (status, response.json().await.unwrap())
        }

        async fn register(&self, device_id: &str, device_type: &str) -> (StatusCode, Value) {
            self.post(
                "/devices/register",
                json!({ "deviceId": device_id, "deviceType": device_type }),
            )
            .await
        }
    }

    #[tokio::test]
    async fn registration_validates_input() {
        let server = spawn_server().await;

        let (status, body) = server.register("d1", "light_bulb").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({ "message": "Device registered successfully." }));
        assert!(server.link.retained_on("devices/register"));

        let (status, body) = server.register("d1", "light_bulb").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Device already exists." }));

        let (status, body) = server.register("d2", "toaster").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid deviceType." }));

        let (status, body) = server.post("/devices/register", json!({ "deviceId": "d3" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "deviceId and deviceType are required." }));
    }

    #[tokio::test]
    async fn data_and_status_lookups() {
        let server = spawn_server().await;
        server.register("cam", "security_camera").await;

        assert_eq!(
            server.get("/devices/cam/status").await,
            (StatusCode::OK, json!({ "status": "active" }))
        );
        assert_eq!(server.get("/devices/cam/data").await, (StatusCode::OK, json!({ "data": null })));
        assert_eq!(
            server.get("/devices/nope/status").await,
            (StatusCode::NOT_FOUND, json!({ "error": "Device not found." }))
        );
        assert_eq!(server.get("/devices/nope/data").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn turn_off_command_end_to_end() {
        let server = spawn_server().await;
        server.register("d1", "light_bulb").await;

        let (status, body) = server
            .post("/devices/d1/commands", json!({ "command": "turn_off" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "message": "Command 'turn_off' sent to device d1. Status updated to 'off'." })
        );
        assert!(server
            .link
            .published()
            .contains(&("devices/d1/commands".to_string(), json!({ "command": "turn_off" }))));
        assert_eq!(
            server.get("/devices/d1/status").await,
            (StatusCode::OK, json!({ "status": "off" }))
        );

        let (_, body) = server.post("/devices/d1/commands", json!({ "command": "blink" })).await;
        assert_eq!(body, json!({ "message": "Command 'blink' sent to device d1." }));
    }

    #[tokio::test]
    async fn command_errors_map_to_status_codes() {
        let server = spawn_server().await;
        server.register("d1", "light_bulb").await;

        let (status, body) = server.post("/devices/d1/commands", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Command is required." }));

        let (status, _) = server
            .post("/devices/ghost/commands", json!({ "command": "turn_on" }))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        server.broker.set_state(ConnectionState::Connecting);
        let (status, body) = server
            .post("/devices/d1/commands", json!({ "command": "turn_on" }))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Failed to send command." }));
    }

    #[tokio::test]
    async fn publish_validates_topic_and_device() {
        let server = spawn_server().await;
        server.register("bulb_1", "light_bulb").await;

        let (status, body) = server
            .post("/events/publish", json!({ "topic": "devices/unknown/data", "message": { "status": "ON" } }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Device unknown not registered." }));

        let (status, body) = server
            .post("/events/publish", json!({ "topic": "invalid_topic", "message": {} }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid topic format." }));

        let (status, body) = server.post("/events/publish", json!({ "topic": "events/x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "topic and message are required." }));

        for empty in [json!(null), json!(""), json!(0), json!(false)] {
            let (status, body) = server
                .post("/events/publish", json!({ "topic": "events/x", "message": empty }))
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "message {empty} should be rejected");
            assert_eq!(body, json!({ "error": "topic and message are required." }));
        }

        let (status, body) = server
            .post("/events/publish", json!({ "topic": "devices/bulb_1/data", "message": { "status": "ON" } }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "Event published successfully." }));

        server.broker.set_state(ConnectionState::Connecting);
        let (status, _) = server
            .post("/events/publish", json!({ "topic": "events/x", "message": 1 }))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn subscribe_requires_topics() {
        let server = spawn_server().await;
        assert_eq!(
            server.get("/events/subscribe").await,
            (StatusCode::BAD_REQUEST, json!({ "error": "topics query parameter is required." }))
        );
    }

    #[tokio::test]
    async fn subscription_streams_until_client_disconnects() {
        let server = spawn_server().await;
        let mut response = server
            .client
            .get(format!("{}/events/subscribe?topics=events/alarm,events/other", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(server.relay.topic_interest("events/alarm").await, 1);

        server
            .relay
            .dispatch("events/alarm", &Bytes::from_static(b"{\"level\":2}"))
            .await;

        let mut received = String::new();
        while !received.contains("\n\n") {
            let chunk = response.chunk().await.unwrap().expect("stream ended early");
            received.push_str(&String::from_utf8_lossy(&chunk));
        }
        let data = received
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(data).unwrap(),
            json!({ "topic": "events/alarm", "message": "{\"level\":2}" })
        );

        drop(response);
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.relay.observer_count().await > 0 {
                server
                    .relay
                    .dispatch("events/alarm", &Bytes::from_static(b"{}"))
                    .await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("observer was not released after disconnect");
        assert!(server.link.unsubscribed().contains(&"events/alarm".to_string()));
    }
}
