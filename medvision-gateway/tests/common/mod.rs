#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use medvision_gateway::config::{
    AvatarSettings, MeldRxSettings, ObservabilitySettings, ServerSettings, SessionStoreSettings,
    Settings, StreamingSettings,
};
use medvision_gateway::services::{Clock, MemorySessionStore};
use medvision_gateway::{AppState, Application};
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_TOKEN: &str = "meldrx-test-token";
pub const STREAMING_TOKEN: &str = "streaming-test-token";

pub fn meldrx_settings(base_url: &str) -> MeldRxSettings {
    MeldRxSettings {
        base_url: base_url.to_string(),
        client_id: "test-client".to_string(),
        client_secret: Secret::new("test-secret".to_string()),
        scope: "meldrx-api patient/*.* cds".to_string(),
        request_timeout_secs: 10,
        token_refresh_buffer_secs: 300,
        mock_routes: true,
    }
}

pub fn streaming_settings(base_url: &str) -> StreamingSettings {
    StreamingSettings {
        base_url: base_url.to_string(),
        api_key: Some(Secret::new("test-api-key".to_string())),
        avatar: AvatarSettings::default(),
        max_start_attempts: 3,
        retry_backoff_millis: 10,
        concurrency_limit_code: 10004,
    }
}

pub fn settings(meldrx_url: &str, streaming_url: &str) -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 0, // Random port
        },
        meldrx: meldrx_settings(meldrx_url),
        streaming: streaming_settings(streaming_url),
        session_store: SessionStoreSettings::default(),
        observability: ObservabilitySettings::default(),
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub async fn mount_meldrx_token(server: &MockServer, token: &str, expires_in: i64) {
    Mock::given(method("POST"))
        .and(path("/connect/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "expires_in": expires_in,
            "token_type": "Bearer"
        })))
        .mount(server)
        .await;
}

pub fn workspaces_body() -> Value {
    json!([
        { "wsIdentifier": "ws_1", "tin": "12-3456789", "name": "Test Clinic" },
        { "wsIdentifier": "ws_2", "tin": "98-7654321", "name": "Demo Hospital" }
    ])
}

/// Provider envelope around `data`.
pub fn ok_envelope(data: Value) -> Value {
    json!({ "code": 100, "message": "success", "data": data })
}

pub async fn mount_streaming_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/streaming.create_token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ok_envelope(json!({ "token": STREAMING_TOKEN }))),
        )
        .mount(server)
        .await;
}

pub fn new_session_body(realtime_endpoint: &str) -> Value {
    ok_envelope(json!({
        "session_id": "sess_1",
        "access_token": "room-token",
        "url": "wss://media.example.test",
        "realtime_endpoint": realtime_endpoint
    }))
}

/// Realtime socket that pushes `frames` after the handshake, then waits for
/// the client's close frame. Resolves `true` if one arrived.
pub async fn spawn_realtime_server(frames: Vec<&'static str>) -> (String, JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("ws://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        for frame in frames {
            ws.send(Message::Text(frame.to_string())).await.unwrap();
        }

        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Close(_)) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    });

    (address, handle)
}

/// Realtime socket that pushes `frames` and then closes from the provider
/// side.
pub async fn spawn_closing_realtime_server(frames: Vec<&'static str>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("ws://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        for frame in frames {
            ws.send(Message::Text(frame.to_string())).await.unwrap();
        }
        let _ = ws.close(None).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    (address, handle)
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub meldrx: MockServer,
    pub streaming: MockServer,
    pub store: Arc<MemorySessionStore>,
    pub state: AppState,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let meldrx = MockServer::start().await;
        let streaming = MockServer::start().await;
        let settings = settings(&meldrx.uri(), &streaming.uri());

        let store = Arc::new(MemorySessionStore::default());
        let state = AppState::from_settings(&settings, store.clone()).unwrap();

        let app = Application::build_with_state(settings, state.clone())
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        Self {
            address,
            port,
            meldrx,
            streaming,
            store,
            state,
        }
    }
}
