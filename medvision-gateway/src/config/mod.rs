use secrecy::Secret;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const SERVICE_DIR: &str = "medvision-gateway";

#[derive(Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub meldrx: MeldRxSettings,
    pub streaming: StreamingSettings,
    #[serde(default)]
    pub session_store: SessionStoreSettings,
    #[serde(default)]
    pub observability: ObservabilitySettings,
}

#[derive(Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone)]
pub struct MeldRxSettings {
    /// e.g. https://app.meldrx.com
    pub base_url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// A cached token is only handed out if it outlives this window.
    #[serde(default = "default_token_refresh_buffer_secs")]
    pub token_refresh_buffer_secs: i64,
    /// Serve canned data under /api/mock-meldrx for front-end work without credentials.
    #[serde(default)]
    pub mock_routes: bool,
}

impl MeldRxSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_url(&self) -> String {
        format!("{}/connect/token", self.base_url.trim_end_matches('/'))
    }
}

fn default_scope() -> String {
    "meldrx-api patient/*.* cds".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_token_refresh_buffer_secs() -> i64 {
    300
}

#[derive(Deserialize, Clone)]
pub struct StreamingSettings {
    /// e.g. https://api.heygen.com
    pub base_url: String,
    /// Absent key disables the streaming integration only.
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
    #[serde(default)]
    pub avatar: AvatarSettings,
    #[serde(default = "default_max_start_attempts")]
    pub max_start_attempts: u32,
    #[serde(default = "default_retry_backoff_millis")]
    pub retry_backoff_millis: u64,
    /// Provider error code for "concurrent session limit reached".
    #[serde(default = "default_concurrency_limit_code")]
    pub concurrency_limit_code: i64,
}

fn default_max_start_attempts() -> u32 {
    3
}

fn default_retry_backoff_millis() -> u64 {
    5_000
}

fn default_concurrency_limit_code() -> i64 {
    10004
}

#[derive(Deserialize, Clone, Debug)]
pub struct AvatarSettings {
    pub avatar_name: String,
    pub voice_id: String,
    pub voice_rate: f32,
    pub voice_emotion: String,
    pub quality: String,
    #[serde(default)]
    pub knowledge_base_id: Option<String>,
    #[serde(default = "default_true")]
    pub disable_idle_timeout: bool,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self {
            avatar_name: "Dexter_Doctor_Standing2_public".to_string(),
            voice_id: "en_us_001".to_string(),
            voice_rate: 1.0,
            voice_emotion: "friendly".to_string(),
            quality: "high".to_string(),
            knowledge_base_id: None,
            disable_idle_timeout: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Clone)]
pub struct SessionStoreSettings {
    pub path: PathBuf,
}

impl Default for SessionStoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/triage-session.json"),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct ObservabilitySettings {
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info,medvision_gateway=debug".to_string(),
            otlp_endpoint: None,
        }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    service_core::config::load_settings(SERVICE_DIR)
}
