//! Streaming-avatar provider client (HeyGen streaming API v1).
//!
//! Key-authenticated calls (`x-api-key`) mint streaming tokens and manage
//! sessions from the server side; session calls made on behalf of a
//! conversation use the short-lived streaming token as a bearer.

use reqwest::{Client, Response};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::observability::TracedClientExt;
use std::time::Duration;

use crate::config::{AvatarSettings, StreamingSettings};
use crate::error::SessionError;

const API_KEY_HEADER: &str = "x-api-key";

/// Provider code meaning "ok" in the response envelope.
const SUCCESS_CODE: i64 = 100;

#[derive(Clone)]
pub struct StreamingClient {
    client: Client,
    base_url: String,
    api_key: Secret<String>,
}

/// Session start request with the fixed avatar configuration.
#[derive(Debug, Clone, Serialize)]
pub struct NewSessionRequest {
    pub quality: String,
    pub avatar_name: String,
    pub voice: VoiceSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,
    pub disable_idle_timeout: bool,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceSettings {
    pub voice_id: String,
    pub rate: f32,
    pub emotion: String,
}

impl From<&AvatarSettings> for NewSessionRequest {
    fn from(avatar: &AvatarSettings) -> Self {
        Self {
            quality: avatar.quality.clone(),
            avatar_name: avatar.avatar_name.clone(),
            voice: VoiceSettings {
                voice_id: avatar.voice_id.clone(),
                rate: avatar.voice_rate,
                emotion: avatar.voice_emotion.clone(),
            },
            knowledge_base_id: avatar.knowledge_base_id.clone(),
            disable_idle_timeout: avatar.disable_idle_timeout,
            version: "v2".to_string(),
        }
    }
}

/// A remote streaming session as returned by `streaming.new`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamingSession {
    pub session_id: String,
    /// Media-room access token for the presentation layer.
    pub access_token: String,
    /// Media-room URL.
    pub url: String,
    /// Realtime event socket.
    pub realtime_endpoint: String,
}

#[derive(Debug, Serialize)]
struct SessionIdBody<'a> {
    session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct TaskBody<'a> {
    session_id: &'a str,
    text: &'a str,
    task_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    token: String,
}

impl StreamingClient {
    /// `Ok(None)` when no API key is configured.
    pub fn from_settings(settings: &StreamingSettings) -> Result<Option<Self>, reqwest::Error> {
        let Some(api_key) = settings.api_key.clone() else {
            return Ok(None);
        };
        if api_key.expose_secret().is_empty() {
            return Ok(None);
        }

        Self::new(settings.base_url.clone(), api_key).map(Some)
    }

    pub fn new(base_url: String, api_key: Secret<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/v1/{}", self.base_url, method)
    }

    /// Exchange the API key for a short-lived streaming token.
    pub async fn create_token(&self) -> Result<String, SessionError> {
        let response = self
            .client
            .traced_post(&self.url("streaming.create_token"))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .send()
            .await
            .map_err(network_error)?;

        let data: TokenData = read_data(response)
            .await
            .map_err(|e| SessionError::TokenExchange(e.to_string()))?;
        Ok(data.token)
    }

    pub async fn new_session(
        &self,
        token: &str,
        request: &NewSessionRequest,
    ) -> Result<StreamingSession, SessionError> {
        let response = self
            .client
            .traced_post(&self.url("streaming.new"))
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        read_data(response).await
    }

    pub async fn start_session(&self, token: &str, session_id: &str) -> Result<(), SessionError> {
        let response = self
            .client
            .traced_post(&self.url("streaming.start"))
            .bearer_auth(token)
            .json(&SessionIdBody { session_id })
            .send()
            .await
            .map_err(network_error)?;

        read_envelope::<Value>(response).await.map(|_| ())
    }

    /// Ask the avatar to speak `text` verbatim.
    pub async fn send_task(
        &self,
        token: &str,
        session_id: &str,
        text: &str,
    ) -> Result<(), SessionError> {
        let response = self
            .client
            .traced_post(&self.url("streaming.task"))
            .bearer_auth(token)
            .json(&TaskBody {
                session_id,
                text,
                task_type: "talk",
            })
            .send()
            .await
            .map_err(network_error)?;

        read_envelope::<Value>(response).await.map(|_| ())
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<(), SessionError> {
        let response = self
            .client
            .traced_post(&self.url("streaming.stop"))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(&SessionIdBody { session_id })
            .send()
            .await
            .map_err(network_error)?;

        read_envelope::<Value>(response).await.map(|_| ())
    }

    /// Active sessions on the account, passed through as the provider returns them.
    pub async fn list_sessions(&self) -> Result<Value, SessionError> {
        let response = self
            .client
            .traced_get(&self.url("streaming.list"))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let body = response.text().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(SessionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| SessionError::Network(e.to_string()))
    }
}

fn network_error(err: reqwest::Error) -> SessionError {
    tracing::error!(error = %err, "Streaming provider request failed");
    SessionError::Network(err.to_string())
}

/// Unwrap the provider envelope. A non-success code wins over the HTTP status
/// so distinguished codes (concurrency limit) survive 4xx responses.
async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<Option<T>, SessionError> {
    let status = response.status();
    let body = response.text().await.map_err(network_error)?;

    match serde_json::from_str::<Envelope<T>>(&body) {
        Ok(envelope) => {
            if let Some(code) = envelope.code.filter(|c| *c != SUCCESS_CODE) {
                return Err(SessionError::Provider {
                    code,
                    message: envelope.message.unwrap_or_default(),
                });
            }
            if !status.is_success() {
                return Err(SessionError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(envelope.data)
        }
        Err(_) if !status.is_success() => Err(SessionError::Rejected {
            status: status.as_u16(),
            body,
        }),
        Err(e) => Err(SessionError::Network(format!("invalid response: {}", e))),
    }
}

async fn read_data<T: DeserializeOwned>(response: Response) -> Result<T, SessionError> {
    read_envelope(response)
        .await?
        .ok_or_else(|| SessionError::Network("invalid response: missing data".to_string()))
}
