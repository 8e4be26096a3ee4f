//! MeldRx system token acquisition and caching.
//!
//! One bearer token is cached per broker. Callers always go through
//! [`TokenBroker::get_valid_token`], which refreshes via the client-credential
//! grant once the cached token is inside the refresh window.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::observability::TracedClientExt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::MeldRxSettings;
use crate::error::AuthError;

/// Time source, injectable so expiry logic can be driven from tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Usable if it is still valid `buffer` past `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at > now + buffer
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[allow(dead_code)]
    #[serde(default)]
    token_type: Option<String>,
}

pub struct TokenBroker {
    client: Client,
    settings: MeldRxSettings,
    clock: Arc<dyn Clock>,
    cache: RwLock<Option<Token>>,
    // Serializes refreshes so concurrent misses trigger one exchange.
    refresh_lock: Mutex<()>,
}

impl TokenBroker {
    pub fn new(settings: MeldRxSettings) -> Result<Self, reqwest::Error> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: MeldRxSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;

        Ok(Self {
            client,
            settings,
            clock,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    fn refresh_buffer(&self) -> Duration {
        Duration::seconds(self.settings.token_refresh_buffer_secs)
    }

    async fn cached_if_valid(&self) -> Option<String> {
        let now = self.clock.now();
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_valid_at(now, self.refresh_buffer()))
            .map(|token| token.value.clone())
    }

    /// Snapshot of the cached token, valid or not.
    pub async fn cached(&self) -> Option<Token> {
        self.cache.read().await.clone()
    }

    /// Return a token with at least the refresh window of validity left,
    /// exchanging client credentials for a new one when needed.
    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached_if_valid().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.cached_if_valid().await {
            return Ok(token);
        }

        let issued_at = self.clock.now();
        let response = self.request_token().await?;
        let expires_at = Duration::try_seconds(response.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                tracing::error!(expires_in = response.expires_in, "MeldRx token lifetime out of range");
                AuthError::InvalidResponse(format!(
                    "expires_in out of range: {}",
                    response.expires_in
                ))
            })?;
        let token = Token {
            value: response.access_token,
            expires_at,
        };

        tracing::info!(expires_at = %token.expires_at, "MeldRx system token refreshed");
        metrics::counter!("meldrx_token_refreshes_total").increment(1);

        let value = token.value.clone();
        *self.cache.write().await = Some(token);
        Ok(value)
    }

    async fn request_token(&self) -> Result<TokenResponse, AuthError> {
        let url = self.settings.token_url();
        let params = [
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.expose_secret().as_str()),
            ("grant_type", "client_credentials"),
            ("scope", self.settings.scope.as_str()),
        ];

        let response = self
            .client
            .traced_post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    tracing::error!("Request timed out when connecting to MeldRx API");
                    AuthError::TimedOut
                } else {
                    tracing::error!(error = %e, "Error getting MeldRx system token");
                    AuthError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "MeldRx token request rejected");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<TokenResponse>().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::TimedOut
            } else {
                AuthError::InvalidResponse(e.to_string())
            }
        })
    }
}
