//! Typed failures of the MeldRx and streaming integrations.

use service_core::error::AppError;
use thiserror::Error;

pub const TIMEOUT_MESSAGE: &str =
    "Connection to MeldRx API timed out. Please check your network and try again.";

/// Client-credential exchange against the identity endpoint failed.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{}", TIMEOUT_MESSAGE)]
    TimedOut,

    #[error("Failed to get MeldRx token: {status} {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to reach MeldRx identity endpoint: {0}")]
    Network(String),

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}

/// The streaming session could not be started or driven.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Streaming API key is not configured")]
    MissingApiKey,

    #[error("Failed to fetch session token: {0}")]
    TokenExchange(String),

    #[error("Concurrent session limit reached after {attempts} attempts")]
    ConcurrencyLimit { attempts: u32 },

    #[error("Streaming provider error {code}: {message}")]
    Provider { code: i64, message: String },

    #[error("Streaming provider returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Streaming request failed: {0}")]
    Network(String),

    #[error("Realtime connection failed: {0}")]
    Realtime(String),

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session start was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("MeldRx request failed: {status} {body}")]
    Resource { status: u16, body: String },

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Streaming session is not connected")]
    NotConnected,

    #[error("{0}")]
    Validation(String),

    #[error("MeldRx request failed: {0}")]
    Network(String),

    #[error("Invalid MeldRx response: {0}")]
    Decode(String),
}

impl Error {
    /// True for lookups that found nothing, locally or remotely (HTTP 404).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Resource { status: 404, .. }
        )
    }

    /// Map to the HTTP envelope; `context` becomes the envelope's `error` field.
    pub fn into_app_error(self, context: &str) -> AppError {
        match self {
            Error::Validation(msg) => AppError::bad_request(msg),
            other => AppError::upstream(context, other),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Network(TIMEOUT_MESSAGE.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_404_counts_as_not_found() {
        let err = Error::Resource {
            status: 404,
            body: "missing".to_string(),
        };
        assert!(err.is_not_found());
        assert!(Error::NotFound("Workspace with identifier ws_9 not found".into()).is_not_found());
        assert!(!Error::Resource {
            status: 500,
            body: String::new()
        }
        .is_not_found());
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let app = Error::Validation("Workspace identifier is required".into())
            .into_app_error("Failed to submit clinical report");
        assert!(matches!(app, AppError::BadRequest(_)));

        let app = Error::NotConnected.into_app_error("Failed to send message");
        assert!(matches!(app, AppError::Upstream { .. }));
    }

    #[test]
    fn timeout_message_is_distinguished() {
        assert_eq!(AuthError::TimedOut.to_string(), TIMEOUT_MESSAGE);
    }
}
