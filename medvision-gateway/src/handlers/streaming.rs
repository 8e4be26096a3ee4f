//! Server-side streaming provider calls: token exchange, session listing
//! and stopping sessions by id.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use std::sync::Arc;

use crate::error::{Error, SessionError};
use crate::services::StreamingClient;
use crate::AppState;

pub(crate) fn streaming_client(state: &AppState) -> Result<Arc<StreamingClient>, Error> {
    state
        .streaming
        .clone()
        .ok_or(Error::Session(SessionError::MissingApiKey))
}

pub async fn get_token(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let token = async { Ok::<_, Error>(streaming_client(&state)?.create_token().await?) }
        .await
        .map_err(|e| e.into_app_error("Failed to retrieve access token"))?;

    Ok(Json(json!({ "token": token })))
}

/// Active provider sessions, passed through untouched.
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let sessions = async { Ok::<_, Error>(streaming_client(&state)?.list_sessions().await?) }
        .await
        .map_err(|e| e.into_app_error("Failed to fetch sessions"))?;

    Ok(Json(sessions))
}

#[derive(Debug, Deserialize)]
pub struct CloseSessionRequest {
    pub session_id: Option<String>,
}

pub async fn close_session(
    State(state): State<AppState>,
    Json(payload): Json<CloseSessionRequest>,
) -> Result<Json<Value>, AppError> {
    let session_id = payload
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("Session ID is required"))?;

    async { Ok::<_, Error>(streaming_client(&state)?.stop_session(&session_id).await?) }
        .await
        .map_err(|e| e.into_app_error("Failed to close session"))?;

    tracing::info!(session_id = %session_id, "Streaming session closed");
    Ok(Json(json!({
        "success": true,
        "message": "Session closed successfully"
    })))
}
