//! Triage conversation routes. At most one avatar session is active per
//! gateway; starting a new one closes the previous one.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::streaming::streaming_client;
use crate::error::Error;
use crate::models::{SessionState, TriageMode};
use crate::services::SessionBootstrapper;
use crate::{ActiveSession, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct StartTriageRequest {
    #[serde(default)]
    pub mode: Option<TriageMode>,
}

pub async fn start_session(
    State(state): State<AppState>,
    payload: Option<Json<StartTriageRequest>>,
) -> Result<Json<Value>, AppError> {
    let mode = payload
        .and_then(|Json(request)| request.mode)
        .unwrap_or_default();

    if mode == TriageMode::Text {
        close_previous(state.replace_active(None).await).await;
        state
            .session_store
            .save(&SessionState {
                session_id: None,
                mode,
            })
            .await?;
        tracing::info!("Triage started in text mode");
        return Ok(Json(json!({
            "success": true,
            "mode": mode,
            "sessionId": null,
            "media": null
        })));
    }

    let api = streaming_client(&state).map_err(|e| e.into_app_error("Failed to start session"))?;
    let active = ActiveSession::new(SessionBootstrapper::new(api, state.session_config.clone()));
    close_previous(state.replace_active(Some(active.clone())).await).await;

    // Only this session's own lock is held while starting, so state reads
    // and a concurrent stop or restart can reach the handle.
    let mut session = active.session.lock().await;
    let media = match session.start().await {
        Ok(media) => media,
        Err(e) => {
            drop(session);
            state.release_active(&active).await;
            return Err(e.into_app_error("Failed to start session"));
        }
    };

    let session_id = session.session().map(|s| s.session_id.clone());
    let saved = state
        .session_store
        .save(&SessionState {
            session_id: session_id.clone(),
            mode,
        })
        .await;
    if let Err(e) = saved {
        tracing::error!(error = %e, "Failed to persist session state");
        if let Err(close_err) = session.close().await {
            tracing::warn!(error = %close_err, "Failed to close unsaved session");
        }
        drop(session);
        state.release_active(&active).await;
        return Err(e.into());
    }

    Ok(Json(json!({
        "success": true,
        "mode": mode,
        "sessionId": session_id,
        "media": media
    })))
}

async fn close_previous(previous: Option<ActiveSession>) {
    if let Some(previous) = previous {
        if let Err(e) = previous.close().await {
            tracing::warn!(error = %e, "Failed to close previous session");
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub text: String,
}

pub async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<MessageRequest>,
) -> Result<Json<Value>, AppError> {
    let active = state
        .active()
        .await
        .filter(|active| active.handle.phase().is_connected())
        .ok_or_else(|| Error::NotConnected.into_app_error("Failed to send message"))?;

    active
        .session
        .lock()
        .await
        .send_message(&payload.text)
        .await
        .map_err(|e| e.into_app_error("Failed to send message"))?;

    Ok(Json(json!({ "success": true })))
}

pub async fn end_session(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let closed = match state.replace_active(None).await {
        Some(session) => session.close().await,
        None => Ok(()),
    };
    state.session_store.clear().await?;

    closed.map_err(|e| e.into_app_error("Failed to close session"))?;
    Ok(Json(json!({ "success": true })))
}

pub async fn get_state(State(state): State<AppState>) -> Json<Value> {
    let saved = state.session_store.load().await;
    let phase = state.active().await.map(|active| active.handle.phase());

    Json(json!({ "success": true, "state": saved, "phase": phase }))
}

/// Server-sent stream of the active session's events. Ends after `closed`.
pub async fn events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let receiver = state
        .active()
        .await
        .map(|active| active.handle.subscribe())
        .ok_or_else(|| Error::NotConnected.into_app_error("No active session"))?;

    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => Event::default().json_data(&event).ok().map(Ok::<_, Infallible>),
        Err(e) => {
            tracing::warn!(error = %e, "Session event subscriber lagged");
            None
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
