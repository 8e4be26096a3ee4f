//! Lifecycle of one streaming-avatar conversation.
//!
//! ```text
//! Idle -> TokenRequested -> SessionStarting -> StreamConnected <-> Talking/Listening
//!   \___________________________\______________________\___________________-> Closed
//! ```
//!
//! Observers read the phase through a `watch` channel and receive
//! [`SessionEvent`]s through a `broadcast` channel. Closing drops the event
//! sender, so subscribers see the channel end after the final `Closed` event.
//! A [`SessionHandle`] gives the same view without borrowing the
//! bootstrapper, and can cancel a start that is still in flight.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use service_core::retry::{retry_with, RetryConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::StreamingSettings;
use crate::error::{Error, SessionError};
use crate::services::streaming::{NewSessionRequest, StreamingClient, StreamingSession};

const EVENT_CAPACITY: usize = 64;

type RealtimeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The single event sender, shared with handles and the reader task. Taking
/// it out ends every subscription.
type EventSlot = Arc<Mutex<Option<broadcast::Sender<SessionEvent>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    TokenRequested,
    SessionStarting,
    StreamConnected,
    Talking,
    Listening,
    Closed,
}

impl SessionPhase {
    /// Stream is up; messages may be sent.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionPhase::StreamConnected | SessionPhase::Talking | SessionPhase::Listening
        )
    }
}

/// Where the presentation layer attaches the avatar's media stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaHandle {
    pub url: String,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StreamReady(MediaHandle),
    StartedTalking,
    StoppedTalking,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub request: NewSessionRequest,
    pub retry: RetryConfig,
    pub concurrency_limit_code: i64,
}

impl SessionConfig {
    pub fn from_settings(settings: &StreamingSettings) -> Self {
        Self {
            request: NewSessionRequest::from(&settings.avatar),
            retry: RetryConfig::fixed(
                settings.max_start_attempts,
                Duration::from_millis(settings.retry_backoff_millis),
            ),
            concurrency_limit_code: settings.concurrency_limit_code,
        }
    }
}

fn lock_slot(slot: &EventSlot) -> MutexGuard<'_, Option<broadcast::Sender<SessionEvent>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish(slot: &EventSlot, event: SessionEvent) {
    if let Some(tx) = lock_slot(slot).as_ref() {
        // No subscribers is fine.
        let _ = tx.send(event);
    }
}

fn subscribe_to(slot: &EventSlot) -> broadcast::Receiver<SessionEvent> {
    match lock_slot(slot).as_ref() {
        Some(tx) => tx.subscribe(),
        None => broadcast::channel(1).1,
    }
}

/// Read-only view of a bootstrapper plus the ability to abort it.
#[derive(Clone)]
pub struct SessionHandle {
    phase: watch::Receiver<SessionPhase>,
    events: EventSlot,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        subscribe_to(&self.events)
    }

    /// Abort an in-flight `start` and stop the realtime reader. The owner
    /// still calls `close` to release the remote session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct SessionBootstrapper {
    api: Arc<StreamingClient>,
    config: SessionConfig,
    phase: Arc<watch::Sender<SessionPhase>>,
    events: EventSlot,
    speaking: Arc<AtomicBool>,
    token: Option<String>,
    session: Option<StreamingSession>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl SessionBootstrapper {
    pub fn new(api: Arc<StreamingClient>, config: SessionConfig) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            api,
            config,
            phase: Arc::new(phase),
            events: Arc::new(Mutex::new(Some(events))),
            speaking: Arc::new(AtomicBool::new(false)),
            token: None,
            session: None,
            cancel: CancellationToken::new(),
            reader: None,
            closed: false,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            phase: self.phase.subscribe(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// A receiver for future events. After close the receiver is already ended.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        subscribe_to(&self.events)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> Option<&StreamingSession> {
        self.session.as_ref()
    }

    fn set_phase(&self, next: SessionPhase) {
        tracing::debug!(phase = ?next, "Streaming session phase");
        self.phase.send_replace(next);
    }

    /// Drive the session from `Idle` to `StreamConnected`. On failure or
    /// cancellation the session is torn down and ends `Closed`.
    pub async fn start(&mut self) -> Result<MediaHandle, Error> {
        if self.closed || self.phase() != SessionPhase::Idle {
            return Err(SessionError::AlreadyStarted.into());
        }

        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.bootstrap() => result,
        };

        match outcome {
            Ok(media) => {
                metrics::counter!("streaming_session_starts_total", "outcome" => "success")
                    .increment(1);
                Ok(media)
            }
            Err(e) => {
                metrics::counter!("streaming_session_starts_total", "outcome" => "failure")
                    .increment(1);
                tracing::error!(error = %e, "Failed to start avatar session");
                if let Err(close_err) = self.close().await {
                    tracing::warn!(error = %close_err, "Cleanup after failed start also failed");
                }
                Err(e.into())
            }
        }
    }

    async fn bootstrap(&mut self) -> Result<MediaHandle, SessionError> {
        self.set_phase(SessionPhase::TokenRequested);
        let token = self.api.create_token().await?;
        self.token = Some(token.clone());

        self.set_phase(SessionPhase::SessionStarting);
        let session = self.open_session(&token).await?;
        tracing::info!(session_id = %session.session_id, "Avatar session created");
        self.session = Some(session.clone());

        self.api.start_session(&token, &session.session_id).await?;

        let (stream, _) = connect_async(session.realtime_endpoint.as_str())
            .await
            .map_err(|e| SessionError::Realtime(e.to_string()))?;

        let media = MediaHandle {
            url: session.url.clone(),
            access_token: session.access_token.clone(),
        };

        self.set_phase(SessionPhase::StreamConnected);
        publish(&self.events, SessionEvent::StreamReady(media.clone()));
        self.spawn_reader(stream);

        Ok(media)
    }

    /// `streaming.new`, retrying only on the provider's concurrency-limit code.
    async fn open_session(&self, token: &str) -> Result<StreamingSession, SessionError> {
        let api = &self.api;
        let request = &self.config.request;
        let limit_code = self.config.concurrency_limit_code;

        retry_with(
            &self.config.retry,
            "streaming.new",
            |e: &SessionError| is_concurrency_limit(e, limit_code),
            || api.new_session(token, request),
        )
        .await
        .map_err(|e| {
            if is_concurrency_limit(&e, limit_code) {
                SessionError::ConcurrencyLimit {
                    attempts: self.config.retry.max_attempts(),
                }
            } else {
                e
            }
        })
    }

    fn spawn_reader(&mut self, stream: RealtimeStream) {
        let events = self.events.clone();
        let phase = self.phase.clone();
        let speaking = self.speaking.clone();
        let cancel = self.cancel.clone();

        self.reader = Some(tokio::spawn(async move {
            let (mut write, mut read) = stream.split();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    message = read.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            let Some(event) = parse_realtime_event(&text) else {
                                continue;
                            };
                            apply_talking_event(&phase, &speaking, &event);
                            publish(&events, event);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::warn!("Realtime socket closed by provider");
                            mark_stream_lost(&phase, &speaking, &events);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Realtime socket error");
                            mark_stream_lost(&phase, &speaking, &events);
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Speak `text` through the avatar. Requires a connected stream.
    pub async fn send_message(&self, text: &str) -> Result<(), Error> {
        if !self.phase().is_connected() {
            return Err(Error::NotConnected);
        }
        if text.trim().is_empty() {
            return Err(Error::Validation("Message text is required".to_string()));
        }

        let (Some(token), Some(session)) = (&self.token, &self.session) else {
            return Err(Error::NotConnected);
        };

        self.api
            .send_task(token, &session.session_id, text)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send message");
                Error::from(e)
            })
    }

    /// Tear everything down. Idempotent; valid from any phase, including
    /// after the provider dropped the realtime socket.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }

        let stopped = match self.session.take() {
            Some(session) => {
                tracing::info!(session_id = %session.session_id, "Stopping avatar session");
                self.api.stop_session(&session.session_id).await
            }
            None => Ok(()),
        };

        self.token = None;
        self.speaking.store(false, Ordering::SeqCst);
        let already_announced = self.phase() == SessionPhase::Closed;
        self.set_phase(SessionPhase::Closed);

        let sender = lock_slot(&self.events).take();
        if let Some(tx) = sender {
            if !already_announced {
                let _ = tx.send(SessionEvent::Closed);
            }
        }

        stopped.map_err(Error::from)
    }
}

impl Drop for SessionBootstrapper {
    fn drop(&mut self) {
        self.cancel.cancel();

        if self.closed {
            return;
        }
        // Dropped without close: release the remote session in the background.
        let Some(session) = self.session.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let api = self.api.clone();
            runtime.spawn(async move {
                if let Err(e) = api.stop_session(&session.session_id).await {
                    tracing::warn!(session_id = %session.session_id, error = %e, "Failed to stop dropped session");
                }
            });
        } else {
            tracing::warn!(session_id = %session.session_id, "Avatar session dropped without close");
        }
    }
}

/// The provider ended the realtime socket: the session is unusable.
fn mark_stream_lost(
    phase: &watch::Sender<SessionPhase>,
    speaking: &AtomicBool,
    events: &EventSlot,
) {
    speaking.store(false, Ordering::SeqCst);
    let changed = phase.send_if_modified(|current| {
        if *current != SessionPhase::Closed {
            *current = SessionPhase::Closed;
            true
        } else {
            false
        }
    });
    if changed {
        publish(events, SessionEvent::Closed);
    }
}

fn is_concurrency_limit(err: &SessionError, limit_code: i64) -> bool {
    matches!(err, SessionError::Provider { code, .. } if *code == limit_code)
}

fn apply_talking_event(
    phase: &watch::Sender<SessionPhase>,
    speaking: &AtomicBool,
    event: &SessionEvent,
) {
    let (next, is_speaking) = match event {
        SessionEvent::StartedTalking => (SessionPhase::Talking, true),
        SessionEvent::StoppedTalking => (SessionPhase::Listening, false),
        _ => return,
    };

    speaking.store(is_speaking, Ordering::SeqCst);
    phase.send_if_modified(|current| {
        if current.is_connected() && *current != next {
            *current = next;
            true
        } else {
            false
        }
    });
}

/// Map a realtime socket frame to an event; unknown frame types are ignored.
pub fn parse_realtime_event(text: &str) -> Option<SessionEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring non-JSON realtime frame");
            return None;
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("avatar_start_talking") => Some(SessionEvent::StartedTalking),
        Some("avatar_stop_talking") => Some(SessionEvent::StoppedTalking),
        other => {
            tracing::trace!(kind = ?other, "Unhandled realtime frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn bootstrapper() -> SessionBootstrapper {
        let api = Arc::new(
            StreamingClient::new("http://127.0.0.1:9".to_string(), Secret::new("key".to_string()))
                .unwrap(),
        );
        let config = SessionConfig::from_settings(&StreamingSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            avatar: Default::default(),
            max_start_attempts: 3,
            retry_backoff_millis: 5_000,
            concurrency_limit_code: 10004,
        });
        SessionBootstrapper::new(api, config)
    }

    #[test]
    fn parses_talking_frames() {
        assert_eq!(
            parse_realtime_event(r#"{"type":"avatar_start_talking","task_id":"t1"}"#),
            Some(SessionEvent::StartedTalking)
        );
        assert_eq!(
            parse_realtime_event(r#"{"type":"avatar_stop_talking"}"#),
            Some(SessionEvent::StoppedTalking)
        );
        assert_eq!(parse_realtime_event(r#"{"type":"user_start"}"#), None);
        assert_eq!(parse_realtime_event("not json"), None);
    }

    #[test]
    fn talking_events_only_move_connected_phases() {
        let (phase, _) = watch::channel(SessionPhase::StreamConnected);
        let speaking = AtomicBool::new(false);

        apply_talking_event(&phase, &speaking, &SessionEvent::StartedTalking);
        assert_eq!(*phase.borrow(), SessionPhase::Talking);
        assert!(speaking.load(Ordering::SeqCst));

        apply_talking_event(&phase, &speaking, &SessionEvent::StoppedTalking);
        assert_eq!(*phase.borrow(), SessionPhase::Listening);
        assert!(!speaking.load(Ordering::SeqCst));

        phase.send_replace(SessionPhase::Closed);
        apply_talking_event(&phase, &speaking, &SessionEvent::StartedTalking);
        assert_eq!(*phase.borrow(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn lost_stream_is_terminal_and_announced_once() {
        let (phase, _) = watch::channel(SessionPhase::Talking);
        let speaking = AtomicBool::new(true);
        let (tx, mut events) = broadcast::channel(4);
        let slot: EventSlot = Arc::new(Mutex::new(Some(tx)));

        mark_stream_lost(&phase, &speaking, &slot);
        mark_stream_lost(&phase, &speaking, &slot);

        assert_eq!(*phase.borrow(), SessionPhase::Closed);
        assert!(!speaking.load(Ordering::SeqCst));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn handle_cancel_before_start_ends_closed() {
        let mut session = bootstrapper();
        let handle = session.handle();
        let mut events = handle.subscribe();

        handle.cancel();
        assert!(matches!(
            session.start().await,
            Err(Error::Session(SessionError::Cancelled))
        ));
        assert_eq!(handle.phase(), SessionPhase::Closed);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed);
    }

    #[test]
    fn config_uses_three_attempts_with_fixed_backoff() {
        let session = bootstrapper();
        let retry = &session.config.retry;
        assert_eq!(retry.max_attempts(), 3);
        assert_eq!(retry.initial_backoff, Duration::from_secs(5));
        assert_eq!(retry.backoff_multiplier, 1.0);
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let session = bootstrapper();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(matches!(
            session.send_message("hello").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn close_from_idle_is_terminal_and_ends_events() {
        let mut session = bootstrapper();
        let mut events = session.subscribe();

        session.close().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed);
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        // a late subscriber gets an already-ended channel
        assert!(matches!(
            session.subscribe().recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            session.send_message("hello").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.start().await,
            Err(Error::Session(SessionError::AlreadyStarted))
        ));
    }
}
