//! Application startup and lifecycle management.

use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use service_core::observability::extract_request_id;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::error::Error;
use crate::handlers;
use crate::services::{
    FileSessionStore, MeldRxClient, SessionBootstrapper, SessionConfig, SessionHandle,
    SessionStateStore, StreamingClient, TokenBroker,
};

/// The gateway's current avatar session. The handle stays usable while a
/// start in progress holds the bootstrapper's lock.
#[derive(Clone)]
pub struct ActiveSession {
    pub handle: SessionHandle,
    pub session: Arc<Mutex<SessionBootstrapper>>,
}

impl ActiveSession {
    pub fn new(session: SessionBootstrapper) -> Self {
        Self {
            handle: session.handle(),
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub fn same_as(&self, other: &ActiveSession) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }

    /// Abort any start in flight, then release the remote session.
    pub async fn close(&self) -> Result<(), Error> {
        self.handle.cancel();
        self.session.lock().await.close().await
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<TokenBroker>,
    pub meldrx: Arc<MeldRxClient>,
    /// `None` when no streaming API key is configured.
    pub streaming: Option<Arc<StreamingClient>>,
    pub session_config: SessionConfig,
    /// Locked only briefly; never across a session start.
    pub active_session: Arc<Mutex<Option<ActiveSession>>>,
    pub session_store: Arc<dyn SessionStateStore>,
}

impl AppState {
    pub fn from_settings(
        settings: &Settings,
        session_store: Arc<dyn SessionStateStore>,
    ) -> anyhow::Result<Self> {
        let streaming = StreamingClient::from_settings(&settings.streaming)?.map(Arc::new);
        if streaming.is_none() {
            tracing::warn!("Streaming API key not configured - avatar sessions are disabled");
        }

        Ok(Self {
            broker: Arc::new(TokenBroker::new(settings.meldrx.clone())?),
            meldrx: Arc::new(MeldRxClient::new(&settings.meldrx)?),
            streaming,
            session_config: SessionConfig::from_settings(&settings.streaming),
            active_session: Arc::new(Mutex::new(None)),
            session_store,
        })
    }

    /// Install `next` as the active session and hand back the one it replaced.
    pub async fn replace_active(&self, next: Option<ActiveSession>) -> Option<ActiveSession> {
        std::mem::replace(&mut *self.active_session.lock().await, next)
    }

    /// Clear the active slot if it still holds `session`.
    pub async fn release_active(&self, session: &ActiveSession) {
        let mut slot = self.active_session.lock().await;
        if slot.as_ref().is_some_and(|current| current.same_as(session)) {
            *slot = None;
        }
    }

    pub async fn active(&self) -> Option<ActiveSession> {
        self.active_session.lock().await.clone()
    }
}

pub fn build_router(state: AppState, mock_routes: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/api/meldrx/token", get(handlers::meldrx::get_token))
        .route("/api/meldrx/workspaces", get(handlers::meldrx::list_workspaces))
        .route("/api/meldrx/patients", get(handlers::meldrx::list_patients))
        .route("/api/meldrx/patients/:id", get(handlers::meldrx::get_patient))
        .route("/api/meldrx/submit-report", post(handlers::meldrx::submit_report))
        .route("/api/streaming/token", get(handlers::streaming::get_token))
        .route("/api/streaming/sessions", get(handlers::streaming::list_sessions))
        .route(
            "/api/streaming/sessions/close",
            post(handlers::streaming::close_session),
        )
        .route(
            "/api/triage/session",
            post(handlers::triage::start_session).delete(handlers::triage::end_session),
        )
        .route("/api/triage/message", post(handlers::triage::send_message))
        .route("/api/triage/state", get(handlers::triage::get_state))
        .route("/api/triage/events", get(handlers::triage::events));

    if mock_routes {
        router = router
            .route("/api/mock-meldrx/token", get(handlers::mock_meldrx::get_token))
            .route(
                "/api/mock-meldrx/workspaces",
                get(handlers::mock_meldrx::list_workspaces),
            )
            .route(
                "/api/mock-meldrx/patients",
                get(handlers::mock_meldrx::list_patients),
            )
            .route(
                "/api/mock-meldrx/patients/:id",
                get(handlers::mock_meldrx::get_patient),
            )
            .route(
                "/api/mock-meldrx/submit-report",
                post(handlers::mock_meldrx::submit_report),
            );
    }

    router
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id =
                    extract_request_id(request.headers()).unwrap_or_else(|| "-".to_string());

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
}

impl Application {
    pub async fn build(settings: Settings) -> anyhow::Result<Self> {
        let store: Arc<dyn SessionStateStore> =
            Arc::new(FileSessionStore::new(settings.session_store.path.clone()));
        let state = AppState::from_settings(&settings, store)?;
        Self::build_with_state(settings, state).await
    }

    /// Build around a prepared state; tests swap in their own stores.
    pub async fn build_with_state(settings: Settings, state: AppState) -> anyhow::Result<Self> {
        let router = build_router(state.clone(), settings.meldrx.mock_routes);

        // port 0 = random port for testing
        let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            e
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Med Vision gateway listening on port {}", port);

        Ok(Self {
            port,
            listener,
            router,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }
}
