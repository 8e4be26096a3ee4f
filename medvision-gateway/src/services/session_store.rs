//! Persistence for the triage session context (session id and mode).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::models::SessionState;

#[async_trait]
pub trait SessionStateStore: Send + Sync {
    /// `None` when nothing was saved or the saved state is unreadable.
    async fn load(&self) -> Option<SessionState>;
    async fn save(&self, state: &SessionState) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// JSON file on local disk.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionStateStore for FileSessionStore {
    async fn load(&self) -> Option<SessionState> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read session state");
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring corrupt session state");
                None
            }
        }
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let raw = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<Option<SessionState>>,
}

#[async_trait]
impl SessionStateStore for MemorySessionStore {
    async fn load(&self) -> Option<SessionState> {
        self.state.lock().await.clone()
    }

    async fn save(&self, state: &SessionState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.lock().await = None;
        Ok(())
    }
}
