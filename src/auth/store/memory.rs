//! In-memory session mirror for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TokenMirror;
use crate::auth::session::Session;
use crate::error::Result;

/// In-memory session mirror, primarily for testing.
#[derive(Default)]
pub struct MemoryTokenMirror {
    session: RwLock<Option<Session>>,
}

impl MemoryTokenMirror {
    /// Create a new empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mirror that already holds `session`.
    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

#[async_trait]
impl TokenMirror for MemoryTokenMirror {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.session.read().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.write().await = Some(session.clone());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        *self.session.write().await = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
