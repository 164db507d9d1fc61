//! Persistent mirror of the in-memory session.
//!
//! The [`CredentialStore`](crate::auth::CredentialStore) is the source of
//! truth. A mirror only keeps a copy so a restarted process can pick the
//! session up again without a refresh round-trip.
//!
//! - [`FileTokenMirror`] - JSON file with 0600 permissions
//! - [`MemoryTokenMirror`] - In-memory (testing)

mod file;
mod memory;

use async_trait::async_trait;

pub use file::FileTokenMirror;
pub use memory::MemoryTokenMirror;

use crate::auth::session::Session;
use crate::error::Result;

/// Trait for session mirror backends.
#[async_trait]
pub trait TokenMirror: Send + Sync {
    /// Load the mirrored session, if any.
    async fn load(&self) -> Result<Option<Session>>;

    /// Replace the mirrored session.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Remove the mirrored session. Removing nothing is not an error.
    async fn remove(&self) -> Result<()>;

    /// Name of this mirror backend.
    fn name(&self) -> &str {
        "unknown"
    }
}

/// Blanket impl for `Arc<T>`.
#[async_trait]
impl<T: TokenMirror + ?Sized> TokenMirror for std::sync::Arc<T> {
    async fn load(&self) -> Result<Option<Session>> {
        (**self).load().await
    }
    async fn save(&self, session: &Session) -> Result<()> {
        (**self).save(session).await
    }
    async fn remove(&self) -> Result<()> {
        (**self).remove().await
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}
