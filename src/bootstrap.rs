//! One-shot session restore at startup.

use std::future::Future;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, Session};
use crate::error::Result;

/// Restores a session once, before the first screen needs it.
///
/// A mirrored session is adopted first so the console can render at once,
/// then the refresh cookie is exchanged for a new access token. The mirrored
/// session survives only when the server cannot be reached. Later calls
/// return the first outcome.
#[derive(Debug)]
pub struct SessionBootstrap {
    credentials: CredentialStore,
    outcome: OnceCell<bool>,
}

impl SessionBootstrap {
    pub fn new(credentials: CredentialStore) -> Self {
        Self {
            credentials,
            outcome: OnceCell::new(),
        }
    }

    /// Restore the session using `refresh`. Returns whether one is now held.
    ///
    /// Never fails: an absent or rejected refresh cookie just means the user
    /// starts signed out. `refresh` runs at most once per bootstrap.
    pub async fn restore<F, Fut>(&self, refresh: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session>>,
    {
        *self.outcome.get_or_init(|| self.run(refresh)).await
    }

    /// Whether [`restore`](Self::restore) has completed.
    pub fn is_done(&self) -> bool {
        self.outcome.initialized()
    }

    async fn run<F, Fut>(&self, refresh: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session>>,
    {
        let mirrored = match self.credentials.restore_from_mirror().await {
            Ok(true) => self.credentials.get().await,
            Ok(false) => None,
            Err(e) => {
                warn!(error = %e, "Could not read session mirror");
                None
            }
        };

        match refresh().await {
            Ok(_) => {
                info!("Session restored");
                true
            }
            Err(e) if e.is_network() => match mirrored {
                Some(session) => {
                    warn!(error = %e, "Server unreachable; keeping mirrored session");
                    self.credentials.set(session).await;
                    true
                }
                None => {
                    debug!(error = %e, "Server unreachable; no session to restore");
                    false
                }
            },
            Err(e) => {
                debug!(error = %e, "No session to restore");
                false
            }
        }
    }
}
