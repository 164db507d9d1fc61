//! In-memory credential store.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::store::TokenMirror;
use crate::error::Result;

/// The signed-in admin, as reported by the server or decoded from the token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, alias = "_id", deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl User {
    /// True when no identifying field is present.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.email.is_none()
    }
}

/// Accepts `"42"`, `42` or `null` for identifier fields.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Current access token plus the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub user: Option<User>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, user: Option<User>) -> Self {
        Self {
            access_token: access_token.into(),
            user,
        }
    }
}

/// Session lifecycle as seen by the console.
///
/// `Authenticating` and `Refreshing` are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

struct StoreInner {
    session: RwLock<Option<Session>>,
    state: RwLock<SessionState>,
    mirror: Option<Arc<dyn TokenMirror>>,
}

/// Holds the one current session.
///
/// Cloning is cheap; clones share the session. Replacement is atomic: readers
/// see either the old session or the new one, never a mix.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    /// Create an empty, memory-only store.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty store that mirrors the session to `mirror`.
    pub fn with_mirror(mirror: Arc<dyn TokenMirror>) -> Self {
        Self::build(Some(mirror))
    }

    fn build(mirror: Option<Arc<dyn TokenMirror>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                session: RwLock::new(None),
                state: RwLock::new(SessionState::Anonymous),
                mirror,
            }),
        }
    }

    /// Snapshot of the current session.
    pub async fn get(&self) -> Option<Session> {
        self.inner.session.read().await.clone()
    }

    /// Current access token, if signed in.
    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .filter(|t| !t.is_empty())
    }

    /// Current user, if known.
    pub async fn user(&self) -> Option<User> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.user.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.access_token().await.is_some()
    }

    /// Replace the session and mark the store authenticated.
    pub async fn set(&self, session: Session) {
        if let Some(mirror) = &self.inner.mirror {
            if let Err(e) = mirror.save(&session).await {
                warn!(backend = mirror.name(), error = %e, "Failed to mirror session");
            }
        }
        *self.inner.session.write().await = Some(session);
        self.set_state(SessionState::Authenticated).await;
        debug!("Credential store updated");
    }

    /// Forget the session and mark the store anonymous.
    pub async fn clear(&self) {
        *self.inner.session.write().await = None;
        self.set_state(SessionState::Anonymous).await;
        if let Some(mirror) = &self.inner.mirror {
            if let Err(e) = mirror.remove().await {
                warn!(backend = mirror.name(), error = %e, "Failed to remove mirrored session");
            }
        }
        debug!("Credential store cleared");
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    pub(crate) async fn set_state(&self, state: SessionState) {
        *self.inner.state.write().await = state;
    }

    /// Load a mirrored session into memory. Returns whether one was found.
    pub async fn restore_from_mirror(&self) -> Result<bool> {
        let Some(mirror) = &self.inner.mirror else {
            return Ok(false);
        };
        match mirror.load().await? {
            Some(session) if !session.access_token.is_empty() => {
                info!(backend = mirror.name(), "Restored session from mirror");
                *self.inner.session.write().await = Some(session);
                self.set_state(SessionState::Authenticated).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_mirror", &self.inner.mirror.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenMirror;

    #[tokio::test]
    async fn test_set_get_clear() {
        let store = CredentialStore::new();
        assert!(store.get().await.is_none());
        assert_eq!(store.state().await, SessionState::Anonymous);

        let user = User {
            name: Some("A".into()),
            ..User::default()
        };
        store.set(Session::new("tok-1", Some(user.clone()))).await;

        assert_eq!(store.access_token().await.as_deref(), Some("tok-1"));
        assert_eq!(store.user().await, Some(user));
        assert_eq!(store.state().await, SessionState::Authenticated);

        store.clear().await;
        assert!(store.access_token().await.is_none());
        assert_eq!(store.state().await, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_empty_token_is_not_authenticated() {
        let store = CredentialStore::new();
        store.set(Session::new("", None)).await;
        assert!(!store.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_clones_share_session() {
        let store = CredentialStore::new();
        let clone = store.clone();
        clone.set(Session::new("shared", None)).await;
        assert_eq!(store.access_token().await.as_deref(), Some("shared"));
    }

    #[tokio::test]
    async fn test_mirror_follows_set_and_clear() {
        let mirror = Arc::new(MemoryTokenMirror::new());
        let store = CredentialStore::with_mirror(mirror.clone());

        store.set(Session::new("tok-1", None)).await;
        assert_eq!(mirror.load().await.unwrap().unwrap().access_token, "tok-1");

        let restored = CredentialStore::with_mirror(mirror.clone());
        assert!(restored.restore_from_mirror().await.unwrap());
        assert_eq!(restored.access_token().await.as_deref(), Some("tok-1"));

        store.clear().await;
        assert!(mirror.load().await.unwrap().is_none());
    }

    #[test]
    fn test_user_accepts_numeric_id() {
        let user: User =
            serde_json::from_str(r#"{"id": 42, "name": "A", "email": "a@b.com"}"#).unwrap();
        assert_eq!(user.id.as_deref(), Some("42"));

        let user: User = serde_json::from_str(r#"{"_id": "abc"}"#).unwrap();
        assert_eq!(user.id.as_deref(), Some("abc"));
        assert!(!user.is_empty());
        assert!(User::default().is_empty());
    }
}
