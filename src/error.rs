//! Error types for tollgate.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// The main error type for tollgate.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ───────────────────────────────────────────────────────
    /// Login was rejected or the server answered with something unusable.
    #[error("Authentication failed ({status}): {message}")]
    Authentication {
        /// HTTP status code (0 when the failure was not an HTTP status).
        status: u16,
        /// Server message or parse failure description.
        message: String,
    },

    /// The token refresh behind a queued request failed.
    ///
    /// Every request queued behind the same refresh shares the same source.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[source] Arc<Error>),

    // ── API ──────────────────────────────────────────────────────────────────
    /// API returned a non-success response that the pipeline did not recover.
    #[error("API error {status}: {}", message.as_deref().unwrap_or("<no message>"))]
    Api {
        /// HTTP status code.
        status: u16,
        /// The `message` field of a JSON error body, if present.
        message: Option<String>,
        /// The raw response body.
        body: String,
    },

    /// A request could not be built (bad header, unserializable body).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A queued request was dropped before it could be replayed.
    #[error("Request cancelled before it could be replayed")]
    Cancelled,

    // ── Storage ──────────────────────────────────────────────────────────────
    /// Storage I/O error.
    #[error("Storage I/O error at {path}: {message}")]
    StorageIo {
        /// Path that caused the error.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// Generic storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    // ── Infrastructure ───────────────────────────────────────────────────────
    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL could not be built.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// General I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build an [`Error::Api`] from a status and a raw body, extracting the
    /// JSON `message` field when there is one.
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self::Api {
            status,
            message: crate::pipeline::recovery::body_message(body.as_bytes()),
            body,
        }
    }

    /// HTTP status carried by this error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Authentication { status, .. } if *status != 0 => Some(*status),
            Error::Network(e) => e.status().map(|s| s.as_u16()),
            Error::RefreshFailed(inner) => inner.status(),
            _ => None,
        }
    }

    /// Returns true if this error means the user has to sign in again.
    #[must_use]
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Error::Authentication { .. }
                | Error::RefreshFailed(_)
                | Error::Api { status: 401, .. }
        )
    }

    /// True when the server could not be reached or did not answer.
    #[must_use]
    pub fn is_network(&self) -> bool {
        match self {
            Error::Network(e) => e.status().is_none(),
            Error::RefreshFailed(inner) => inner.is_network(),
            _ => false,
        }
    }

    /// True for an unrecovered access-token expiry response.
    #[must_use]
    pub fn is_token_expired(&self, expiry_message: &str) -> bool {
        matches!(self, Error::Api { status: 401, message: Some(m), .. } if m == expiry_message)
    }

    /// True for an unrecovered CSRF rejection response.
    #[must_use]
    pub fn is_csrf_rejection(&self) -> bool {
        match self {
            Error::Api {
                status, message, ..
            } => crate::pipeline::recovery::is_csrf_rejection(*status, message.as_deref()),
            _ => false,
        }
    }

    /// Creates a storage I/O error.
    #[must_use]
    pub fn storage_io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StorageIo {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, Error>;
