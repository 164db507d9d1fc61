//! File-based session mirror with secure permissions.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::TokenMirror;
use crate::auth::session::Session;
use crate::error::{Error, Result};

/// File name used inside the mirror directory.
const SESSION_FILE: &str = "session.json";

/// File-based session mirror using JSON with 0600 permissions.
#[derive(Debug, Clone)]
pub struct FileTokenMirror {
    path: PathBuf,
}

impl FileTokenMirror {
    /// Mirror into `{dir}/session.json`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join(SESSION_FILE),
        }
    }

    /// Path of the mirrored session file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the session atomically with secure permissions.
    ///
    /// On Unix the temp file is created with 0600 so the token is never
    /// readable by other users, then renamed over the target.
    async fn write(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage_io(parent, e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(session)
            .map_err(|e| Error::Storage(format!("Failed to serialize session: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&tmp_path)
            .await
            .map_err(|e| Error::storage_io(&tmp_path, e.to_string()))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Error::storage_io(&tmp_path, e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| Error::storage_io(&tmp_path, e.to_string()))?;
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::storage_io(&self.path, format!("atomic rename: {e}")));
        }

        debug!(path = %self.path.display(), "Session mirrored");
        Ok(())
    }
}

#[async_trait]
impl TokenMirror for FileTokenMirror {
    async fn load(&self) -> Result<Option<Session>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage_io(&self.path, e.to_string())),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let session = serde_json::from_str(&content).map_err(|e| {
            Error::Storage(format!(
                "Failed to parse session file '{}': {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.write(session).await
    }

    async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_io(&self.path, e.to_string())),
        }
    }

    fn name(&self) -> &str {
        "file"
    }
}
