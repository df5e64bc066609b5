//! Persistence of the long-lived GitHub token
//!
//! The token is stored as plain text in a single file, by default
//! `<local data dir>/copilot-api-proxy/github_token`. Writes go through a
//! temp file and rename so a crash never leaves a truncated token behind.

use std::path::{Path, PathBuf};

use common::Secret;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::constants::{DATA_DIR_NAME, TOKEN_FILE_NAME};
use crate::error::{Error, Result};

/// Location of the persisted GitHub token.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default token location under the platform's local data directory
    /// (`~/.local/share` on Linux). `None` if no home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join(DATA_DIR_NAME).join(TOKEN_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token.
    ///
    /// A missing file or one holding only whitespace is `Ok(None)`: there is
    /// nothing to use yet and the caller should run the device flow.
    pub async fn load(&self) -> Result<Option<Secret<String>>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let token = Secret::from_trimmed(&contents);
                if token.is_some() {
                    debug!(path = %self.path.display(), "loaded stored GitHub token");
                }
                Ok(token)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(format!(
                "reading token file {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Persist `token`, replacing any previous one.
    ///
    /// Creates the parent directory if needed. The file is owner read/write
    /// only (0600) on unix.
    pub async fn save(&self, token: &Secret<String>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;

        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;
        }

        write_atomic(&self.path, dir, token.expose().as_bytes()).await?;
        info!(path = %self.path.display(), "saved GitHub token");
        Ok(())
    }
}

async fn write_atomic(path: &Path, dir: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = dir.join(format!(".{TOKEN_FILE_NAME}.tmp.{}", std::process::id()));

    // Left over from an interrupted save; it would make create_new fail
    let _ = tokio::fs::remove_file(&tmp_path).await;

    let result = match write_private(&tmp_path, contents).await {
        Ok(()) => tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| Error::Io(format!("renaming temp token file: {e}"))),
        Err(e) => Err(e),
    };

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

/// Create `path` owner read/write only (0600 on unix) and write `contents`.
async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| Error::Io(format!("creating temp token file: {e}")))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp token file: {e}")))
}
