//! Content-addressed artifact storage
//!
//! Committed artifacts live under `<root>/artifact/<sha256[..2]>/<sha256[2..]>`.
//! Importing a file whose digest is already stored discards the new copy.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filesystem store keyed by SHA-256
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an artifact relative to the root
    pub fn relative_path(sha256: &str) -> Result<PathBuf> {
        if sha256.len() < 3 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Other(format!("invalid sha256 digest '{}'", sha256)));
        }
        let digest = sha256.to_ascii_lowercase();
        Ok(PathBuf::from("artifact")
            .join(&digest[..2])
            .join(&digest[2..]))
    }

    /// Absolute location of an artifact
    pub fn path_for(&self, sha256: &str) -> Result<PathBuf> {
        Ok(self.root.join(Self::relative_path(sha256)?))
    }

    /// Whether an artifact with this digest is stored
    pub async fn contains(&self, sha256: &str) -> bool {
        match self.path_for(sha256) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Move `source` into the store, returning the stored path relative to the root
    ///
    /// Falls back to copy-and-delete when `source` is on another filesystem.
    pub async fn import(&self, source: &Path, sha256: &str) -> Result<PathBuf> {
        let relative = Self::relative_path(sha256)?;
        let destination = self.root.join(&relative);

        if tokio::fs::try_exists(&destination).await? {
            debug!(sha256, "artifact already stored, discarding duplicate");
            if source != destination {
                remove_if_exists(source).await?;
            }
            return Ok(relative);
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::rename(source, &destination).await.is_err() {
            tokio::fs::copy(source, &destination).await?;
            remove_if_exists(source).await?;
        }

        debug!(sha256, path = %destination.display(), "artifact stored");
        Ok(relative)
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
