//! Remote repository fixtures served from a local directory over `file://`

use content_sync::validation::ArtifactHasher;
use content_sync::{Algorithm, NaturalKey, PendingArtifact, PendingContent, Result};
use std::path::PathBuf;
use tempfile::TempDir;

/// A directory standing in for a remote repository
pub struct RemoteDir {
    dir: TempDir,
}

impl RemoteDir {
    /// Empty remote
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create remote dir"),
        }
    }

    /// Publish `body` as `name`
    pub fn publish(&self, name: &str, body: &[u8]) {
        std::fs::write(self.path(name), body).expect("Failed to write remote file");
    }

    /// Withdraw a published file
    pub fn withdraw(&self, name: &str) {
        std::fs::remove_file(self.path(name)).expect("Failed to remove remote file");
    }

    /// Local path of `name`
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// `file://` URL of `name`
    pub fn url(&self, name: &str) -> String {
        url::Url::from_file_path(self.path(name))
            .expect("remote path is absolute")
            .to_string()
    }

    /// Wanted content `name` with one artifact declaring the digest of `body`
    pub fn content(&self, name: &str, body: &[u8]) -> PendingContent {
        PendingContent::new(key(name), serde_json::json!({ "name": name })).with_artifact(
            PendingArtifact::new(self.url(name), name)
                .with_size(body.len() as u64)
                .with_digest(Algorithm::Sha256, sha256(body)),
        )
    }

    /// Publish `body` as `name` and return the matching wanted content
    pub fn published(&self, name: &str, body: &[u8]) -> PendingContent {
        self.publish(name, body);
        self.content(name, body)
    }
}

/// Natural key used for file content in tests
pub fn key(name: &str) -> NaturalKey {
    NaturalKey::new("file", [("path", name)])
}

/// Hex SHA-256 of `body`
pub fn sha256(body: &[u8]) -> String {
    let mut hasher = ArtifactHasher::new();
    hasher.update(body);
    hasher
        .finish()
        .digest(Algorithm::Sha256)
        .expect("sha256 is always computed")
        .to_string()
}

/// Wrap wanted content as the `Ok` items of a stream
pub fn wanted(items: Vec<PendingContent>) -> futures::stream::Iter<std::vec::IntoIter<Result<PendingContent>>> {
    futures::stream::iter(items.into_iter().map(Ok).collect::<Vec<_>>())
}
