//! Wanted content and the settlement graph built around it

use crate::db::{ContentArtifact, Database, NewArtifact, NewCatalogEntry};
use crate::download::WrittenFile;
use crate::error::{Error, Result};
use crate::storage::ArtifactStore;
use crate::types::{ArtifactId, ContentId, NaturalKey, VersionId};
use crate::validation::{Algorithm, Digests};
use tracing::debug;

/// What is known about one artifact of a pending content item
#[derive(Debug, Default)]
pub enum Resolution {
    /// Waiting on a download
    #[default]
    Unresolved,
    /// Downloaded into the working directory
    Downloaded(WrittenFile),
    /// Matched a stored artifact; nothing to fetch
    Stored(ArtifactId),
    /// Not fetched; recorded in the download catalog
    Deferred,
    /// The download failed permanently
    Failed(Error),
}

/// A file belonging to a wanted content item
#[derive(Debug)]
pub struct PendingArtifact {
    url: String,
    relative_path: String,
    size: Option<u64>,
    digests: Digests,
    resolution: Resolution,
}

impl PendingArtifact {
    /// Artifact fetched from `url` and stored as `relative_path` of its content
    pub fn new(url: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            relative_path: relative_path.into(),
            size: None,
            digests: Digests::new(),
            resolution: Resolution::Unresolved,
        }
    }

    /// Expected size in bytes
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Expected digest (hex); the digest is lowercased
    pub fn with_digest(mut self, algorithm: Algorithm, hex: impl AsRef<str>) -> Self {
        self.digests
            .insert(algorithm, hex.as_ref().to_ascii_lowercase());
        self
    }

    /// Source URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Path within the content item
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Expected size, if declared
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Expected digests
    pub fn digests(&self) -> &Digests {
        &self.digests
    }

    /// Current resolution
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Whether the outcome of this artifact is known
    pub fn is_settled(&self) -> bool {
        !matches!(self.resolution, Resolution::Unresolved)
    }

    /// Resolve without network I/O when possible
    ///
    /// Matches a stored artifact by reliable digest, or, failing that, by the
    /// link an adopted content row already has for this path. Under deferred
    /// download anything unmatched becomes [`Resolution::Deferred`]. Returns
    /// `true` when the artifact still needs to be downloaded.
    pub(crate) async fn resolve(
        &mut self,
        db: &Database,
        deferred: bool,
        links: &[ContentArtifact],
    ) -> Result<bool> {
        if self.digests.keys().any(|alg| alg.is_reliable())
            && let Some(stored) = db.find_stored_artifact(&self.digests).await?
        {
            debug!(url = %self.url, artifact_id = stored.id.0, "artifact already stored");
            self.resolution = Resolution::Stored(stored.id);
            return Ok(false);
        }

        let linked = links
            .iter()
            .find(|link| link.relative_path == self.relative_path)
            .and_then(|link| link.artifact_id);
        if let Some(id) = linked {
            debug!(url = %self.url, artifact_id = id.0, "adopting linked artifact");
            self.resolution = Resolution::Stored(id);
            return Ok(false);
        }

        if deferred {
            self.resolution = Resolution::Deferred;
            return Ok(false);
        }

        Ok(true)
    }

    pub(crate) fn settle(&mut self, resolution: Resolution) {
        self.resolution = resolution;
    }
}

/// A wanted content item: natural key, metadata and files
#[derive(Debug)]
pub struct PendingContent {
    key: NaturalKey,
    metadata: serde_json::Value,
    artifacts: Vec<PendingArtifact>,
    stored: Option<ContentId>,
    error: Option<Error>,
}

impl PendingContent {
    /// Content identified by `key`
    pub fn new(key: NaturalKey, metadata: serde_json::Value) -> Self {
        Self {
            key,
            metadata,
            artifacts: Vec::new(),
            stored: None,
            error: None,
        }
    }

    /// Add a file
    pub fn with_artifact(mut self, artifact: PendingArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Natural key
    pub fn key(&self) -> &NaturalKey {
        &self.key
    }

    /// Metadata committed with the content row
    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }

    /// Files of this item
    pub fn artifacts(&self) -> &[PendingArtifact] {
        &self.artifacts
    }

    /// Id of the stored row this item was matched to
    pub fn stored(&self) -> Option<ContentId> {
        self.stored
    }

    /// Settled once every artifact is settled, or once the item itself failed
    pub fn is_settled(&self) -> bool {
        self.error.is_some() || self.artifacts.iter().all(PendingArtifact::is_settled)
    }

    pub(crate) fn adopt(&mut self, id: ContentId) {
        self.stored = Some(id);
    }

    pub(crate) fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn artifacts_mut(&mut self) -> &mut [PendingArtifact] {
        &mut self.artifacts
    }

    pub(crate) fn artifact_mut(&mut self, index: usize) -> Option<&mut PendingArtifact> {
        self.artifacts.get_mut(index)
    }

    /// The first failure recorded for this item or any of its artifacts
    pub(crate) fn take_error(&mut self) -> Option<Error> {
        if let Some(error) = self.error.take() {
            return Some(error);
        }
        self.artifacts.iter_mut().find_map(|artifact| {
            match std::mem::take(&mut artifact.resolution) {
                Resolution::Failed(error) => Some(error),
                other => {
                    artifact.resolution = other;
                    None
                }
            }
        })
    }

    /// Remove downloaded working files; used when the item is not committed
    pub(crate) async fn discard(&self) {
        for artifact in &self.artifacts {
            if let Resolution::Downloaded(file) = &artifact.resolution
                && let Err(e) = tokio::fs::remove_file(&file.path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %file.path.display(), error = %e, "failed to remove working file");
            }
        }
    }

    /// Commit a settled item into `version` inside one transaction
    ///
    /// The content row and every artifact row are inserted or adopted, each file
    /// is linked and catalogued for `remote`, and the content is associated
    /// with the version. Downloaded files are moved into `store` first; a
    /// failed transaction leaves them there for the next run to adopt.
    pub(crate) async fn save(
        &self,
        db: &Database,
        store: &ArtifactStore,
        version: VersionId,
        remote: &str,
    ) -> Result<ContentId> {
        let mut tx = db.begin().await?;

        let content_id = match self.stored {
            Some(id) => id,
            None => Database::ensure_content(&mut tx, &self.key, &self.metadata)
                .await?
                .id(),
        };

        for artifact in &self.artifacts {
            let artifact_id = match &artifact.resolution {
                Resolution::Downloaded(file) => Some(import(&mut tx, store, file).await?),
                Resolution::Stored(id) => Some(*id),
                Resolution::Deferred => None,
                Resolution::Unresolved | Resolution::Failed(_) => {
                    return Err(Error::Other(format!(
                        "artifact {} of {} is not settled",
                        artifact.relative_path, self.key
                    )));
                }
            };
            Database::link_artifact(&mut tx, content_id, artifact_id, &artifact.relative_path)
                .await?;

            if !artifact.url.is_empty() {
                Database::record_catalog_entry(
                    &mut tx,
                    &NewCatalogEntry {
                        remote: remote.to_string(),
                        content_id,
                        relative_path: artifact.relative_path.clone(),
                        url: artifact.url.clone(),
                        size: artifact.size,
                        digests: artifact.digests.clone(),
                    },
                )
                .await?;
            }
        }

        if !Database::add_to_version(&mut tx, version, content_id).await? {
            debug!(key = %self.key, "content already associated with version");
        }

        tx.commit().await?;
        Ok(content_id)
    }
}

async fn import(
    conn: &mut sqlx::SqliteConnection,
    store: &ArtifactStore,
    file: &WrittenFile,
) -> Result<ArtifactId> {
    let sha256 = file.identity.digest(Algorithm::Sha256).ok_or_else(|| {
        Error::Other(format!(
            "downloaded file {} has no sha256 digest",
            file.path.display()
        ))
    })?;
    let relative = store.import(&file.path, sha256).await?;
    let saved = Database::ensure_artifact(
        conn,
        &NewArtifact {
            identity: file.identity.clone(),
            file: relative.to_string_lossy().into_owned(),
        },
    )
    .await?;
    Ok(saved.id())
}
