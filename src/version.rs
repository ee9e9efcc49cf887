//! Building a new repository version from a stream of wanted content
//!
//! [`PendingVersion`] creates version N+1 of a repository (seeded with the
//! content of the latest complete version), applies a [`ChangeSet`] to it and
//! marks it complete. A run-level failure deletes the half-built version.
//!
//! In [`SyncMode::Mirror`] the removal set is computed online: the keys of the
//! new version are snapshotted up front, every wanted item observed on the
//! stream strikes its key, and whatever is left once the stream is exhausted
//! is removed. The wanted stream is iterated exactly once.

use crate::changeset::{Additions, ChangeSet, ChangeSetConfig, Collaborators, PendingContent, Removals};
use crate::config::SyncMode;
use crate::db::RepositoryVersion;
use crate::error::{DatabaseError, Error, Result};
use crate::types::{Event, NaturalKey, RepositoryId, SyncSummary, VersionId};
use futures::stream::{self, Stream, StreamExt};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A completed sync run
#[derive(Debug, Clone)]
pub struct CompletedVersion {
    /// The new, complete version
    pub version: RepositoryVersion,
    /// What the run changed
    pub summary: SyncSummary,
}

/// One sync run producing a new repository version
pub struct PendingVersion {
    collaborators: Collaborators,
    repository: RepositoryId,
    mode: SyncMode,
    wanted: Additions,
    config: ChangeSetConfig,
    shutdown: Option<CancellationToken>,
}

impl PendingVersion {
    /// Sync `repository` from `remote` with the given wanted content
    pub fn new<S>(
        collaborators: Collaborators,
        repository: RepositoryId,
        remote: impl Into<String>,
        mode: SyncMode,
        wanted: S,
    ) -> Self
    where
        S: Stream<Item = Result<PendingContent>> + Send + 'static,
    {
        Self {
            collaborators,
            repository,
            mode,
            wanted: wanted.boxed(),
            config: ChangeSetConfig {
                remote: remote.into(),
                ..ChangeSetConfig::default()
            },
            shutdown: None,
        }
    }

    /// Use `config` for concurrency, download policy and retries
    ///
    /// The remote given to [`new`](Self::new) is kept.
    pub fn with_config(mut self, config: ChangeSetConfig) -> Self {
        let remote = std::mem::take(&mut self.config.remote);
        self.config = ChangeSetConfig { remote, ..config };
        self
    }

    /// Stop the run when `parent` is cancelled
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = Some(parent.clone());
        self
    }

    /// Run to completion
    ///
    /// Per-item failures are counted in the summary. Any other error deletes
    /// the new version and is returned.
    pub async fn apply(self) -> Result<CompletedVersion> {
        let PendingVersion {
            collaborators,
            repository,
            mode,
            wanted,
            mut config,
            shutdown,
        } = self;
        let db = Arc::clone(&collaborators.db);
        let events = collaborators.clone();

        let version = db.create_version(repository).await?;
        info!(
            repository = repository.0,
            version = version.number,
            %mode,
            remote = %config.remote,
            "sync started"
        );
        events.emit(Event::SyncStarted {
            repository,
            version: version.id,
            mode,
        });

        let working_dir = config.working_dir.join(format!("version-{}", version.id.0));
        config.working_dir = working_dir.clone();

        let result = match reconcile(collaborators, version.id, mode, wanted, config, shutdown).await {
            Ok(summary) => db.complete_version(version.id).await.map(|()| summary),
            Err(e) => Err(e),
        };
        remove_working_dir(&working_dir).await;

        match result {
            Ok(summary) => {
                info!(
                    repository = repository.0,
                    version = version.number,
                    added = summary.added,
                    removed = summary.removed,
                    failed = summary.failed,
                    "sync complete"
                );
                events.emit(Event::SyncComplete {
                    repository,
                    version: version.id,
                    summary,
                });
                let version = db.get_version(version.id).await?.ok_or_else(|| {
                    Error::Database(DatabaseError::NotFound(format!(
                        "version {} vanished after completion",
                        version.id.0
                    )))
                })?;
                Ok(CompletedVersion { version, summary })
            }
            Err(e) => {
                error!(repository = repository.0, version = version.number, error = %e, "sync failed");
                if let Err(cleanup) = db.delete_version(version.id).await {
                    warn!(version = version.id.0, error = %cleanup, "failed to delete incomplete version");
                }
                events.emit(Event::SyncFailed {
                    repository,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for PendingVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingVersion")
            .field("repository", &self.repository)
            .field("mode", &self.mode)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn reconcile(
    collaborators: Collaborators,
    version: VersionId,
    mode: SyncMode,
    wanted: Additions,
    config: ChangeSetConfig,
    shutdown: Option<CancellationToken>,
) -> Result<SyncSummary> {
    let (additions, removals) = match mode {
        SyncMode::Additive => (wanted, stream::empty().boxed()),
        SyncMode::Mirror => {
            let existing = collaborators.db.content_keys_in_version(version).await?;
            mirror(wanted, existing.into_keys().collect())
        }
    };

    let mut change_set = ChangeSet::new(collaborators, version, additions, removals).with_config(config);
    if let Some(parent) = &shutdown {
        change_set = change_set.with_shutdown(parent);
    }
    change_set.apply()?.drain().await
}

/// Strike observed keys from `existing`; the rest become removals
///
/// The removal stream reads the set when first polled, which happens only
/// after the additions are exhausted.
fn mirror(wanted: Additions, existing: BTreeSet<NaturalKey>) -> (Additions, Removals) {
    let remaining = Arc::new(Mutex::new(existing));

    let observed = Arc::clone(&remaining);
    let additions = wanted
        .inspect(move |item| {
            if let Ok(content) = item {
                observed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(content.key());
            }
        })
        .boxed();

    let removals = stream::once(async move {
        let keys = std::mem::take(&mut *remaining.lock().unwrap_or_else(|e| e.into_inner()));
        stream::iter(keys.into_iter().map(Ok))
    })
    .flatten()
    .boxed();

    (additions, removals)
}

async fn remove_working_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove working directory");
    }
}
