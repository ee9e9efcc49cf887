//! Library entry point wiring configuration, persistence, storage and transports

use crate::changeset::{ChangeSetConfig, Collaborators, PendingContent};
use crate::config::{Config, SyncMode};
use crate::db::{Database, Repository};
use crate::download::{SchemeTransport, Transport};
use crate::error::{Error, Result};
use crate::storage::ArtifactStore;
use crate::types::Event;
use crate::version::{CompletedVersion, PendingVersion};
use futures::stream::Stream;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 1000;

/// Synchronizes local repositories with remote sources
///
/// Every run builds a new repository version from a stream of wanted content.
/// Events of all runs are published on one broadcast channel.
pub struct Syncer {
    config: Arc<Config>,
    collaborators: Collaborators,
    shutdown: CancellationToken,
}

impl Syncer {
    /// Validate `config`, create the storage directories and open the database
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        for dir in [
            &config.persistence.storage_dir,
            &config.persistence.working_dir,
        ] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory '{}': {}", dir.display(), e),
                ))
            })?;
        }

        let db = Database::new(&config.persistence.database_path).await?;
        let store = ArtifactStore::new(&config.persistence.storage_dir);
        let transport = Arc::new(SchemeTransport::with_defaults(config.transport.clone()));
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);

        info!(
            database = %config.persistence.database_path.display(),
            storage = %config.persistence.storage_dir.display(),
            "syncer ready"
        );

        Ok(Self {
            collaborators: Collaborators::new(Arc::new(db), store, transport).with_events(events),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        })
    }

    /// Download through `transport` instead of the scheme-routed default
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.collaborators.transport = transport;
        self
    }

    /// Subscribe to events of every run
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.collaborators.subscribe()
    }

    /// The configuration in use
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The database
    pub fn database(&self) -> &Database {
        &self.collaborators.db
    }

    /// The artifact store
    pub fn store(&self) -> &ArtifactStore {
        &self.collaborators.store
    }

    /// Get or create the repository called `name`
    pub async fn repository(&self, name: &str) -> Result<Repository> {
        let saved = self.collaborators.db.ensure_repository(name).await?;
        if saved.was_created() {
            info!(repository = name, "created repository");
        }
        Ok(saved.into_inner())
    }

    /// Sync `repository` from `remote` in the configured mode
    pub async fn sync<S>(&self, repository: &str, remote: &str, wanted: S) -> Result<CompletedVersion>
    where
        S: Stream<Item = Result<PendingContent>> + Send + 'static,
    {
        self.sync_with_mode(repository, remote, self.config.sync.mode, wanted)
            .await
    }

    /// Sync `repository` from `remote`, overriding the configured mode
    pub async fn sync_with_mode<S>(
        &self,
        repository: &str,
        remote: &str,
        mode: SyncMode,
        wanted: S,
    ) -> Result<CompletedVersion>
    where
        S: Stream<Item = Result<PendingContent>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let repository = self.repository(repository).await?;
        PendingVersion::new(
            self.collaborators.clone(),
            repository.id,
            remote,
            mode,
            wanted,
        )
        .with_config(ChangeSetConfig::from_config(&self.config, remote))
        .with_shutdown(&self.shutdown)
        .apply()
        .await
    }

    /// Stop every run in progress and refuse new ones
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("shutting down syncer");
            self.shutdown.cancel();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("config", &self.config)
            .field("collaborators", &self.collaborators)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}
