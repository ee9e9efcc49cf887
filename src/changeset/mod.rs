//! Applying additions and removals to a repository version
//!
//! A [`ChangeSet`] turns a stream of wanted [`PendingContent`] into download
//! tasks and runs them through a [`Batch`]. Each item is committed in its own
//! transaction once every one of its artifacts is settled. Removals follow in
//! fixed-size batches after the additions are exhausted. Every item yields one
//! [`ChangeReport`] from [`Changes::next`]; a failing item never stops the run.

mod pending;
mod report;

pub use pending::{PendingArtifact, PendingContent, Resolution};
pub use report::{ChangeFailed, ChangeReport};

use crate::config::{Config, RetryConfig};
use crate::db::Database;
use crate::download::{Batch, BatchResults, DownloadTask, FileWriter, Plan, Transport};
use crate::error::{Error, Result};
use crate::storage::ArtifactStore;
use crate::types::{ChangeAction, ContentId, Event, NaturalKey, SyncSummary, VersionId};
use crate::validation::validators_for;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wanted content fed to a change set
pub type Additions = BoxStream<'static, Result<PendingContent>>;

/// Natural keys of content to remove from the version
pub type Removals = BoxStream<'static, Result<NaturalKey>>;

/// Capacity of the event channel created by [`Collaborators::new`]
const EVENT_CAPACITY: usize = 1024;

/// Everything a change set talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Persistence
    pub db: Arc<Database>,
    /// Where committed artifacts are stored
    pub store: ArtifactStore,
    /// Transport used for every download
    pub transport: Arc<dyn Transport>,
    /// Event broadcast channel
    pub events: broadcast::Sender<Event>,
}

impl Collaborators {
    /// Bundle collaborators with a fresh event channel
    pub fn new(db: Arc<Database>, store: ArtifactStore, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            store,
            transport,
            events,
        }
    }

    /// Publish on an existing event channel
    pub fn with_events(mut self, events: broadcast::Sender<Event>) -> Self {
        self.events = events;
        self
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Broadcast an event; having no subscribers is fine
    pub(crate) fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("store", &self.store)
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}

/// Per-run settings of a change set
#[derive(Clone, Debug)]
pub struct ChangeSetConfig {
    /// Remote name recorded in the download catalog
    pub remote: String,
    /// Concurrent downloads
    pub concurrency: usize,
    /// Downloads admitted before the feeder blocks
    pub backlog: usize,
    /// Catalog artifacts instead of downloading them
    pub deferred_download: bool,
    /// Items removed per transaction
    pub removal_batch_size: usize,
    /// Retry policy of every download
    pub retry: RetryConfig,
    /// Directory downloads are written to before commit
    pub working_dir: PathBuf,
}

impl Default for ChangeSetConfig {
    fn default() -> Self {
        Self::from_config(&Config::default(), "default")
    }
}

impl ChangeSetConfig {
    /// Settings for `remote` taken from the library configuration
    pub fn from_config(config: &Config, remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            concurrency: config.sync.concurrency,
            backlog: config.sync.backlog,
            deferred_download: config.sync.deferred_download,
            removal_batch_size: config.sync.removal_batch_size,
            retry: config.retry.clone(),
            working_dir: config.persistence.working_dir.clone(),
        }
    }
}

/// Additions and removals to apply to one repository version
pub struct ChangeSet {
    collaborators: Collaborators,
    version: VersionId,
    config: ChangeSetConfig,
    additions: Additions,
    removals: Removals,
    shutdown: Option<CancellationToken>,
}

impl ChangeSet {
    /// Apply `additions` and then `removals` to `version`
    pub fn new<A, R>(collaborators: Collaborators, version: VersionId, additions: A, removals: R) -> Self
    where
        A: Stream<Item = Result<PendingContent>> + Send + 'static,
        R: Stream<Item = Result<NaturalKey>> + Send + 'static,
    {
        Self {
            collaborators,
            version,
            config: ChangeSetConfig::default(),
            additions: additions.boxed(),
            removals: removals.boxed(),
            shutdown: None,
        }
    }

    /// Use `config` instead of the defaults
    pub fn with_config(mut self, config: ChangeSetConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop the run when `parent` is cancelled
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = Some(parent.clone());
        self
    }

    /// Start downloading; the outcome of each item is read from [`Changes`]
    ///
    /// Fails on invalid concurrency, backlog or removal batch size. Must be
    /// called from within a tokio runtime.
    pub fn apply(self) -> Result<Changes> {
        let ChangeSet {
            collaborators,
            version,
            config,
            additions,
            removals,
            shutdown,
        } = self;

        if config.removal_batch_size == 0 {
            return Err(Error::config(
                "removal_batch_size",
                "removal_batch_size must be at least 1",
            ));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let preparer = Arc::new(Preparer {
            db: Arc::clone(&collaborators.db),
            transport: Arc::clone(&collaborators.transport),
            version,
            deferred: config.deferred_download,
            retry: config.retry.clone(),
            working_dir: config.working_dir.clone(),
            pending: Arc::clone(&pending),
        });

        let mut batch = Batch::new(
            download_tasks(additions, preparer),
            config.concurrency,
            config.backlog,
        )?;
        if let Some(parent) = &shutdown {
            batch = batch.with_shutdown(parent);
        }
        let results = batch.download()?;

        debug!(
            version = version.0,
            remote = %config.remote,
            deferred = config.deferred_download,
            "applying change set"
        );

        Ok(Changes {
            collaborators,
            version,
            remote: config.remote,
            batch,
            results,
            pending,
            removals: removals.chunks(config.removal_batch_size).boxed(),
            phase: Phase::Adding,
            ready: VecDeque::new(),
            summary: SyncSummary::default(),
        })
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingContent>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, PendingContent>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Attachment tying a download task back to its content item and artifact
#[derive(Clone, Copy, Debug)]
struct Slot {
    id: u64,
    artifact: Option<usize>,
}

/// Turns wanted content into download tasks on the feeder side of the batch
struct Preparer {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    version: VersionId,
    deferred: bool,
    retry: RetryConfig,
    working_dir: PathBuf,
    pending: PendingMap,
}

impl Preparer {
    /// Register `content` under `id` and return its tasks
    ///
    /// Every registered item gets at least one task so it is settled by the
    /// results it produces. Content already in the version is dropped.
    async fn prepare(&self, id: u64, mut content: PendingContent) -> Vec<DownloadTask> {
        let tasks = match self.plan(id, &mut content).await {
            Ok(Some(tasks)) => tasks,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(key = %content.key(), error = %e, "failed to prepare content");
                content.fail(e);
                Vec::new()
            }
        };

        let tasks = if tasks.is_empty() {
            vec![DownloadTask::placeholder().with_attachment(Slot { id, artifact: None })]
        } else {
            tasks
        };
        lock(&self.pending).insert(id, content);
        tasks
    }

    async fn plan(&self, id: u64, content: &mut PendingContent) -> Result<Option<Vec<DownloadTask>>> {
        let mut links = Vec::new();
        if let Some(existing) = self.db.find_content_by_key(content.key()).await? {
            if self.db.is_in_version(self.version, existing.id).await? {
                debug!(key = %content.key(), "content already in version");
                return Ok(None);
            }
            content.adopt(existing.id);
            links = self.db.content_artifacts(existing.id).await?;
        }

        let mut tasks = Vec::new();
        for (index, artifact) in content.artifacts_mut().iter_mut().enumerate() {
            if artifact.resolve(&self.db, self.deferred, &links).await? {
                tasks.push(self.download_task(id, index, artifact));
            }
        }
        Ok(Some(tasks))
    }

    fn download_task(&self, id: u64, index: usize, artifact: &PendingArtifact) -> DownloadTask {
        let path = self.working_dir.join(format!("{id}-{index}"));
        DownloadTask::new(
            artifact.url(),
            Box::new(FileWriter::new(path)),
            Arc::clone(&self.transport),
        )
        .with_validators(validators_for(artifact.size(), artifact.digests()))
        .with_retry(self.retry.clone())
        .with_attachment(Slot {
            id,
            artifact: Some(index),
        })
    }
}

/// Lazily prepare each wanted item as the batch feeder pulls on the stream
fn download_tasks(
    additions: Additions,
    preparer: Arc<Preparer>,
) -> impl Stream<Item = Result<DownloadTask>> + Send + 'static {
    let mut next_id = 0u64;
    additions
        .then(move |item| {
            let preparer = Arc::clone(&preparer);
            let id = next_id;
            next_id += 1;
            async move {
                match item {
                    Ok(content) => Ok(preparer.prepare(id, content).await),
                    Err(e) => Err(e),
                }
            }
        })
        .flat_map(|prepared| {
            let items: Vec<Result<DownloadTask>> = match prepared {
                Ok(tasks) => tasks.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Adding,
    Removing,
    Done,
}

/// Lazy, single-pass sequence of [`ChangeReport`]s of an applied change set
pub struct Changes {
    collaborators: Collaborators,
    version: VersionId,
    remote: String,
    batch: Batch,
    results: BatchResults,
    pending: PendingMap,
    removals: BoxStream<'static, Vec<Result<NaturalKey>>>,
    phase: Phase,
    ready: VecDeque<ChangeReport>,
    summary: SyncSummary,
}

impl Changes {
    /// The next report; `None` once every addition and removal was reported
    ///
    /// Per-item failures are reported, not returned. An error means the run
    /// itself cannot continue: the additions stream failed, a removal key could
    /// not be produced, or the run was shut down before all additions finished.
    pub async fn next(&mut self) -> Result<Option<ChangeReport>> {
        loop {
            if let Some(report) = self.ready.pop_front() {
                self.record(&report);
                return Ok(Some(report));
            }

            match self.phase {
                Phase::Adding => match self.results.next().await {
                    Ok(Some(plan)) => self.settle(plan).await,
                    Ok(None) => {
                        if self.results.total() != Some(self.results.iterated()) {
                            self.phase = Phase::Done;
                            return Err(Error::ShuttingDown);
                        }
                        info!(
                            version = self.version.0,
                            added = self.summary.added,
                            failed = self.summary.failed,
                            "additions complete"
                        );
                        self.phase = Phase::Removing;
                    }
                    Err(e) => {
                        self.phase = Phase::Done;
                        self.batch.shutdown();
                        return Err(e);
                    }
                },
                Phase::Removing => match self.removals.next().await {
                    Some(keys) => {
                        if let Err(e) = self.remove(keys).await {
                            self.phase = Phase::Done;
                            return Err(e);
                        }
                    }
                    None => self.phase = Phase::Done,
                },
                Phase::Done => return Ok(None),
            }
        }
    }

    /// Counters over the reports yielded so far
    pub fn summary(&self) -> SyncSummary {
        self.summary
    }

    /// The version being changed
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Consume every remaining report, returning the final counters
    pub async fn drain(mut self) -> Result<SyncSummary> {
        while let Some(report) = self.next().await? {
            if let Some(failed) = &report.error {
                warn!(error = %failed, "change failed");
            }
        }
        Ok(self.summary)
    }

    fn record(&mut self, report: &ChangeReport) {
        let key = report.key.to_string();
        match (&report.error, report.action, report.content) {
            (Some(failed), action, _) => {
                self.summary.failed += 1;
                self.collaborators.emit(Event::ChangeFailed {
                    action,
                    key,
                    error: failed.source.to_string(),
                });
            }
            (None, ChangeAction::Added, content) => {
                self.summary.added += 1;
                if let Some(content) = content {
                    self.collaborators.emit(Event::ContentAdded { content, key });
                }
            }
            (None, ChangeAction::Removed, content) => {
                self.summary.removed += 1;
                if let Some(content) = content {
                    self.collaborators.emit(Event::ContentRemoved { content, key });
                }
            }
        }
    }

    /// Settle the artifact a finished plan belongs to; commit its content once settled
    async fn settle(&mut self, plan: Plan) {
        let (task, error) = plan.into_parts();
        let Some(slot) = task.attachment::<Slot>().copied() else {
            warn!(url = %task.url(), "finished task has no content slot");
            return;
        };

        let resolution = match error {
            Some(e) => Resolution::Failed(e),
            None if slot.artifact.is_none() => Resolution::Unresolved,
            None => match task.writer().output() {
                Some(file) => {
                    self.collaborators.emit(Event::ArtifactDownloaded {
                        url: task.url().to_string(),
                        size: task.bytes_received(),
                    });
                    Resolution::Downloaded(file)
                }
                None => Resolution::Failed(Error::Other(format!(
                    "download of {} produced no file",
                    task.url()
                ))),
            },
        };

        let settled = {
            let mut pending = lock(&self.pending);
            match pending.get_mut(&slot.id) {
                Some(content) => {
                    match (slot.artifact, resolution) {
                        (Some(index), resolution) => {
                            if let Some(artifact) = content.artifact_mut(index) {
                                artifact.settle(resolution);
                            }
                        }
                        (None, Resolution::Failed(e)) => content.fail(e),
                        (None, _) => {}
                    }
                    if content.is_settled() {
                        pending.remove(&slot.id)
                    } else {
                        None
                    }
                }
                None => {
                    warn!(slot = slot.id, "result for unknown content");
                    None
                }
            }
        };

        if let Some(content) = settled {
            let report = self.commit(content).await;
            self.ready.push_back(report);
        }
    }

    async fn commit(&self, mut content: PendingContent) -> ChangeReport {
        let key = content.key().clone();
        if let Some(error) = content.take_error() {
            warn!(key = %key, error = %error, "content failed");
            content.discard().await;
            return ChangeReport::failed(ChangeAction::Added, key, content.stored(), error);
        }

        match content
            .save(
                &self.collaborators.db,
                &self.collaborators.store,
                self.version,
                &self.remote,
            )
            .await
        {
            Ok(id) => {
                debug!(key = %key, content_id = id.0, "content committed");
                ChangeReport::succeeded(ChangeAction::Added, key, Some(id))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to commit content");
                content.discard().await;
                ChangeReport::failed(ChangeAction::Added, key, content.stored(), e)
            }
        }
    }

    /// Remove one batch of keys in a single transaction
    ///
    /// A failed transaction fails every item of the batch.
    async fn remove(&mut self, keys: Vec<Result<NaturalKey>>) -> Result<()> {
        let keys = keys.into_iter().collect::<Result<Vec<_>>>()?;

        match self.remove_keys(&keys).await {
            Ok(removed) => {
                for (key, content) in removed {
                    self.ready
                        .push_back(ChangeReport::succeeded(ChangeAction::Removed, key, content));
                }
            }
            Err(e) => {
                warn!(count = keys.len(), error = %e, "removal batch failed");
                let message = e.to_string();
                for key in keys {
                    self.ready.push_back(ChangeReport::failed(
                        ChangeAction::Removed,
                        key,
                        None,
                        Error::Other(message.clone()),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn remove_keys(&self, keys: &[NaturalKey]) -> Result<Vec<(NaturalKey, Option<ContentId>)>> {
        let mut tx = self.collaborators.db.begin().await?;

        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let content = Database::find_content(&mut tx, key).await?;
            found.push((key.clone(), content.map(|c| c.id)));
        }
        let ids: Vec<ContentId> = found.iter().filter_map(|(_, id)| *id).collect();

        let removed = Database::remove_from_version(&mut tx, self.version, &ids).await?;
        let catalogued = Database::delete_catalog_entries(&mut tx, &self.remote, &removed).await?;
        tx.commit().await?;

        debug!(
            version = self.version.0,
            removed = removed.len(),
            catalog_entries = catalogued,
            "removed content batch"
        );
        Ok(found)
    }
}

impl std::fmt::Debug for Changes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Changes")
            .field("version", &self.version)
            .field("phase", &self.phase)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
