use super::*;
use crate::download::test_helpers::ScriptedTransport;
use crate::validation::{Algorithm, ArtifactHasher};
use futures::stream;
use tempfile::{NamedTempFile, TempDir};

struct Fixture {
    db: Arc<Database>,
    store: ArtifactStore,
    version: VersionId,
    dir: TempDir,
    _db_file: NamedTempFile,
}

async fn fixture() -> Fixture {
    let db_file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(db_file.path()).await.unwrap());
    let repo = db.create_repository("fedora").await.unwrap();
    let version = db.create_version(repo.id).await.unwrap();
    let dir = TempDir::new().unwrap();
    Fixture {
        store: ArtifactStore::new(dir.path().join("storage")),
        db,
        version: version.id,
        dir,
        _db_file: db_file,
    }
}

impl Fixture {
    fn collaborators(&self, transport: &Arc<ScriptedTransport>) -> Collaborators {
        let transport: Arc<dyn Transport> = transport.clone();
        Collaborators::new(Arc::clone(&self.db), self.store.clone(), transport)
    }

    fn config(&self) -> ChangeSetConfig {
        ChangeSetConfig {
            remote: "upstream".into(),
            concurrency: 2,
            backlog: 4,
            deferred_download: false,
            removal_batch_size: 2,
            retry: RetryConfig::immediate(2),
            working_dir: self.dir.path().join("working"),
        }
    }

    fn change_set(
        &self,
        transport: &Arc<ScriptedTransport>,
        additions: Vec<PendingContent>,
        removals: Vec<NaturalKey>,
    ) -> ChangeSet {
        ChangeSet::new(
            self.collaborators(transport),
            self.version,
            stream::iter(additions.into_iter().map(Ok)),
            stream::iter(removals.into_iter().map(Ok)),
        )
        .with_config(self.config())
    }
}

fn key(name: &str) -> NaturalKey {
    NaturalKey::new("file", [("path", name)])
}

fn url(name: &str) -> String {
    format!("mem://upstream/{name}")
}

fn sha256(body: &[u8]) -> String {
    let mut hasher = ArtifactHasher::new();
    hasher.update(body);
    hasher.finish().digest(Algorithm::Sha256).unwrap().to_string()
}

fn file_content(name: &str) -> PendingContent {
    PendingContent::new(key(name), serde_json::json!({ "name": name }))
        .with_artifact(PendingArtifact::new(url(name), name))
}

async fn collect(mut changes: Changes) -> (Vec<ChangeReport>, SyncSummary) {
    let mut reports = Vec::new();
    while let Some(report) = changes.next().await.unwrap() {
        reports.push(report);
    }
    let summary = changes.summary();
    (reports, summary)
}

#[tokio::test]
async fn test_failed_validation_is_reported_per_item() {
    let fx = fixture().await;
    let mut transport = ScriptedTransport::new();
    let mut additions = Vec::new();
    for i in 0..5 {
        let name = format!("f{i}");
        transport = transport.body(&url(&name), format!("body of {name}"));
        let mut content = file_content(&name);
        if i % 2 == 1 {
            // Wrong digest: fails validation and is never retried
            content = PendingContent::new(key(&name), serde_json::json!({})).with_artifact(
                PendingArtifact::new(url(&name), &name).with_digest(Algorithm::Sha256, "00".repeat(32)),
            );
        }
        additions.push(content);
    }
    let transport = Arc::new(transport);

    let changes = fx.change_set(&transport, additions, vec![]).apply().unwrap();
    let (reports, summary) = collect(changes).await;

    assert_eq!(reports.len(), 5);
    assert_eq!(summary.added, 3);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.removed, 0);
    assert_eq!(reports.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(transport.calls_for(&url("f1")), 1);

    let failed = reports
        .iter()
        .find_map(|r| r.error.as_ref())
        .unwrap();
    assert!(matches!(*failed.source, Error::Validation(_)));

    assert_eq!(fx.db.list_version_content(fx.version).await.unwrap().len(), 3);
    assert_eq!(fx.db.count_artifacts().await.unwrap(), 3);
    assert!(fx.store.contains(&sha256(b"body of f0")).await);
}

#[tokio::test]
async fn test_content_without_artifacts_is_committed() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new());
    let additions = vec![
        PendingContent::new(key("errata-1"), serde_json::json!({ "severity": "low" })),
        PendingContent::new(key("errata-2"), serde_json::json!({})),
    ];

    let changes = fx.change_set(&transport, additions, vec![]).apply().unwrap();
    let (reports, summary) = collect(changes).await;

    assert_eq!(reports.len(), 2);
    assert_eq!(summary.added, 2);
    assert_eq!(transport.calls(), 0);
    let stored = fx.db.find_content_by_key(&key("errata-1")).await.unwrap().unwrap();
    assert_eq!(stored.metadata().unwrap()["severity"], "low");
}

#[tokio::test]
async fn test_downloaded_artifact_is_linked_and_catalogued() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new().body(&url("a.bin"), "abc"));

    let changes = fx
        .change_set(&transport, vec![file_content("a.bin")], vec![])
        .apply()
        .unwrap();
    let (reports, _) = collect(changes).await;
    let content = reports[0].content.unwrap();

    let links = fx.db.content_artifacts(content).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].relative_path, "a.bin");
    let artifact = fx
        .db
        .get_artifact(links[0].artifact_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.size, 3);
    assert_eq!(artifact.identity().digests.len(), Algorithm::ALL.len());
    assert!(fx.store.root().join(&artifact.file).exists());

    let catalog = fx.db.catalog_entries("upstream").await.unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].url, url("a.bin"));

    // Nothing is left behind in the working directory
    let working = fx.dir.path().join("working");
    let leftover = std::fs::read_dir(&working)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn test_stored_artifact_is_not_downloaded_again() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new().body(&url("shared"), "shared bytes"));
    let digest = sha256(b"shared bytes");
    let with_shared = |name: &str| {
        PendingContent::new(key(name), serde_json::json!({})).with_artifact(
            PendingArtifact::new(url("shared"), "shared").with_digest(Algorithm::Sha256, &digest),
        )
    };

    let first = fx
        .change_set(&transport, vec![with_shared("a")], vec![])
        .apply()
        .unwrap();
    assert_eq!(first.drain().await.unwrap().added, 1);

    let second = fx
        .change_set(&transport, vec![with_shared("b")], vec![])
        .apply()
        .unwrap();
    assert_eq!(second.drain().await.unwrap().added, 1);

    assert_eq!(transport.calls_for(&url("shared")), 1);
    assert_eq!(fx.db.count_artifacts().await.unwrap(), 1);
    assert_eq!(fx.db.list_version_content(fx.version).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_content_already_in_version_is_skipped() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new().body(&url("a"), "a"));

    let first = fx
        .change_set(&transport, vec![file_content("a")], vec![])
        .apply()
        .unwrap();
    first.drain().await.unwrap();

    let again = fx
        .change_set(&transport, vec![file_content("a")], vec![])
        .apply()
        .unwrap();
    let (reports, summary) = collect(again).await;

    assert!(reports.is_empty());
    assert_eq!(summary.total(), 0);
    assert_eq!(transport.calls_for(&url("a")), 1);
}

#[tokio::test]
async fn test_adopted_content_reuses_linked_artifacts() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new().body(&url("a"), "a"));

    let first = fx
        .change_set(&transport, vec![file_content("a")], vec![])
        .apply()
        .unwrap();
    first.drain().await.unwrap();

    // Same content, new version of another repository
    let repo = fx.db.create_repository("centos").await.unwrap();
    let other = fx.db.create_version(repo.id).await.unwrap();
    let changes = ChangeSet::new(
        fx.collaborators(&transport),
        other.id,
        stream::iter(vec![Ok(file_content("a"))]),
        stream::empty(),
    )
    .with_config(fx.config())
    .apply()
    .unwrap();
    let (reports, summary) = collect(changes).await;

    assert_eq!(summary.added, 1);
    assert_eq!(transport.calls_for(&url("a")), 1);
    assert_eq!(fx.db.count_content().await.unwrap(), 1);
    assert_eq!(
        reports[0].content,
        fx.db.find_content_by_key(&key("a")).await.unwrap().map(|c| c.id)
    );
}

#[tokio::test]
async fn test_deferred_download_catalogues_without_fetching() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new().body(&url("big.iso"), "iso"));
    let config = ChangeSetConfig {
        deferred_download: true,
        ..fx.config()
    };

    let changes = fx
        .change_set(&transport, vec![file_content("big.iso")], vec![])
        .with_config(config)
        .apply()
        .unwrap();
    let (reports, summary) = collect(changes).await;

    assert_eq!(summary.added, 1);
    assert_eq!(transport.calls(), 0);
    let links = fx.db.content_artifacts(reports[0].content.unwrap()).await.unwrap();
    assert_eq!(links.len(), 1);
    assert!(links[0].artifact_id.is_none());
    assert_eq!(fx.db.count_artifacts().await.unwrap(), 0);
    assert_eq!(fx.db.catalog_entries("upstream").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let fx = fixture().await;
    let transport = Arc::new(
        ScriptedTransport::new()
            .body(&url("flaky"), "eventually")
            .fail(&url("flaky"), 2),
    );

    let changes = fx
        .change_set(&transport, vec![file_content("flaky")], vec![])
        .apply()
        .unwrap();
    let summary = changes.drain().await.unwrap();

    assert_eq!(summary.added, 1);
    assert_eq!(transport.calls_for(&url("flaky")), 3);
    let content = fx.db.find_content_by_key(&key("flaky")).await.unwrap().unwrap();
    let artifacts = fx.db.artifacts_for_content(content.id).await.unwrap();
    assert_eq!(artifacts[0].size, "eventually".len() as i64);
}

#[tokio::test]
async fn test_missing_artifact_fails_only_its_content() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new().body(&url("present"), "here"));
    let additions = vec![
        file_content("present"),
        PendingContent::new(key("partial"), serde_json::json!({}))
            .with_artifact(PendingArtifact::new(url("present"), "copy"))
            .with_artifact(PendingArtifact::new(url("gone"), "gone")),
    ];

    let changes = fx.change_set(&transport, additions, vec![]).apply().unwrap();
    let (reports, summary) = collect(changes).await;

    assert_eq!(summary.added, 1);
    assert_eq!(summary.failed, 1);
    let failed = reports.iter().find(|r| !r.is_ok()).unwrap();
    assert_eq!(failed.key, key("partial"));
    assert!(fx.db.find_content_by_key(&key("partial")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_removals_follow_additions_in_batches() {
    let fx = fixture().await;
    let mut transport = ScriptedTransport::new();
    for name in ["a", "b", "c"] {
        transport = transport.body(&url(name), name);
    }
    let transport = Arc::new(transport);

    let seed = fx
        .change_set(
            &transport,
            vec![file_content("a"), file_content("b"), file_content("c")],
            vec![],
        )
        .apply()
        .unwrap();
    assert_eq!(seed.drain().await.unwrap().added, 3);

    let changes = fx
        .change_set(&transport, vec![], vec![key("b"), key("c"), key("unknown")])
        .apply()
        .unwrap();
    let (reports, summary) = collect(changes).await;

    assert_eq!(summary.removed, 3);
    assert_eq!(summary.failed, 0);
    assert!(reports.iter().all(|r| r.action == ChangeAction::Removed));
    let unknown = reports.iter().find(|r| r.key == key("unknown")).unwrap();
    assert!(unknown.content.is_none());

    let remaining = fx.db.content_keys_in_version(fx.version).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.contains_key(&key("a")));
    assert_eq!(fx.db.catalog_entries("upstream").await.unwrap().len(), 1);
    // Removal only detaches content from the version
    assert_eq!(fx.db.count_content().await.unwrap(), 3);
}

#[tokio::test]
async fn test_duplicate_keys_in_one_run_store_one_row() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new());
    let additions = (0..4)
        .map(|_| PendingContent::new(key("dup"), serde_json::json!({})))
        .collect();

    let changes = fx.change_set(&transport, additions, vec![]).apply().unwrap();
    let summary = changes.drain().await.unwrap();

    assert_eq!(summary.failed, 0);
    assert!(summary.added >= 1);
    assert_eq!(fx.db.count_content().await.unwrap(), 1);
    assert_eq!(fx.db.list_version_content(fx.version).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failing_additions_stream_aborts_the_run() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new());
    let additions = stream::iter(vec![
        Ok(PendingContent::new(key("a"), serde_json::json!({}))),
        Err(Error::Other("metadata truncated".into())),
    ]);

    let changes = ChangeSet::new(
        fx.collaborators(&transport),
        fx.version,
        additions,
        stream::iter(vec![Ok(key("never"))]),
    )
    .with_config(fx.config())
    .apply()
    .unwrap();

    match changes.drain().await {
        Err(Error::Other(message)) => assert_eq!(message, "metadata truncated"),
        other => panic!("expected stream error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_before_additions_finish_is_an_error() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new());
    let token = CancellationToken::new();
    token.cancel();

    let changes = fx
        .change_set(
            &transport,
            vec![PendingContent::new(key("a"), serde_json::json!({}))],
            vec![key("b")],
        )
        .with_shutdown(&token)
        .apply()
        .unwrap();

    assert!(matches!(changes.drain().await, Err(Error::ShuttingDown)));
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() {
    let fx = fixture().await;
    let transport = Arc::new(ScriptedTransport::new());

    let low_concurrency = ChangeSetConfig {
        concurrency: 1,
        ..fx.config()
    };
    assert!(
        fx.change_set(&transport, vec![], vec![])
            .with_config(low_concurrency)
            .apply()
            .is_err()
    );

    let no_batch = ChangeSetConfig {
        removal_batch_size: 0,
        ..fx.config()
    };
    assert!(
        fx.change_set(&transport, vec![], vec![])
            .with_config(no_batch)
            .apply()
            .is_err()
    );
}

#[tokio::test]
async fn test_events_follow_reports() {
    let fx = fixture().await;
    let transport = Arc::new(
        ScriptedTransport::new()
            .body(&url("ok"), "fine")
            .body(&url("bad"), "bytes"),
    );
    let collaborators = fx.collaborators(&transport);
    let mut events = collaborators.subscribe();
    let additions = vec![
        file_content("ok"),
        PendingContent::new(key("bad"), serde_json::json!({}))
            .with_artifact(PendingArtifact::new(url("bad"), "bad").with_size(1)),
    ];

    let changes = ChangeSet::new(
        collaborators,
        fx.version,
        stream::iter(additions.into_iter().map(Ok)),
        stream::empty(),
    )
    .with_config(fx.config())
    .apply()
    .unwrap();
    changes.drain().await.unwrap();

    let mut downloaded = 0;
    let mut added = Vec::new();
    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            Event::ArtifactDownloaded { size, .. } => {
                downloaded += 1;
                assert_eq!(size, 4);
            }
            Event::ContentAdded { key, .. } => added.push(key),
            Event::ChangeFailed { key, action, .. } => {
                assert_eq!(action, ChangeAction::Added);
                failed.push(key);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(downloaded, 1);
    assert_eq!(added, vec![key("ok").to_string()]);
    assert_eq!(failed, vec![key("bad").to_string()]);
}
