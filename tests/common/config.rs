//! Test configuration helpers for creating syncers rooted in a temp directory

use content_sync::config::PersistenceConfig;
use content_sync::{Config, RetryConfig, SyncConfig, SyncMode, Syncer};
use tempfile::TempDir;

/// Configuration with every path inside `temp_dir` and instant retries
pub fn test_config(temp_dir: &TempDir) -> Config {
    Config {
        sync: SyncConfig {
            concurrency: 2,
            backlog: 8,
            removal_batch_size: 2,
            ..SyncConfig::default()
        },
        retry: RetryConfig::immediate(2),
        persistence: PersistenceConfig {
            database_path: temp_dir.path().join("content-sync.db"),
            storage_dir: temp_dir.path().join("storage"),
            working_dir: temp_dir.path().join("working"),
        },
        ..Config::default()
    }
}

/// Create a syncer in a fresh temp directory
///
/// Keep the returned `TempDir` alive for the duration of the test.
pub async fn create_test_syncer(mode: SyncMode) -> (Syncer, TempDir) {
    create_test_syncer_with(|config| config.sync.mode = mode).await
}

/// Create a syncer after adjusting the test configuration
pub async fn create_test_syncer_with(adjust: impl FnOnce(&mut Config)) -> (Syncer, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = test_config(&temp_dir);
    adjust(&mut config);
    let syncer = Syncer::new(config).await.expect("Failed to create syncer");
    (syncer, temp_dir)
}
