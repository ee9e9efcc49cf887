//! # content-sync
//!
//! Library for synchronizing a local, versioned content repository with a
//! remote source.
//!
//! ## Design Philosophy
//!
//! content-sync is designed to be:
//! - **Streaming** - wanted content is consumed lazily and iterated once
//! - **Failure-isolating** - one bad download never aborts a run
//! - **Idempotent** - repeated or racing syncs converge on one stored row per item
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use content_sync::{Algorithm, Config, NaturalKey, PendingArtifact, PendingContent, Syncer};
//! use futures::stream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let syncer = Syncer::new(Config::default()).await?;
//!
//!     let mut events = syncer.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let wanted = vec![Ok(PendingContent::new(
//!         NaturalKey::new("rpm", [("name", "bash"), ("version", "5.2")]),
//!         serde_json::json!({ "arch": "x86_64" }),
//!     )
//!     .with_artifact(
//!         PendingArtifact::new("https://mirror.example/bash-5.2.rpm", "bash-5.2.rpm")
//!             .with_size(1_234_567)
//!             .with_digest(Algorithm::Sha256, "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"),
//!     ))];
//!
//!     let done = syncer.sync("fedora", "upstream", stream::iter(wanted)).await?;
//!     println!("version {}: {:?}", done.version.number, done.summary);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Applying additions and removals to a repository version
pub mod changeset;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Download tasks, transports and the batch engine
pub mod download;
/// Error types
pub mod error;
/// Retry logic with exponential backoff
pub mod retry;
/// Content-addressed artifact storage
pub mod storage;
/// Library entry point
pub mod syncer;
/// Core types and events
pub mod types;
/// Size and digest validation
pub mod validation;
/// Repository version orchestration
pub mod version;

// Re-export commonly used types
pub use changeset::{
    ChangeFailed, ChangeReport, ChangeSet, ChangeSetConfig, Changes, Collaborators,
    PendingArtifact, PendingContent, Resolution,
};
pub use config::{Config, RetryConfig, SyncConfig, SyncMode, TransportConfig};
pub use db::Database;
pub use download::{Batch, BatchResults, Delegate, DownloadTask, Plan, Repair, SharedContext, Transport};
pub use error::{DatabaseError, DownloadError, Error, Result, ValidationError};
pub use storage::ArtifactStore;
pub use syncer::Syncer;
pub use types::{
    ArtifactId, ChangeAction, ContentId, Event, NaturalKey, RepositoryId, SyncSummary, VersionId,
};
pub use validation::{Algorithm, DigestValidation, SizeValidation, Validator};
pub use version::{CompletedVersion, PendingVersion};

/// Wait for a termination signal, then shut the syncer down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Runs in progress stop feeding new downloads and their half-built versions
/// are deleted.
///
/// # Example
///
/// ```no_run
/// use content_sync::{Config, Syncer, shutdown_on_signal};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let syncer = Arc::new(Syncer::new(Config::default()).await?);
///
///     let watcher = Arc::clone(&syncer);
///     tokio::spawn(async move { shutdown_on_signal(&watcher).await });
///
///     Ok(())
/// }
/// ```
pub async fn shutdown_on_signal(syncer: &Syncer) {
    wait_for_signal().await;
    syncer.shutdown();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
