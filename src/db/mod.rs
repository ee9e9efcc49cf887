//! Database layer for content-sync
//!
//! Handles SQLite persistence for repositories, versions, content, artifacts
//! and the deferred download catalog.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - `migrations` - Database lifecycle, schema migrations
//! - `repositories` - Repositories, versions and version membership
//! - `content` - Content rows and their artifact links
//! - `artifacts` - Artifact rows and identity lookup
//! - `catalog` - Deferred download catalog
//!
//! Writes that take part in a change-set commit are associated functions taking
//! a `&mut SqliteConnection`, so the caller can run them inside one
//! transaction. Inserts report a uniqueness violation as
//! [`DatabaseError::Conflict`](crate::error::DatabaseError::Conflict); the
//! `ensure_*` functions recover from it by re-reading the existing row.

use crate::error::DatabaseError;
use crate::types::{ArtifactId, ContentId, NaturalKey, RepositoryId, VersionId};
use crate::validation::{Algorithm, ArtifactIdentity, Digests};
use crate::{Error, Result};
use sqlx::pool::PoolConnection;
use sqlx::{FromRow, Sqlite, Transaction, sqlite::SqlitePool};

mod artifacts;
mod catalog;
mod content;
mod migrations;
mod repositories;

/// Outcome of an optimistic insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saved<T> {
    /// The row was inserted by this call
    Created(T),
    /// The row already existed and was adopted
    Existing(T),
}

impl<T> Saved<T> {
    /// Whether this call inserted the row
    pub fn was_created(&self) -> bool {
        matches!(self, Saved::Created(_))
    }

    /// The saved value, however it was obtained
    pub fn into_inner(self) -> T {
        match self {
            Saved::Created(value) | Saved::Existing(value) => value,
        }
    }
}

impl<T: Copy> Saved<T> {
    /// Id of the row, however it was obtained
    pub fn id(&self) -> T {
        match self {
            Saved::Created(id) | Saved::Existing(id) => *id,
        }
    }
}

/// Repository record from database
#[derive(Debug, Clone, FromRow)]
pub struct Repository {
    /// Unique database ID
    pub id: RepositoryId,
    /// Unique repository name
    pub name: String,
    /// Unix timestamp when the repository was created
    pub created_at: i64,
}

/// Repository version record from database
#[derive(Debug, Clone, FromRow)]
pub struct RepositoryVersion {
    /// Unique database ID
    pub id: VersionId,
    /// Repository this version belongs to
    pub repository_id: RepositoryId,
    /// Version number, increasing per repository
    pub number: i64,
    /// Whether the version finished building
    pub complete: bool,
    /// Unix timestamp when the version was created
    pub created_at: i64,
}

/// Content record from database
#[derive(Debug, Clone, FromRow)]
pub struct Content {
    /// Unique database ID
    pub id: ContentId,
    /// Content type (e.g. "rpm", "file")
    pub content_type: String,
    /// Encoded natural key (see [`NaturalKey::encode`])
    pub natural_key: String,
    /// Arbitrary JSON metadata
    pub metadata: String,
    /// Unix timestamp when the content was created
    pub created_at: i64,
}

impl Content {
    /// Decoded natural key
    pub fn key(&self) -> NaturalKey {
        NaturalKey::decode(&self.content_type, &self.natural_key)
    }

    /// Parsed metadata
    pub fn metadata(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.metadata)?)
    }
}

/// New artifact to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Size and digests
    pub identity: ArtifactIdentity,
    /// Stored file, relative to the storage root
    pub file: String,
}

/// Artifact record from database
#[derive(Debug, Clone, FromRow)]
pub struct Artifact {
    /// Unique database ID
    pub id: ArtifactId,
    /// Size in bytes
    pub size: i64,
    /// SHA-512 hex digest
    pub sha512: Option<String>,
    /// SHA-384 hex digest
    pub sha384: Option<String>,
    /// SHA-256 hex digest
    pub sha256: Option<String>,
    /// SHA-224 hex digest
    pub sha224: Option<String>,
    /// SHA-1 hex digest
    pub sha1: Option<String>,
    /// MD5 hex digest
    pub md5: Option<String>,
    /// Stored file, relative to the storage root
    pub file: String,
    /// Unix timestamp when the artifact was created
    pub created_at: i64,
}

impl Artifact {
    /// Size and known digests
    pub fn identity(&self) -> ArtifactIdentity {
        let columns = [
            (Algorithm::Sha512, &self.sha512),
            (Algorithm::Sha384, &self.sha384),
            (Algorithm::Sha256, &self.sha256),
            (Algorithm::Sha224, &self.sha224),
            (Algorithm::Sha1, &self.sha1),
            (Algorithm::Md5, &self.md5),
        ];
        ArtifactIdentity {
            size: self.size as u64,
            digests: columns
                .into_iter()
                .filter_map(|(alg, hex)| hex.clone().map(|hex| (alg, hex)))
                .collect(),
        }
    }
}

/// Link between a content item and one of its files
#[derive(Debug, Clone, FromRow)]
pub struct ContentArtifact {
    /// Owning content
    pub content_id: ContentId,
    /// Stored artifact; `None` until a deferred download is fetched
    pub artifact_id: Option<ArtifactId>,
    /// Path of the file within the content item
    pub relative_path: String,
}

/// New deferred download catalog entry
#[derive(Debug, Clone)]
pub struct NewCatalogEntry {
    /// Remote the URL belongs to
    pub remote: String,
    /// Content the file belongs to
    pub content_id: ContentId,
    /// Path of the file within the content item
    pub relative_path: String,
    /// Where the file can be fetched
    pub url: String,
    /// Expected size, if known
    pub size: Option<u64>,
    /// Expected digests
    pub digests: Digests,
}

/// Deferred download catalog record from database
#[derive(Debug, Clone, FromRow)]
pub struct CatalogEntry {
    /// Unique database ID
    pub id: i64,
    /// Remote the URL belongs to
    pub remote: String,
    /// Content the file belongs to
    pub content_id: ContentId,
    /// Path of the file within the content item
    pub relative_path: String,
    /// Where the file can be fetched
    pub url: String,
    /// Expected size, if known
    pub size: Option<i64>,
    /// Expected digests as a JSON object
    pub digests: String,
    /// Unix timestamp when the entry was recorded
    pub created_at: i64,
}

impl CatalogEntry {
    /// Parsed expected digests
    pub fn digests(&self) -> Result<Digests> {
        Ok(serde_json::from_str(&self.digests)?)
    }
}

/// Database handle for content-sync
#[derive(Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Start a transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })
    }

    /// Acquire a pooled connection
    pub(crate) async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })
    }
}

/// Current time as a Unix timestamp
fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
