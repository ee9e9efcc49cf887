//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Connect to database with foreign key enforcement and WAL mode
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.acquire().await?;

        // Create schema version table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        // Check current version
        let current_version: Option<i64> =
            sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        // Apply migrations
        if current_version < 1 {
            Self::migrate_v1(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: Create initial schema
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        tracing::info!("Applying database migration v1");

        // Wrap migration in a transaction so partial failures don't leave the DB in a broken state
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            Self::create_repository_schema(conn).await?;
            Self::create_content_schema(conn).await?;
            Self::create_catalog_schema(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v1: {}",
                            e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Database migration v1 complete");
        Ok(())
    }

    /// Execute each statement, labelling failures with `what`
    async fn execute_schema(
        conn: &mut SqliteConnection,
        what: &str,
        statements: &[&str],
    ) -> Result<()> {
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::MigrationFailed(format!(
                        "Failed to create {}: {}",
                        what, e
                    )))
                })?;
        }
        Ok(())
    }

    /// Create repositories, versions and version membership
    async fn create_repository_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_schema(
            conn,
            "repository tables",
            &[
                r#"
                CREATE TABLE repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    created_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE repository_versions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    number INTEGER NOT NULL,
                    complete INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    UNIQUE(repository_id, number)
                )
                "#,
            ],
        )
        .await
    }

    /// Create content, artifacts and their link tables
    async fn create_content_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_schema(
            conn,
            "content tables",
            &[
                r#"
                CREATE TABLE content (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    content_type TEXT NOT NULL,
                    natural_key TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at INTEGER NOT NULL,
                    UNIQUE(content_type, natural_key)
                )
                "#,
                r#"
                CREATE TABLE artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    size INTEGER NOT NULL,
                    sha512 TEXT UNIQUE,
                    sha384 TEXT UNIQUE,
                    sha256 TEXT UNIQUE,
                    sha224 TEXT,
                    sha1 TEXT,
                    md5 TEXT,
                    file TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE content_artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    content_id INTEGER NOT NULL REFERENCES content(id) ON DELETE CASCADE,
                    artifact_id INTEGER REFERENCES artifacts(id),
                    relative_path TEXT NOT NULL,
                    UNIQUE(content_id, relative_path)
                )
                "#,
                r#"
                CREATE TABLE version_content (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    version_id INTEGER NOT NULL REFERENCES repository_versions(id) ON DELETE CASCADE,
                    content_id INTEGER NOT NULL REFERENCES content(id),
                    UNIQUE(version_id, content_id)
                )
                "#,
                "CREATE INDEX idx_version_content_content ON version_content(content_id)",
                "CREATE INDEX idx_content_artifacts_artifact ON content_artifacts(artifact_id)",
            ],
        )
        .await
    }

    /// Create the deferred download catalog
    async fn create_catalog_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::execute_schema(
            conn,
            "download catalog",
            &[
                r#"
                CREATE TABLE download_catalog (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    remote TEXT NOT NULL,
                    content_id INTEGER NOT NULL REFERENCES content(id) ON DELETE CASCADE,
                    relative_path TEXT NOT NULL,
                    url TEXT NOT NULL,
                    size INTEGER,
                    digests TEXT NOT NULL DEFAULT '{}',
                    created_at INTEGER NOT NULL,
                    UNIQUE(remote, content_id, relative_path)
                )
                "#,
                "CREATE INDEX idx_download_catalog_content ON download_catalog(content_id)",
            ],
        )
        .await
    }

    /// Record that a migration was applied
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
