//! Content rows and their artifact links.

use crate::error::DatabaseError;
use crate::types::{ArtifactId, ContentId, NaturalKey};
use crate::{Error, Result};
use sqlx::{Connection, SqliteConnection};

use super::{Content, ContentArtifact, Database, Saved, now};

impl Database {
    /// Insert a content row
    ///
    /// Fails with [`DatabaseError::Conflict`] if the natural key is taken.
    pub async fn insert_content(
        conn: &mut SqliteConnection,
        key: &NaturalKey,
        metadata: &serde_json::Value,
    ) -> Result<ContentId> {
        let result = sqlx::query(
            r#"
            INSERT INTO content (content_type, natural_key, metadata, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(key.content_type())
        .bind(key.encode())
        .bind(serde_json::to_string(metadata)?)
        .bind(now())
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::Database(DatabaseError::from_write("Failed to insert content", e)))?;

        Ok(ContentId(result.last_insert_rowid()))
    }

    /// Find a content row by natural key
    pub async fn find_content(
        conn: &mut SqliteConnection,
        key: &NaturalKey,
    ) -> Result<Option<Content>> {
        sqlx::query_as::<_, Content>(
            r#"
            SELECT id, content_type, natural_key, metadata, created_at
            FROM content
            WHERE content_type = ? AND natural_key = ?
            "#,
        )
        .bind(key.content_type())
        .bind(key.encode())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find content: {}",
                e
            )))
        })
    }

    /// Pool-level [`find_content`](Self::find_content)
    pub async fn find_content_by_key(&self, key: &NaturalKey) -> Result<Option<Content>> {
        let mut conn = self.acquire().await?;
        Self::find_content(&mut conn, key).await
    }

    /// Get a content row by id
    pub async fn get_content(&self, id: ContentId) -> Result<Option<Content>> {
        sqlx::query_as::<_, Content>(
            r#"
            SELECT id, content_type, natural_key, metadata, created_at
            FROM content
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get content: {}",
                e
            )))
        })
    }

    /// Insert a content row, or adopt the existing row with the same natural key
    ///
    /// The insert runs in a savepoint so a conflict leaves the surrounding
    /// transaction usable.
    pub async fn ensure_content(
        conn: &mut SqliteConnection,
        key: &NaturalKey,
        metadata: &serde_json::Value,
    ) -> Result<Saved<ContentId>> {
        let mut savepoint = conn.begin().await?;
        match Self::insert_content(&mut savepoint, key, metadata).await {
            Ok(id) => {
                savepoint.commit().await?;
                Ok(Saved::Created(id))
            }
            Err(e) if e.is_conflict() => {
                savepoint.rollback().await?;
                tracing::debug!(key = %key, "content already exists, adopting stored row");
                let existing = Self::find_content(conn, key).await?.ok_or_else(|| {
                    Error::Database(DatabaseError::NotFound(format!(
                        "content {} vanished after conflict",
                        key
                    )))
                })?;
                Ok(Saved::Existing(existing.id))
            }
            Err(e) => Err(e),
        }
    }

    /// Link a file to a content item
    ///
    /// Relinking the same path keeps the stored artifact unless a new one is given.
    pub async fn link_artifact(
        conn: &mut SqliteConnection,
        content: ContentId,
        artifact: Option<ArtifactId>,
        relative_path: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_artifacts (content_id, artifact_id, relative_path)
            VALUES (?, ?, ?)
            ON CONFLICT(content_id, relative_path)
            DO UPDATE SET artifact_id = COALESCE(excluded.artifact_id, content_artifacts.artifact_id)
            "#,
        )
        .bind(content)
        .bind(artifact)
        .bind(relative_path)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to link artifact: {}",
                e
            )))
        })?;
        Ok(())
    }

    /// Files of a content item, ordered by path
    pub async fn content_artifacts(&self, content: ContentId) -> Result<Vec<ContentArtifact>> {
        sqlx::query_as::<_, ContentArtifact>(
            r#"
            SELECT content_id, artifact_id, relative_path
            FROM content_artifacts
            WHERE content_id = ?
            ORDER BY relative_path
            "#,
        )
        .bind(content)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list content artifacts: {}",
                e
            )))
        })
    }

    /// Number of content rows
    pub async fn count_content(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM content")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count content: {}",
                    e
                )))
            })
    }
}
