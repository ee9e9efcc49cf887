//! Artifact rows and identity lookup.

use crate::error::DatabaseError;
use crate::types::{ArtifactId, ContentId};
use crate::validation::{Algorithm, Digests};
use crate::{Error, Result};
use sqlx::{Connection, SqliteConnection};

use super::{Artifact, Database, NewArtifact, Saved, now};

const ARTIFACT_COLUMNS: &str =
    "id, size, sha512, sha384, sha256, sha224, sha1, md5, file, created_at";

impl Database {
    /// Insert an artifact row
    ///
    /// Fails with [`DatabaseError::Conflict`] if a reliable digest is already stored.
    pub async fn insert_artifact(
        conn: &mut SqliteConnection,
        artifact: &NewArtifact,
    ) -> Result<ArtifactId> {
        let digest = |alg: Algorithm| artifact.identity.digest(alg).map(str::to_string);
        let result = sqlx::query(
            r#"
            INSERT INTO artifacts (size, sha512, sha384, sha256, sha224, sha1, md5, file, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(artifact.identity.size as i64)
        .bind(digest(Algorithm::Sha512))
        .bind(digest(Algorithm::Sha384))
        .bind(digest(Algorithm::Sha256))
        .bind(digest(Algorithm::Sha224))
        .bind(digest(Algorithm::Sha1))
        .bind(digest(Algorithm::Md5))
        .bind(&artifact.file)
        .bind(now())
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::Database(DatabaseError::from_write("Failed to insert artifact", e)))?;

        Ok(ArtifactId(result.last_insert_rowid()))
    }

    /// Find a stored artifact by the strongest reliable digest in `digests`
    ///
    /// Weak digests (sha224, sha1, md5) are never used to match.
    pub async fn find_artifact(
        conn: &mut SqliteConnection,
        digests: &Digests,
    ) -> Result<Option<Artifact>> {
        let Some((algorithm, hex)) = Algorithm::RELIABLE
            .into_iter()
            .find_map(|alg| digests.get(&alg).map(|hex| (alg, hex)))
        else {
            return Ok(None);
        };

        // Column names come from the closed Algorithm set
        let sql = format!(
            "SELECT {} FROM artifacts WHERE {} = ?",
            ARTIFACT_COLUMNS,
            algorithm.as_str()
        );
        sqlx::query_as::<_, Artifact>(&sql)
            .bind(hex.to_ascii_lowercase())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to find artifact by {}: {}",
                    algorithm, e
                )))
            })
    }

    /// Pool-level [`find_artifact`](Self::find_artifact)
    pub async fn find_stored_artifact(&self, digests: &Digests) -> Result<Option<Artifact>> {
        let mut conn = self.acquire().await?;
        Self::find_artifact(&mut conn, digests).await
    }

    /// Insert an artifact row, or adopt the stored row with a matching reliable digest
    pub async fn ensure_artifact(
        conn: &mut SqliteConnection,
        artifact: &NewArtifact,
    ) -> Result<Saved<ArtifactId>> {
        let mut savepoint = conn.begin().await?;
        match Self::insert_artifact(&mut savepoint, artifact).await {
            Ok(id) => {
                savepoint.commit().await?;
                Ok(Saved::Created(id))
            }
            Err(e) if e.is_conflict() => {
                savepoint.rollback().await?;
                let existing = Self::find_artifact(conn, &artifact.identity.digests)
                    .await?
                    .ok_or_else(|| {
                        Error::Database(DatabaseError::NotFound(format!(
                            "artifact {} vanished after conflict",
                            artifact.file
                        )))
                    })?;
                tracing::debug!(artifact_id = existing.id.0, "artifact already stored, adopting row");
                Ok(Saved::Existing(existing.id))
            }
            Err(e) => Err(e),
        }
    }

    /// Get an artifact by id
    pub async fn get_artifact(&self, id: ArtifactId) -> Result<Option<Artifact>> {
        let sql = format!("SELECT {} FROM artifacts WHERE id = ?", ARTIFACT_COLUMNS);
        sqlx::query_as::<_, Artifact>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get artifact: {}",
                    e
                )))
            })
    }

    /// Stored artifacts of a content item
    pub async fn artifacts_for_content(&self, content: ContentId) -> Result<Vec<Artifact>> {
        sqlx::query_as::<_, Artifact>(
            r#"
            SELECT a.id, a.size, a.sha512, a.sha384, a.sha256, a.sha224, a.sha1, a.md5,
                   a.file, a.created_at
            FROM artifacts a
            JOIN content_artifacts ca ON ca.artifact_id = a.id
            WHERE ca.content_id = ?
            ORDER BY ca.relative_path
            "#,
        )
        .bind(content)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list artifacts for content: {}",
                e
            )))
        })
    }

    /// Number of artifact rows
    pub async fn count_artifacts(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count artifacts: {}",
                    e
                )))
            })
    }
}
