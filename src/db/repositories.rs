//! Repositories, repository versions and version membership.

use crate::error::DatabaseError;
use crate::types::{ContentId, NaturalKey, RepositoryId, VersionId};
use crate::{Error, Result};
use sqlx::{Connection, SqliteConnection};
use std::collections::HashMap;

use super::{Content, Database, Repository, RepositoryVersion, Saved, now};

impl Database {
    /// Create a repository
    ///
    /// Fails with [`DatabaseError::Conflict`] if the name is taken.
    pub async fn create_repository(&self, name: &str) -> Result<Repository> {
        let created_at = now();
        let result = sqlx::query("INSERT INTO repositories (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::from_write("Failed to insert repository", e))
            })?;

        Ok(Repository {
            id: RepositoryId(result.last_insert_rowid()),
            name: name.to_string(),
            created_at,
        })
    }

    /// Find a repository by name
    pub async fn find_repository(&self, name: &str) -> Result<Option<Repository>> {
        sqlx::query_as::<_, Repository>(
            "SELECT id, name, created_at FROM repositories WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find repository: {}",
                e
            )))
        })
    }

    /// Find a repository by name, creating it if needed
    pub async fn ensure_repository(&self, name: &str) -> Result<Saved<Repository>> {
        match self.create_repository(name).await {
            Ok(repository) => Ok(Saved::Created(repository)),
            Err(e) if e.is_conflict() => {
                let existing = self.find_repository(name).await?.ok_or_else(|| {
                    Error::Database(DatabaseError::NotFound(format!(
                        "repository '{}' vanished after conflict",
                        name
                    )))
                })?;
                Ok(Saved::Existing(existing))
            }
            Err(e) => Err(e),
        }
    }

    /// Get a version by id
    pub async fn get_version(&self, id: VersionId) -> Result<Option<RepositoryVersion>> {
        sqlx::query_as::<_, RepositoryVersion>(
            r#"
            SELECT id, repository_id, number, complete, created_at
            FROM repository_versions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get repository version: {}",
                e
            )))
        })
    }

    /// Latest complete version of a repository
    pub async fn latest_version(
        &self,
        repository: RepositoryId,
    ) -> Result<Option<RepositoryVersion>> {
        let mut conn = self.acquire().await?;
        Self::latest_complete_version(&mut conn, repository).await
    }

    async fn latest_complete_version(
        conn: &mut SqliteConnection,
        repository: RepositoryId,
    ) -> Result<Option<RepositoryVersion>> {
        sqlx::query_as::<_, RepositoryVersion>(
            r#"
            SELECT id, repository_id, number, complete, created_at
            FROM repository_versions
            WHERE repository_id = ? AND complete = 1
            ORDER BY number DESC
            LIMIT 1
            "#,
        )
        .bind(repository)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find latest version: {}",
                e
            )))
        })
    }

    /// All versions of a repository, oldest first
    pub async fn list_versions(&self, repository: RepositoryId) -> Result<Vec<RepositoryVersion>> {
        sqlx::query_as::<_, RepositoryVersion>(
            r#"
            SELECT id, repository_id, number, complete, created_at
            FROM repository_versions
            WHERE repository_id = ?
            ORDER BY number ASC
            "#,
        )
        .bind(repository)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list repository versions: {}",
                e
            )))
        })
    }

    /// Create the next version of a repository
    ///
    /// The new version starts incomplete and holds the content of the latest
    /// complete version.
    pub async fn create_version(&self, repository: RepositoryId) -> Result<RepositoryVersion> {
        let mut tx = self.begin().await?;

        let base = Self::latest_complete_version(&mut tx, repository).await?;
        let last_number: Option<i64> = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(number) FROM repository_versions WHERE repository_id = ?",
        )
        .bind(repository)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to query version numbers: {}",
                e
            )))
        })?;

        let number = last_number.unwrap_or(0) + 1;
        let created_at = now();
        let result = sqlx::query(
            r#"
            INSERT INTO repository_versions (repository_id, number, complete, created_at)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(repository)
        .bind(number)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::from_write(
                "Failed to insert repository version",
                e,
            ))
        })?;
        let id = VersionId(result.last_insert_rowid());

        if let Some(base) = &base {
            sqlx::query(
                r#"
                INSERT INTO version_content (version_id, content_id)
                SELECT ?, content_id FROM version_content WHERE version_id = ?
                "#,
            )
            .bind(id)
            .bind(base.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to copy version content: {}",
                    e
                )))
            })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit repository version: {}",
                e
            )))
        })?;

        tracing::debug!(
            repository = repository.0,
            version = number,
            base = base.as_ref().map(|b| b.number),
            "created repository version"
        );

        Ok(RepositoryVersion {
            id,
            repository_id: repository,
            number,
            complete: false,
            created_at,
        })
    }

    /// Mark a version complete, making it the latest
    pub async fn complete_version(&self, id: VersionId) -> Result<()> {
        let result = sqlx::query("UPDATE repository_versions SET complete = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to complete repository version: {}",
                    e
                )))
            })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "repository version {}",
                id
            ))));
        }
        Ok(())
    }

    /// Delete a version and its membership rows
    ///
    /// Content rows are kept; they may belong to other versions.
    pub async fn delete_version(&self, id: VersionId) -> Result<()> {
        sqlx::query("DELETE FROM repository_versions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete repository version: {}",
                    e
                )))
            })?;
        Ok(())
    }

    /// Natural keys of every content item in a version
    pub async fn content_keys_in_version(
        &self,
        version: VersionId,
    ) -> Result<HashMap<NaturalKey, ContentId>> {
        let rows = self.list_version_content(version).await?;
        Ok(rows.into_iter().map(|c| (c.key(), c.id)).collect())
    }

    /// Content of a version, ordered by id
    pub async fn list_version_content(&self, version: VersionId) -> Result<Vec<Content>> {
        sqlx::query_as::<_, Content>(
            r#"
            SELECT c.id, c.content_type, c.natural_key, c.metadata, c.created_at
            FROM content c
            JOIN version_content vc ON vc.content_id = c.id
            WHERE vc.version_id = ?
            ORDER BY c.id
            "#,
        )
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list version content: {}",
                e
            )))
        })
    }

    /// Whether `content` belongs to `version`
    pub async fn is_in_version(&self, version: VersionId, content: ContentId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM version_content WHERE version_id = ? AND content_id = ?",
        )
        .bind(version)
        .bind(content)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to check version membership: {}",
                e
            )))
        })?;
        Ok(found.is_some())
    }

    /// Associate content with a version
    ///
    /// Returns `false` when the association already existed.
    pub async fn add_to_version(
        conn: &mut SqliteConnection,
        version: VersionId,
        content: ContentId,
    ) -> Result<bool> {
        let mut savepoint = conn.begin().await?;
        let inserted = sqlx::query("INSERT INTO version_content (version_id, content_id) VALUES (?, ?)")
            .bind(version)
            .bind(content)
            .execute(&mut *savepoint)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::from_write(
                    "Failed to add content to version",
                    e,
                ))
            });

        match inserted {
            Ok(_) => {
                savepoint.commit().await?;
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                savepoint.rollback().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove content from a version
    ///
    /// Returns the ids whose association was actually removed; ids not in the
    /// version are ignored.
    pub async fn remove_from_version(
        conn: &mut SqliteConnection,
        version: VersionId,
        content: &[ContentId],
    ) -> Result<Vec<ContentId>> {
        if content.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_builder =
            sqlx::QueryBuilder::new("DELETE FROM version_content WHERE version_id = ");
        query_builder.push_bind(version);
        query_builder.push(" AND content_id IN (");
        let mut separated = query_builder.separated(", ");
        for id in content {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") RETURNING content_id");

        let removed = query_builder
            .build_query_scalar::<i64>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to remove content from version: {}",
                    e
                )))
            })?;

        let mut removed: Vec<ContentId> = removed.into_iter().map(ContentId::from).collect();
        removed.sort();
        Ok(removed)
    }
}
