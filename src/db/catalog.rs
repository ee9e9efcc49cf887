//! Deferred download catalog.
//!
//! Records where each file of committed content can be fetched later, per
//! remote, so content committed without its bytes can be completed on demand.

use crate::error::DatabaseError;
use crate::types::ContentId;
use crate::{Error, Result};
use sqlx::SqliteConnection;

use super::{CatalogEntry, Database, NewCatalogEntry, now};

impl Database {
    /// Record a catalog entry
    ///
    /// Returns `false` if the entry was already recorded.
    pub async fn record_catalog_entry(
        conn: &mut SqliteConnection,
        entry: &NewCatalogEntry,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO download_catalog
                (remote, content_id, relative_path, url, size, digests, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(remote, content_id, relative_path) DO NOTHING
            "#,
        )
        .bind(&entry.remote)
        .bind(entry.content_id)
        .bind(&entry.relative_path)
        .bind(&entry.url)
        .bind(entry.size.map(|s| s as i64))
        .bind(serde_json::to_string(&entry.digests)?)
        .bind(now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record catalog entry: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete the catalog entries `remote` recorded for the given content
    ///
    /// Entries of other remotes are kept.
    pub async fn delete_catalog_entries(
        conn: &mut SqliteConnection,
        remote: &str,
        content: &[ContentId],
    ) -> Result<u64> {
        if content.is_empty() {
            return Ok(0);
        }

        let mut query_builder =
            sqlx::QueryBuilder::new("DELETE FROM download_catalog WHERE remote = ");
        query_builder.push_bind(remote);
        query_builder.push(" AND content_id IN (");
        let mut separated = query_builder.separated(", ");
        for id in content {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query_builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete catalog entries: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Catalog entries recorded for a remote, ordered by content and path
    pub async fn catalog_entries(&self, remote: &str) -> Result<Vec<CatalogEntry>> {
        sqlx::query_as::<_, CatalogEntry>(
            r#"
            SELECT id, remote, content_id, relative_path, url, size, digests, created_at
            FROM download_catalog
            WHERE remote = ?
            ORDER BY content_id, relative_path
            "#,
        )
        .bind(remote)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list catalog entries: {}",
                e
            )))
        })
    }

    /// Catalog entries of one content item, across remotes
    pub async fn catalog_entries_for_content(
        &self,
        content: ContentId,
    ) -> Result<Vec<CatalogEntry>> {
        sqlx::query_as::<_, CatalogEntry>(
            r#"
            SELECT id, remote, content_id, relative_path, url, size, digests, created_at
            FROM download_catalog
            WHERE content_id = ?
            ORDER BY remote, relative_path
            "#,
        )
        .bind(content)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list catalog entries for content: {}",
                e
            )))
        })
    }
}
