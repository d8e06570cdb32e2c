use std::collections::BTreeSet;

use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::Resource;
use crate::error::{ReaderError, Result};

async fn resource_exists(conn: &mut SqliteConnection, resource: Resource<'_>) -> Result<bool> {
    let row: Option<(i64,)> = match resource {
        Resource::Feed(url) => {
            sqlx::query_as("SELECT 1 FROM feeds WHERE url = ?")
                .bind(url)
                .fetch_optional(&mut *conn)
                .await?
        }
        Resource::Entry(feed_url, id) => {
            sqlx::query_as("SELECT 1 FROM entries WHERE feed_url = ? AND id = ?")
                .bind(feed_url)
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
        }
    };
    Ok(row.is_some())
}

impl Database {
    // ========================================================================
    // Tag Operations
    // ========================================================================

    /// Tag a feed or entry. Setting a tag it already has is a no-op.
    pub async fn set_tag(&self, resource: Resource<'_>, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ReaderError::InvalidArgument("tag name is empty".into()));
        }

        let mut tx = self.pool.begin().await?;
        if !resource_exists(&mut tx, resource).await? {
            return Err(resource.not_found());
        }
        sqlx::query(
            "INSERT OR IGNORE INTO tags (resource_kind, feed_url, entry_id, name) VALUES (?, ?, ?, ?)",
        )
        .bind(resource.kind())
        .bind(resource.feed_url())
        .bind(resource.entry_id())
        .bind(name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a tag. Removing a tag the resource does not have is a no-op.
    pub async fn remove_tag(&self, resource: Resource<'_>, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !resource_exists(&mut tx, resource).await? {
            return Err(resource.not_found());
        }
        sqlx::query(
            "DELETE FROM tags WHERE resource_kind = ? AND feed_url = ? AND entry_id = ? AND name = ?",
        )
        .bind(resource.kind())
        .bind(resource.feed_url())
        .bind(resource.entry_id())
        .bind(name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_tags(&self, resource: Resource<'_>) -> Result<BTreeSet<String>> {
        let mut conn = self.pool.acquire().await?;
        if !resource_exists(&mut conn, resource).await? {
            return Err(resource.not_found());
        }
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM tags WHERE resource_kind = ? AND feed_url = ? AND entry_id = ?",
        )
        .bind(resource.kind())
        .bind(resource.feed_url())
        .bind(resource.entry_id())
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
