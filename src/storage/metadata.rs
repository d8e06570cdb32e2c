use serde_json::Value;

use super::schema::Database;
use crate::error::{ReaderError, Result};

impl Database {
    // ========================================================================
    // Feed Metadata
    // ========================================================================

    pub async fn get_feed_metadata(&self, feed_url: &str, key: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM feed_metadata WHERE feed_url = ? AND key = ?")
                .bind(feed_url)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| serde_json::from_str(&json).map_err(Into::into))
            .transpose()
    }

    /// All metadata of a feed ordered by key, or only `key` if given.
    pub async fn iter_feed_metadata(
        &self,
        feed_url: &str,
        key: Option<&str>,
    ) -> Result<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
                SELECT key, value FROM feed_metadata
                WHERE feed_url = ? AND (? IS NULL OR key = ?)
                ORDER BY key
            "#,
        )
        .bind(feed_url)
        .bind(key)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, json)| -> Result<(String, Value)> {
                Ok((key, serde_json::from_str(&json)?))
            })
            .collect()
    }

    pub async fn set_feed_metadata(&self, feed_url: &str, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM feeds WHERE url = ?")
            .bind(feed_url)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(ReaderError::FeedNotFound(feed_url.to_owned()));
        }

        sqlx::query(
            r#"
                INSERT INTO feed_metadata (feed_url, key, value) VALUES (?, ?, ?)
                ON CONFLICT(feed_url, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(feed_url)
        .bind(key)
        .bind(json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_feed_metadata(&self, feed_url: &str, key: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM feed_metadata WHERE feed_url = ? AND key = ?")
            .bind(feed_url)
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::MetadataNotFound {
                feed_url: feed_url.to_owned(),
                key: key.to_owned(),
            });
        }
        Ok(())
    }
}
