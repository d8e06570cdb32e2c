use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the SQLite store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `path` and run migrations.
    ///
    /// `":memory:"` opens a private in-memory database backed by a single
    /// connection, so every clone of the handle sees the same data.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the database
    /// past the busy timeout, `DatabaseError::Migration` if the schema could
    /// not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // Create the file owner-only before SQLite does
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() {
                if let Some(parent) = db_path.parent().filter(|p| p.as_os_str().is_empty() || p.exists()) {
                    tracing::debug!(path = %path, parent = %parent.display(), "Creating database file");
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // connect_with reports the failure
                }
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for a competing writer.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        let pool_options = if in_memory {
            // Each in-memory connection is its own database; keep exactly one alive.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Locked => DatabaseError::Locked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        Ok(db)
    }

    /// Create all tables and indexes in a single transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. The optional search table is created by
    /// [`Database::enable_search`], not here.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                url TEXT PRIMARY KEY NOT NULL,
                title TEXT,
                link TEXT,
                updated INTEGER,
                author TEXT,
                user_title TEXT,
                http_etag TEXT,
                http_last_modified TEXT,
                stale INTEGER NOT NULL DEFAULT 0,
                last_updated INTEGER,
                added INTEGER NOT NULL,
                last_error TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // content and enclosures hold JSON arrays; enclosures is NULL when empty
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                feed_url TEXT NOT NULL REFERENCES feeds(url) ON DELETE CASCADE,
                id TEXT NOT NULL,
                updated INTEGER NOT NULL,
                title TEXT,
                link TEXT,
                author TEXT,
                published INTEGER,
                summary TEXT,
                content TEXT,
                enclosures TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                important INTEGER NOT NULL DEFAULT 0,
                last_updated INTEGER NOT NULL,
                first_updated_epoch INTEGER NOT NULL,
                feed_order INTEGER NOT NULL,
                PRIMARY KEY (feed_url, id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Feed tags use entry_id = ''
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                resource_kind TEXT NOT NULL CHECK (resource_kind IN ('feed', 'entry')),
                feed_url TEXT NOT NULL REFERENCES feeds(url) ON DELETE CASCADE,
                entry_id TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                PRIMARY KEY (resource_kind, feed_url, entry_id, name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_metadata (
                feed_url TEXT NOT NULL REFERENCES feeds(url) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (feed_url, key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Covers the default recent order
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_recent
            ON entries(updated DESC, first_updated_epoch DESC)
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed_read ON entries(feed_url, read)")
            .execute(&mut *tx)
            .await?;

        // Tag filters look up by (kind, name) when no feed is fixed
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tags_name ON tags(resource_kind, name)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        // Running migrations again must not fail
        db.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["entries", "feed_metadata", "feeds", "tags"]);
    }

    #[tokio::test]
    async fn test_clones_share_memory_database() {
        let db = Database::open(":memory:").await.unwrap();
        let other = db.clone();
        db.add_feed("https://example.com/feed.xml", chrono::Utc::now())
            .await
            .unwrap();
        assert!(other
            .get_feed("https://example.com/feed.xml")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let path = path.to_str().unwrap();

        {
            let db = Database::open(path).await.unwrap();
            db.add_feed("https://example.com/feed.xml", chrono::Utc::now())
                .await
                .unwrap();
            db.pool.close().await;
        }

        let db = Database::open(path).await.unwrap();
        assert!(db
            .get_feed("https://example.com/feed.xml")
            .await
            .unwrap()
            .is_some());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
