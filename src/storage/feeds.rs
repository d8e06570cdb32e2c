use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::entries::write_entry_updates;
use super::schema::Database;
use super::types::{
    to_micros, AddedKey, EntryUpdateIntent, FeedDbRow, FeedForUpdate, FeedForUpdateRow,
    FeedQuery, FeedSort, FeedUpdateIntent, Page, TitleKey,
};
use crate::error::{ReaderError, Result};
use crate::model::Feed;
use crate::tags::TagSubject;

const SORT_TITLE: &str = "coalesce(lower(coalesce(f.user_title, f.title)), '')";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Add a feed that has never been updated.
    ///
    /// Fails with `FeedExists` if the URL is already stored.
    pub async fn add_feed(&self, url: &str, added: DateTime<Utc>) -> Result<()> {
        let result =
            sqlx::query("INSERT INTO feeds (url, added) VALUES (?, ?) ON CONFLICT(url) DO NOTHING")
                .bind(url)
                .bind(to_micros(added))
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::FeedExists(url.to_owned()));
        }
        tracing::debug!(feed = %url, "Added feed");
        Ok(())
    }

    /// Remove a feed with its entries, tags and metadata.
    pub async fn delete_feed(&self, url: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Entries and metadata go through ON DELETE CASCADE
        sqlx::query("DELETE FROM tags WHERE feed_url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM feeds WHERE url = ?")
            .bind(url)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::FeedNotFound(url.to_owned()));
        }

        tx.commit().await?;
        tracing::debug!(feed = %url, "Deleted feed");
        Ok(())
    }

    pub async fn get_feed(&self, url: &str) -> Result<Option<Feed>> {
        let row: Option<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT f.url, f.updated, f.title, f.link, f.author, f.user_title, f.added, \
             {SORT_TITLE} AS sort_title FROM feeds f WHERE f.url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    /// One page of feeds matching `query`, in the requested order.
    pub async fn get_feeds(&self, query: &FeedQuery) -> Result<Page<Feed>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT f.url, f.updated, f.title, f.link, f.author, f.user_title, f.added, \
             {SORT_TITLE} AS sort_title FROM feeds f WHERE 1"
        ));

        if let Some(url) = &query.filter.url {
            qb.push(" AND f.url = ");
            qb.push_bind(url.clone());
        }
        if !query.filter.tags.is_unconditional() {
            qb.push(" AND ");
            query
                .filter
                .tags
                .push_sql(&mut qb, TagSubject::Feed { url: "f.url" });
        }

        match query.sort {
            FeedSort::Title => {
                if let Some(cursor) = &query.cursor {
                    let TitleKey(title, url) = cursor.decode()?;
                    qb.push(format!(" AND ({SORT_TITLE}, f.url) > ("));
                    qb.push_bind(title);
                    qb.push(", ");
                    qb.push_bind(url);
                    qb.push(")");
                }
                qb.push(" ORDER BY sort_title ASC, f.url ASC");
            }
            FeedSort::Added => {
                if let Some(cursor) = &query.cursor {
                    let AddedKey(added, url) = cursor.decode()?;
                    qb.push(" AND (f.added, f.url) < (");
                    qb.push_bind(added);
                    qb.push(", ");
                    qb.push_bind(url);
                    qb.push(")");
                }
                qb.push(" ORDER BY f.added DESC, f.url DESC");
            }
        }

        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows: Vec<FeedDbRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Page::from_rows(
            rows,
            query.limit,
            |row| row.cursor(query.sort),
            |row| Ok(row.into_feed()),
        )
    }

    /// Set or clear the user title of a feed.
    pub async fn set_feed_user_title(&self, url: &str, title: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE feeds SET user_title = ? WHERE url = ?")
            .bind(title)
            .bind(url)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::FeedNotFound(url.to_owned()));
        }
        Ok(())
    }

    // ========================================================================
    // Update State
    // ========================================================================

    /// Flag a feed so its next update rewrites every entry.
    pub async fn mark_feed_stale(&self, url: &str, stale: bool) -> Result<()> {
        let result = sqlx::query("UPDATE feeds SET stale = ? WHERE url = ?")
            .bind(stale)
            .bind(url)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::FeedNotFound(url.to_owned()));
        }
        Ok(())
    }

    /// Prior state of one feed; `None` if the feed does not exist.
    pub async fn get_feed_for_update(&self, url: &str) -> Result<Option<FeedForUpdate>> {
        let row: Option<FeedForUpdateRow> = sqlx::query_as(
            r#"
                SELECT url, updated, http_etag, http_last_modified, stale, last_updated
                FROM feeds
                WHERE url = ?
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedForUpdate::from))
    }

    /// Prior state of all feeds, or only of never-updated ones.
    pub async fn get_feeds_for_update(&self, new_only: bool) -> Result<Vec<FeedForUpdate>> {
        let rows: Vec<FeedForUpdateRow> = sqlx::query_as(
            r#"
                SELECT url, updated, http_etag, http_last_modified, stale, last_updated
                FROM feeds
                WHERE NOT ? OR last_updated IS NULL
                ORDER BY url
            "#,
        )
        .bind(new_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedForUpdate::from).collect())
    }

    /// Set or clear the error recorded by the last update attempt.
    pub async fn set_feed_error(&self, url: &str, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE feeds SET last_error = ? WHERE url = ?")
            .bind(error)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Error recorded by the last update attempt, if it failed.
    pub async fn get_feed_error(&self, url: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT last_error FROM feeds WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((error,)) => Ok(error),
            None => Err(ReaderError::FeedNotFound(url.to_owned())),
        }
    }

    /// Apply one feed intent in its own transaction.
    pub async fn apply_feed_update(&self, intent: &FeedUpdateIntent) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_feed_update(&mut tx, intent).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply a feed intent and its entry intents atomically.
    ///
    /// Fails with `FeedNotFound` (and writes nothing) if the feed was
    /// deleted since its prior state was read.
    pub async fn apply_update(
        &self,
        feed: &FeedUpdateIntent,
        entries: &[EntryUpdateIntent],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_feed_update(&mut tx, feed).await?;
        write_entry_updates(&mut tx, entries).await?;
        tx.commit().await?;

        tracing::debug!(feed = %feed.url, entries = entries.len(), "Applied update");
        Ok(())
    }
}

/// A successful update clears `stale` and `last_error`; `user_title` is never touched.
async fn write_feed_update(conn: &mut SqliteConnection, intent: &FeedUpdateIntent) -> Result<()> {
    let result = match &intent.feed {
        Some(feed) => {
            sqlx::query(
                r#"
                    UPDATE feeds SET
                        title = ?, link = ?, updated = ?, author = ?,
                        http_etag = ?, http_last_modified = ?,
                        last_updated = ?, stale = 0, last_error = NULL
                    WHERE url = ?
                "#,
            )
            .bind(&feed.title)
            .bind(&feed.link)
            .bind(feed.updated.map(to_micros))
            .bind(&feed.author)
            .bind(&intent.http_etag)
            .bind(&intent.http_last_modified)
            .bind(to_micros(intent.last_updated))
            .bind(&intent.url)
            .execute(&mut *conn)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                    UPDATE feeds SET
                        http_etag = ?, http_last_modified = ?,
                        last_updated = ?, stale = 0, last_error = NULL
                    WHERE url = ?
                "#,
            )
            .bind(&intent.http_etag)
            .bind(&intent.http_last_modified)
            .bind(to_micros(intent.last_updated))
            .bind(&intent.url)
            .execute(&mut *conn)
            .await?
        }
    };
    if result.rows_affected() == 0 {
        return Err(ReaderError::FeedNotFound(intent.url.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FeedFilter, Resource};
    use crate::tags::TagFilter;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn urls(page: &Page<Feed>) -> Vec<&str> {
        page.items.iter().map(|f| f.url.as_str()).collect()
    }

    #[tokio::test]
    async fn test_add_feed_twice_fails() {
        let db = test_db().await;
        db.add_feed("https://a", at(0)).await.unwrap();

        let err = db.add_feed("https://a", at(1)).await.unwrap_err();
        assert!(matches!(err, ReaderError::FeedExists(url) if url == "https://a"));
    }

    #[tokio::test]
    async fn test_new_feed_has_no_update_state() {
        let db = test_db().await;
        db.add_feed("https://a", at(0)).await.unwrap();

        let state = db.get_feed_for_update("https://a").await.unwrap().unwrap();
        assert_eq!(state.last_updated, None);
        assert!(!state.stale);
        assert!(db.get_feed_for_update("https://b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_feed() {
        let db = test_db().await;
        let err = db.delete_feed("https://nope").await.unwrap_err();
        assert!(matches!(err, ReaderError::FeedNotFound(_)));
    }

    #[tokio::test]
    async fn test_title_sort_is_case_insensitive_with_user_title() {
        let db = test_db().await;
        for (i, url) in ["https://1", "https://2", "https://3", "https://4"].iter().enumerate() {
            db.add_feed(url, at(i as i64)).await.unwrap();
        }
        let titles = [("https://1", "beta"), ("https://2", "Alpha"), ("https://3", "zeta")];
        for (url, title) in titles {
            db.apply_feed_update(&FeedUpdateIntent {
                url: url.into(),
                last_updated: at(10),
                feed: Some(Feed {
                    title: Some(title.into()),
                    ..Feed::new(url)
                }),
                http_etag: None,
                http_last_modified: None,
            })
            .await
            .unwrap();
        }
        db.set_feed_user_title("https://3", Some("Aardvark"))
            .await
            .unwrap();

        let page = db.get_feeds(&FeedQuery::default()).await.unwrap();
        // untitled first, then aardvark, alpha, beta
        assert_eq!(urls(&page), vec!["https://4", "https://3", "https://2", "https://1"]);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_paginate_added_order() {
        let db = test_db().await;
        for i in 0..5 {
            db.add_feed(&format!("https://{}", i), at(i)).await.unwrap();
        }

        let mut query = FeedQuery {
            sort: FeedSort::Added,
            limit: Some(2),
            ..FeedQuery::default()
        };
        let mut seen = Vec::new();
        loop {
            let page = db.get_feeds(&query).await.unwrap();
            seen.extend(page.items.iter().map(|f| f.url.clone()));
            match page.next {
                Some(cursor) => query.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(
            seen,
            vec!["https://4", "https://3", "https://2", "https://1", "https://0"]
        );
    }

    #[tokio::test]
    async fn test_paginate_title_order_matches_unpaginated() {
        let db = test_db().await;
        for (i, title) in ["b", "B", "a", "", "c"].iter().enumerate() {
            let url = format!("https://{}", i);
            db.add_feed(&url, at(i as i64)).await.unwrap();
            db.set_feed_user_title(&url, Some(title)).await.unwrap();
        }

        let all = db.get_feeds(&FeedQuery::default()).await.unwrap();
        let mut query = FeedQuery {
            limit: Some(2),
            ..FeedQuery::default()
        };
        let mut paged = Vec::new();
        loop {
            let page = db.get_feeds(&query).await.unwrap();
            paged.extend(page.items);
            match page.next {
                Some(cursor) => query.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(paged, all.items);
    }

    #[tokio::test]
    async fn test_get_feeds_by_tag() {
        let db = test_db().await;
        db.add_feed("https://a", at(0)).await.unwrap();
        db.add_feed("https://b", at(1)).await.unwrap();
        db.set_tag(Resource::Feed("https://a"), "tech").await.unwrap();

        let query = FeedQuery {
            filter: FeedFilter {
                tags: "tech".parse::<TagFilter>().unwrap(),
                ..FeedFilter::default()
            },
            ..FeedQuery::default()
        };
        assert_eq!(urls(&db.get_feeds(&query).await.unwrap()), vec!["https://a"]);

        let query = FeedQuery {
            filter: FeedFilter {
                tags: "-tech".parse::<TagFilter>().unwrap(),
                ..FeedFilter::default()
            },
            ..FeedQuery::default()
        };
        assert_eq!(urls(&db.get_feeds(&query).await.unwrap()), vec!["https://b"]);
    }

    #[tokio::test]
    async fn test_feeds_for_update_new_only() {
        let db = test_db().await;
        db.add_feed("https://a", at(0)).await.unwrap();
        db.add_feed("https://b", at(1)).await.unwrap();
        db.apply_feed_update(&FeedUpdateIntent {
            url: "https://a".into(),
            last_updated: at(5),
            feed: None,
            http_etag: Some("\"v1\"".into()),
            http_last_modified: None,
        })
        .await
        .unwrap();

        let all = db.get_feeds_for_update(false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].http_etag.as_deref(), Some("\"v1\""));
        assert_eq!(all[0].last_updated, Some(at(5)));

        let new: Vec<String> = db
            .get_feeds_for_update(true)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.url)
            .collect();
        assert_eq!(new, vec!["https://b".to_string()]);
    }

    #[tokio::test]
    async fn test_feed_update_clears_stale_and_error_but_keeps_user_title() {
        let db = test_db().await;
        db.add_feed("https://a", at(0)).await.unwrap();
        db.set_feed_user_title("https://a", Some("Mine")).await.unwrap();
        db.mark_feed_stale("https://a", true).await.unwrap();
        db.set_feed_error("https://a", Some("timeout")).await.unwrap();

        db.apply_feed_update(&FeedUpdateIntent {
            url: "https://a".into(),
            last_updated: at(5),
            feed: Some(Feed {
                title: Some("Theirs".into()),
                updated: Some(at(3)),
                ..Feed::new("https://a")
            }),
            http_etag: None,
            http_last_modified: None,
        })
        .await
        .unwrap();

        let state = db.get_feed_for_update("https://a").await.unwrap().unwrap();
        assert!(!state.stale);
        assert_eq!(state.updated, Some(at(3)));
        assert_eq!(db.get_feed_error("https://a").await.unwrap(), None);

        let feed = db.get_feed("https://a").await.unwrap().unwrap();
        assert_eq!(feed.title.as_deref(), Some("Theirs"));
        assert_eq!(feed.user_title.as_deref(), Some("Mine"));
    }

    #[tokio::test]
    async fn test_apply_update_for_deleted_feed_fails() {
        let db = test_db().await;
        let err = db
            .apply_update(
                &FeedUpdateIntent {
                    url: "https://gone".into(),
                    last_updated: at(0),
                    feed: None,
                    http_etag: None,
                    http_last_modified: None,
                },
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::FeedNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_feed_errors() {
        let db = test_db().await;
        assert!(matches!(
            db.set_feed_user_title("https://x", None).await,
            Err(ReaderError::FeedNotFound(_))
        ));
        assert!(matches!(
            db.mark_feed_stale("https://x", true).await,
            Err(ReaderError::FeedNotFound(_))
        ));
        assert!(matches!(
            db.get_feed_error("https://x").await,
            Err(ReaderError::FeedNotFound(_))
        ));
    }
}
