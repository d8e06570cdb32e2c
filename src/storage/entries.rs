use std::collections::HashMap;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::schema::Database;
use super::types::{
    from_micros, to_micros, EntryCounts, EntryDbRow, EntryFilter, EntryForUpdate, EntryQuery,
    EntrySort, EntryUpdateIntent, Page, RecentKey,
};
use crate::error::{ReaderError, Result};
use crate::model::Entry;
use crate::tags::TagSubject;

const ENTRY_SELECT: &str = r#"
    SELECT
        e.feed_url, e.id, e.updated, e.title, e.link, e.author, e.published, e.summary,
        e.content, e.enclosures, e.read, e.important, e.first_updated_epoch, e.feed_order,
        f.updated AS feed_updated, f.title AS feed_title, f.link AS feed_link,
        f.author AS feed_author, f.user_title AS feed_user_title
    FROM entries e
    JOIN feeds f ON f.url = e.feed_url
    WHERE 1"#;

/// Append ` AND ...` conditions for every set filter option.
pub(super) fn push_entry_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &EntryFilter) {
    if let Some(feed_url) = &filter.feed_url {
        qb.push(" AND e.feed_url = ").push_bind(feed_url.clone());
    }
    if let Some(id) = &filter.entry_id {
        qb.push(" AND e.id = ").push_bind(id.clone());
    }
    if let Some(read) = filter.read {
        qb.push(" AND e.read = ").push_bind(read);
    }
    if let Some(important) = filter.important {
        qb.push(" AND e.important = ").push_bind(important);
    }
    match filter.has_enclosures {
        Some(true) => {
            qb.push(" AND e.enclosures IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND e.enclosures IS NULL");
        }
        None => {}
    }
    if !filter.tags.is_unconditional() {
        qb.push(" AND ");
        filter.tags.push_sql(
            qb,
            TagSubject::Entry {
                feed_url: "e.feed_url",
                id: "e.id",
            },
        );
    }
    if !filter.feed_tags.is_unconditional() {
        qb.push(" AND ");
        filter
            .feed_tags
            .push_sql(qb, TagSubject::Feed { url: "e.feed_url" });
    }
}

impl Database {
    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// One page of entries matching `query`.
    ///
    /// The recent order is `updated`, then `first_updated_epoch`, all
    /// descending; entries tied on both keep their order in the feed.
    pub async fn get_entries(&self, query: &EntryQuery) -> Result<Page<Entry>> {
        query.filter.validate()?;
        if query.sort == EntrySort::Random && query.cursor.is_some() {
            return Err(ReaderError::InvalidArgument(
                "cursor is not supported with random sort".into(),
            ));
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(ENTRY_SELECT);
        push_entry_filter(&mut qb, &query.filter);

        match query.sort {
            EntrySort::Recent => {
                if let Some(cursor) = &query.cursor {
                    let RecentKey(updated, first_updated_epoch, neg_feed_order, feed_url, id) =
                        cursor.decode()?;
                    qb.push(
                        " AND (e.updated, e.first_updated_epoch, -e.feed_order, e.feed_url, e.id) < (",
                    );
                    let mut key = qb.separated(", ");
                    key.push_bind(updated);
                    key.push_bind(first_updated_epoch);
                    key.push_bind(neg_feed_order);
                    key.push_bind(feed_url);
                    key.push_bind(id);
                    key.push_unseparated(")");
                }
                qb.push(
                    " ORDER BY e.updated DESC, e.first_updated_epoch DESC, \
                     -e.feed_order DESC, e.feed_url DESC, e.id DESC",
                );
            }
            EntrySort::Random => {
                qb.push(" ORDER BY random()");
            }
        }

        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<EntryDbRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let page_limit = match query.sort {
            EntrySort::Recent => query.limit,
            EntrySort::Random => None,
        };
        Page::from_rows(rows, page_limit, EntryDbRow::cursor, EntryDbRow::into_entry)
    }

    pub async fn get_entry(&self, feed_url: &str, id: &str) -> Result<Option<Entry>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(ENTRY_SELECT);
        qb.push(" AND e.feed_url = ").push_bind(feed_url);
        qb.push(" AND e.id = ").push_bind(id);

        let row: Option<EntryDbRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        row.map(EntryDbRow::into_entry).transpose()
    }

    /// Counts over the entries matching `filter`.
    pub async fn get_entry_counts(&self, filter: &EntryFilter) -> Result<EntryCounts> {
        filter.validate()?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(e.read), 0),
                COALESCE(SUM(e.important), 0),
                COALESCE(SUM(e.enclosures IS NOT NULL), 0)
            FROM entries e
            JOIN feeds f ON f.url = e.feed_url
            WHERE 1"#,
        );
        push_entry_filter(&mut qb, filter);

        let (total, read, important, has_enclosures): (i64, i64, i64, i64) =
            qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(EntryCounts {
            total: total as u64,
            read: read as u64,
            important: important as u64,
            has_enclosures: has_enclosures as u64,
        })
    }

    // ========================================================================
    // User Flags
    // ========================================================================

    pub async fn set_entry_read(&self, feed_url: &str, id: &str, read: bool) -> Result<()> {
        self.set_entry_flag("read", feed_url, id, read).await
    }

    pub async fn set_entry_important(&self, feed_url: &str, id: &str, important: bool) -> Result<()> {
        self.set_entry_flag("important", feed_url, id, important).await
    }

    async fn set_entry_flag(&self, column: &str, feed_url: &str, id: &str, value: bool) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE entries SET {column} = ? WHERE feed_url = ? AND id = ?"
        ))
        .bind(value)
        .bind(feed_url)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::EntryNotFound {
                feed_url: feed_url.to_owned(),
                entry_id: id.to_owned(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Update Support
    // ========================================================================

    /// Prior state of the given entries of one feed, keyed by id.
    /// Ids with no stored entry are absent from the map.
    pub async fn get_entries_for_update(
        &self,
        feed_url: &str,
        ids: &[&str],
    ) -> Result<HashMap<String, EntryForUpdate>> {
        const BATCH_SIZE: usize = 500;
        let mut found = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(BATCH_SIZE) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, updated, first_updated_epoch FROM entries WHERE feed_url = ",
            );
            qb.push_bind(feed_url);
            qb.push(" AND id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String, i64, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;
            for (id, updated, first_updated_epoch) in rows {
                let Some(first_updated_epoch) = from_micros(first_updated_epoch) else {
                    tracing::warn!(feed = %feed_url, entry = %id, "Stored first_updated_epoch out of range");
                    continue;
                };
                found.insert(
                    id,
                    EntryForUpdate {
                        updated: from_micros(updated),
                        first_updated_epoch,
                    },
                );
            }
        }

        Ok(found)
    }

    /// Apply entry intents in their own transaction.
    pub async fn apply_entry_updates(&self, intents: &[EntryUpdateIntent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_entry_updates(&mut tx, intents).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Insert or overwrite entries. `read` and `important` survive overwrites.
pub(super) async fn write_entry_updates(
    conn: &mut SqliteConnection,
    intents: &[EntryUpdateIntent],
) -> Result<()> {
    if intents.is_empty() {
        return Ok(());
    }

    // JSON columns; enclosures stays NULL when empty so has_enclosures is a NULL check
    let mut rows = Vec::with_capacity(intents.len());
    for intent in intents {
        let content = if intent.entry.content.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&intent.entry.content)?)
        };
        let enclosures = if intent.entry.enclosures.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&intent.entry.enclosures)?)
        };
        rows.push((intent, content, enclosures));
    }

    const BATCH_SIZE: usize = 50;
    for chunk in rows.chunks(BATCH_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO entries (feed_url, id, updated, title, link, author, published, \
             summary, content, enclosures, last_updated, first_updated_epoch, feed_order) ",
        );
        qb.push_values(chunk, |mut b, (intent, content, enclosures)| {
            let entry = &intent.entry;
            b.push_bind(&intent.feed_url)
                .push_bind(&entry.id)
                .push_bind(entry.updated.map(to_micros))
                .push_bind(&entry.title)
                .push_bind(&entry.link)
                .push_bind(&entry.author)
                .push_bind(entry.published.map(to_micros))
                .push_bind(&entry.summary)
                .push_bind(content)
                .push_bind(enclosures)
                .push_bind(to_micros(intent.last_updated))
                .push_bind(to_micros(intent.first_updated_epoch))
                .push_bind(intent.feed_order);
        });
        qb.push(
            " ON CONFLICT(feed_url, id) DO UPDATE SET \
             updated = excluded.updated, title = excluded.title, link = excluded.link, \
             author = excluded.author, published = excluded.published, \
             summary = excluded.summary, content = excluded.content, \
             enclosures = excluded.enclosures, last_updated = excluded.last_updated, \
             first_updated_epoch = excluded.first_updated_epoch, \
             feed_order = excluded.feed_order",
        );
        qb.build().execute(&mut *conn).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Enclosure, Feed};
    use crate::storage::{FeedUpdateIntent, Resource};
    use crate::tags::TagFilter;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn intent(feed_url: &str, id: &str, updated: i64, epoch: i64, order: i64) -> EntryUpdateIntent {
        EntryUpdateIntent {
            feed_url: feed_url.into(),
            entry: Entry {
                title: Some(format!("Entry {}", id)),
                ..Entry::new(id, Some(at(updated)))
            },
            last_updated: at(epoch),
            first_updated_epoch: at(epoch),
            feed_order: order,
        }
    }

    async fn seed(db: &Database, feed_url: &str, intents: &[EntryUpdateIntent]) {
        if db.get_feed(feed_url).await.unwrap().is_none() {
            db.add_feed(feed_url, at(0)).await.unwrap();
        }
        db.apply_update(
            &FeedUpdateIntent {
                url: feed_url.into(),
                last_updated: at(100),
                feed: Some(Feed {
                    title: Some("Feed".into()),
                    ..Feed::new(feed_url)
                }),
                http_etag: None,
                http_last_modified: None,
            },
            intents,
        )
        .await
        .unwrap();
    }

    fn ids(page: &Page<Entry>) -> Vec<&str> {
        page.items.iter().map(|e| e.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_entries_carry_feed_snapshot() {
        let db = test_db().await;
        seed(&db, "https://a", &[intent("https://a", "1", 1, 10, 0)]).await;

        let entry = db.get_entry("https://a", "1").await.unwrap().unwrap();
        assert_eq!(entry.feed_url(), Some("https://a"));
        assert_eq!(entry.feed.unwrap().title.as_deref(), Some("Feed"));
        assert_eq!(entry.updated, Some(at(1)));
        assert!(db.get_entry("https://a", "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_order_with_ties() {
        let db = test_db().await;
        // same updated and epoch: feed order decides, first in feed first
        seed(
            &db,
            "https://a",
            &[
                intent("https://a", "three", 5, 10, 0),
                intent("https://a", "two", 5, 10, 1),
                intent("https://a", "four", 5, 10, 2),
                intent("https://a", "one", 5, 10, 3),
                intent("https://a", "newest", 9, 10, 4),
                intent("https://a", "oldest", 1, 10, 5),
            ],
        )
        .await;

        let page = db.get_entries(&EntryQuery::default()).await.unwrap();
        assert_eq!(
            ids(&page),
            vec!["newest", "three", "two", "four", "one", "oldest"]
        );
    }

    #[tokio::test]
    async fn test_first_updated_epoch_breaks_updated_ties() {
        let db = test_db().await;
        seed(&db, "https://a", &[intent("https://a", "early", 5, 10, 0)]).await;
        seed(&db, "https://b", &[intent("https://b", "late", 5, 20, 0)]).await;

        let page = db.get_entries(&EntryQuery::default()).await.unwrap();
        assert_eq!(ids(&page), vec!["late", "early"]);
    }

    #[tokio::test]
    async fn test_cursor_pages_cover_everything_once() {
        let db = test_db().await;
        let intents: Vec<_> = (0..7)
            .map(|i| intent("https://a", &i.to_string(), i % 3, 10, i))
            .collect();
        seed(&db, "https://a", &intents).await;

        let all = db.get_entries(&EntryQuery::default()).await.unwrap();
        let mut query = EntryQuery {
            limit: Some(3),
            ..EntryQuery::default()
        };
        let mut paged = Vec::new();
        loop {
            let page = db.get_entries(&query).await.unwrap();
            paged.extend(page.items);
            match page.next {
                Some(cursor) => query.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(paged, all.items);
        assert_eq!(paged.len(), 7);
    }

    #[tokio::test]
    async fn test_random_sort_rejects_cursor() {
        let db = test_db().await;
        seed(&db, "https://a", &[intent("https://a", "1", 1, 10, 0), intent("https://a", "2", 2, 10, 1)]).await;

        let query = EntryQuery {
            sort: EntrySort::Random,
            limit: Some(1),
            ..EntryQuery::default()
        };
        let page = db.get_entries(&query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next.is_none());

        let query = EntryQuery {
            cursor: Some("[0,0,0,\"a\",\"b\"]".parse().unwrap()),
            ..query
        };
        assert!(matches!(
            db.get_entries(&query).await,
            Err(ReaderError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_preserves_user_flags() {
        let db = test_db().await;
        seed(&db, "https://a", &[intent("https://a", "1", 1, 10, 0)]).await;
        db.set_entry_read("https://a", "1", true).await.unwrap();
        db.set_entry_important("https://a", "1", true).await.unwrap();

        let mut changed = intent("https://a", "1", 2, 10, 0);
        changed.entry.title = Some("Changed".into());
        seed(&db, "https://a", &[changed]).await;

        let entry = db.get_entry("https://a", "1").await.unwrap().unwrap();
        assert_eq!(entry.title.as_deref(), Some("Changed"));
        assert!(entry.read);
        assert!(entry.important);
    }

    #[tokio::test]
    async fn test_flag_missing_entry() {
        let db = test_db().await;
        let err = db.set_entry_read("https://a", "1", true).await.unwrap_err();
        assert!(matches!(err, ReaderError::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_filters_and_counts() {
        let db = test_db().await;
        let mut with_enclosure = intent("https://a", "2", 2, 10, 1);
        with_enclosure.entry.enclosures = vec![Enclosure {
            href: "https://a/ep.mp3".into(),
            content_type: Some("audio/mpeg".into()),
            length: None,
        }];
        seed(
            &db,
            "https://a",
            &[intent("https://a", "1", 1, 10, 0), with_enclosure],
        )
        .await;
        seed(&db, "https://b", &[intent("https://b", "3", 3, 10, 0)]).await;
        db.set_entry_read("https://a", "1", true).await.unwrap();
        db.set_entry_important("https://b", "3", true).await.unwrap();

        let counts = db.get_entry_counts(&EntryFilter::default()).await.unwrap();
        assert_eq!(
            counts,
            EntryCounts {
                total: 3,
                read: 1,
                important: 1,
                has_enclosures: 1
            }
        );

        let filter = EntryFilter {
            read: Some(false),
            ..EntryFilter::for_feed("https://a")
        };
        let page = db
            .get_entries(&EntryQuery {
                filter,
                ..EntryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["2"]);
        assert!(!page.items[0].enclosures.is_empty());

        let filter = EntryFilter {
            has_enclosures: Some(false),
            ..EntryFilter::default()
        };
        assert_eq!(db.get_entry_counts(&filter).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_entry_and_feed_tag_filters() {
        let db = test_db().await;
        seed(&db, "https://a", &[intent("https://a", "1", 1, 10, 0), intent("https://a", "2", 2, 10, 1)]).await;
        seed(&db, "https://b", &[intent("https://b", "3", 3, 10, 0)]).await;
        db.set_tag(Resource::Entry("https://a", "1"), "saved").await.unwrap();
        db.set_tag(Resource::Feed("https://b"), "news").await.unwrap();

        let query = EntryQuery {
            filter: EntryFilter {
                tags: "saved".parse::<TagFilter>().unwrap(),
                ..EntryFilter::default()
            },
            ..EntryQuery::default()
        };
        assert_eq!(ids(&db.get_entries(&query).await.unwrap()), vec!["1"]);

        let query = EntryQuery {
            filter: EntryFilter {
                feed_tags: "news".parse::<TagFilter>().unwrap(),
                ..EntryFilter::default()
            },
            ..EntryQuery::default()
        };
        assert_eq!(ids(&db.get_entries(&query).await.unwrap()), vec!["3"]);

        let query = EntryQuery {
            filter: EntryFilter {
                feed_tags: "-news".parse::<TagFilter>().unwrap(),
                tags: "-saved".parse::<TagFilter>().unwrap(),
                ..EntryFilter::default()
            },
            ..EntryQuery::default()
        };
        assert_eq!(ids(&db.get_entries(&query).await.unwrap()), vec!["2"]);
    }

    #[tokio::test]
    async fn test_entries_for_update_lookup() {
        let db = test_db().await;
        seed(&db, "https://a", &[intent("https://a", "1", 1, 10, 0)]).await;

        let found = db
            .get_entries_for_update("https://a", &["1", "2"])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found["1"],
            EntryForUpdate {
                updated: Some(at(1)),
                first_updated_epoch: at(10),
            }
        );
        assert!(db
            .get_entries_for_update("https://b", &["1"])
            .await
            .unwrap()
            .is_empty());
    }
}
