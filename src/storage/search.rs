use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::entries::push_entry_filter;
use super::schema::Database;
use super::types::EntryFilter;
use crate::error::{ReaderError, Result};
use crate::feed::{SearchIndex, UpdateResult};
use crate::model::{Content, EntrySearchResult};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;
const MAX_AND_OPERATORS: usize = 10;

/// Reject queries whose wildcard expansion or nesting would be expensive.
fn validate_fts_query(query: &str) -> Result<()> {
    let fail = |message: String| Err(ReaderError::Search(message));

    if query.len() > MAX_QUERY_LENGTH {
        return fail(format!(
            "query exceeds maximum length of {} characters",
            MAX_QUERY_LENGTH
        ));
    }
    if query.matches('*').count() > MAX_WILDCARDS {
        return fail(format!("query contains too many wildcards (max {})", MAX_WILDCARDS));
    }

    let upper = query.to_uppercase();
    if upper.matches(" OR ").count() > MAX_OR_OPERATORS {
        return fail(format!(
            "query contains too many OR operators (max {})",
            MAX_OR_OPERATORS
        ));
    }
    if upper.matches(" AND ").count() > MAX_AND_OPERATORS {
        return fail(format!(
            "query contains too many AND operators (max {})",
            MAX_AND_OPERATORS
        ));
    }

    let open = query.chars().filter(|&c| c == '(').count();
    let close = query.chars().filter(|&c| c == ')').count();
    if open > MAX_PARENTHESES {
        return fail(format!(
            "query contains too many parentheses (max {})",
            MAX_PARENTHESES
        ));
    }
    if open != close {
        return fail("query has unbalanced parentheses".into());
    }

    Ok(())
}

// ============================================================================
// Documents
// ============================================================================

/// Rendering width for indexed text; wide enough that lines are never wrapped.
const DOCUMENT_WIDTH: usize = 10_000;

/// Markup rendered to plain text with entities decoded.
fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), DOCUMENT_WIDTH)
}

/// Searchable body of an entry: summary plus all textual content.
fn entry_document(summary: Option<&str>, content: &[Content]) -> String {
    let textual = content.iter().filter(|c| {
        c.content_type
            .as_deref()
            .map_or(true, |t| t.starts_with("text/") || t.ends_with("xhtml+xml"))
    });
    summary
        .into_iter()
        .chain(textual.map(|c| c.value.as_str()))
        .map(html_to_text)
        .collect::<Vec<_>>()
        .join("\n")
}

async fn index_document(
    conn: &mut SqliteConnection,
    feed_url: &str,
    entry_id: &str,
    title: Option<&str>,
    body: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM entries_search WHERE feed_url = ? AND entry_id = ?")
        .bind(feed_url)
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
            INSERT INTO entries_search (title, content, feed, feed_url, entry_id)
            VALUES (?, ?, (SELECT coalesce(user_title, title) FROM feeds WHERE url = ?), ?, ?)
        "#,
    )
    .bind(title)
    .bind(body)
    .bind(feed_url)
    .bind(feed_url)
    .bind(entry_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Database {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Create the search index and fill it from the stored entries.
    /// Enabling an enabled index is a no-op.
    pub async fn enable_search(&self) -> Result<()> {
        if self.is_search_enabled().await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE entries_search USING fts5(
                title, content, feed,
                feed_url UNINDEXED, entry_id UNINDEXED,
                tokenize = 'porter unicode61 remove_diacritics 1'
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Inserts and updates are indexed after each update commits; deletes follow the entry
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS entries_search_delete AFTER DELETE ON entries BEGIN
                DELETE FROM entries_search
                WHERE feed_url = old.feed_url AND entry_id = old.id;
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        let rows: Vec<(String, String, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT feed_url, id, title, summary, content FROM entries")
                .fetch_all(&mut *tx)
                .await?;
        let count = rows.len();
        for (feed_url, id, title, summary, content) in rows {
            let content: Vec<Content> = match content {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            };
            let body = entry_document(summary.as_deref(), &content);
            index_document(&mut tx, &feed_url, &id, title.as_deref(), &body).await?;
        }

        tx.commit().await?;
        tracing::info!(entries = count, "Enabled search");
        Ok(())
    }

    /// Drop the search index.
    pub async fn disable_search(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TRIGGER IF EXISTS entries_search_delete")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS entries_search")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn is_search_enabled(&self) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'entries_search'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Entries matching a full-text query, best match first.
    ///
    /// An empty or whitespace-only query matches nothing.
    pub async fn search_entries(
        &self,
        query: &str,
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<EntrySearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        validate_fts_query(query)?;
        filter.validate()?;
        if !self.is_search_enabled().await? {
            return Err(ReaderError::SearchNotEnabled);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT entries_search.feed_url, entries_search.entry_id, e.title
            FROM entries_search
            JOIN entries e ON e.feed_url = entries_search.feed_url AND e.id = entries_search.entry_id
            JOIN feeds f ON f.url = e.feed_url
            WHERE entries_search MATCH "#,
        );
        qb.push_bind(query);
        push_entry_filter(&mut qb, filter);
        qb.push(" ORDER BY rank LIMIT ").push_bind(limit as i64);

        let rows: Vec<(String, String, Option<String>)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            // The statement itself is fixed; database errors come from the MATCH expression
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    return ReaderError::Search(format!(
                        "invalid query {:?}: {}",
                        query,
                        db_err.message()
                    ));
                }
                ReaderError::from(e)
            })?;

        tracing::debug!(query = %query, results = rows.len(), "Searched entries");
        Ok(rows
            .into_iter()
            .map(|(feed_url, id, title)| EntrySearchResult { feed_url, id, title })
            .collect())
    }
}

#[async_trait]
impl SearchIndex for Database {
    /// Index the entries one update wrote. No-op while search is disabled.
    async fn index(&self, feed_url: &str, result: &UpdateResult) -> Result<()> {
        if result.entries.is_empty() || !self.is_search_enabled().await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for updated in &result.entries {
            let entry = &updated.entry;
            let body = entry_document(entry.summary.as_deref(), &entry.content);
            index_document(&mut tx, feed_url, &entry.id, entry.title.as_deref(), &body).await?;
        }
        tx.commit().await?;

        tracing::debug!(feed = %feed_url, entries = result.entries.len(), "Indexed entries");
        Ok(())
    }
}
