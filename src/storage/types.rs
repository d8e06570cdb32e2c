use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ReaderError, Result};
use crate::model::{Content, Enclosure, Entry, Feed};
use crate::tags::TagFilter;

// ============================================================================
// Error Types
// ============================================================================

/// Storage failures. Fatal to the operation, never retried internally.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock past the busy timeout
    #[error("Database is locked by another process")]
    Locked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Uniqueness or foreign-key constraint violated
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A stored JSON column could not be read back, or a value could not be stored
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                return DatabaseError::Integrity(db_err.message().to_owned());
            }
        }

        // SQLITE_BUSY (5) / SQLITE_LOCKED (6)
        let error_string = err.to_string().to_lowercase();
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Time Conversion
// ============================================================================

// Timestamps are stored as INTEGER microseconds since the epoch.

pub(crate) fn to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

/// Truncate to the precision timestamps are stored with.
pub(crate) fn truncate_to_storage(dt: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(to_micros(dt)).unwrap_or(dt)
}

// ============================================================================
// Update Read/Write Models
// ============================================================================

/// Prior state of a feed, used to decide what an update must change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForUpdate {
    pub url: String,
    /// When the feed was last updated, according to the feed.
    pub updated: Option<DateTime<Utc>>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    /// Forces the next update to rewrite every entry.
    pub stale: bool,
    /// When the feed was last successfully updated; `None` if never.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Prior state of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryForUpdate {
    pub updated: Option<DateTime<Utc>>,
    pub first_updated_epoch: DateTime<Utc>,
}

/// Feed-level changes applied by one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedUpdateIntent {
    pub url: String,
    /// Start time of this feed's update cycle.
    pub last_updated: DateTime<Utc>,
    /// New feed metadata; `None` leaves the stored metadata untouched.
    pub feed: Option<Feed>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
}

/// One entry to insert or overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdateIntent {
    pub feed_url: String,
    /// The entry, with `updated` always set.
    pub entry: Entry,
    pub last_updated: DateTime<Utc>,
    /// Preserved from the stored entry, or the batch start time for new ones.
    pub first_updated_epoch: DateTime<Utc>,
    /// Zero-based position of the entry in the parsed feed.
    pub feed_order: i64,
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntrySort {
    /// Most recently updated first
    #[default]
    Recent,
    Random,
}

impl FromStr for EntrySort {
    type Err = ReaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recent" => Ok(EntrySort::Recent),
            "random" => Ok(EntrySort::Random),
            other => Err(ReaderError::InvalidArgument(format!(
                "entry sort should be one of (recent, random), got {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedSort {
    /// By user title or title, case-insensitive; untitled feeds first
    #[default]
    Title,
    /// Last added first
    Added,
}

impl FromStr for FeedSort {
    type Err = ReaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "title" => Ok(FeedSort::Title),
            "added" => Ok(FeedSort::Added),
            other => Err(ReaderError::InvalidArgument(format!(
                "feed sort should be one of (title, added), got {:?}",
                other
            ))),
        }
    }
}

/// Entry filter options; all set options must hold.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub feed_url: Option<String>,
    pub entry_id: Option<String>,
    pub read: Option<bool>,
    pub important: Option<bool>,
    pub has_enclosures: Option<bool>,
    /// Over the entry's own tags.
    pub tags: TagFilter,
    /// Over the owning feed's tags.
    pub feed_tags: TagFilter,
}

impl EntryFilter {
    pub fn for_feed(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: Some(feed_url.into()),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.entry_id.is_some() && self.feed_url.is_none() {
            return Err(ReaderError::InvalidArgument(
                "entry_id requires feed_url".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub filter: EntryFilter,
    pub sort: EntrySort,
    /// Maximum number of rows; `None` for all.
    pub limit: Option<usize>,
    /// Continue after the row this cursor was taken from.
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    pub url: Option<String>,
    pub tags: TagFilter,
}

#[derive(Debug, Clone, Default)]
pub struct FeedQuery {
    pub filter: FeedFilter,
    pub sort: FeedSort,
    pub limit: Option<usize>,
    pub cursor: Option<Cursor>,
}

/// One page of results. `next` is set when the page was full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    /// Build a page from fetched rows; a full page gets a cursor to its last row.
    pub(crate) fn from_rows<R>(
        rows: Vec<R>,
        limit: Option<usize>,
        cursor: impl Fn(&R) -> Result<Cursor>,
        convert: impl FnMut(R) -> Result<T>,
    ) -> Result<Self> {
        let next = match (limit, rows.last()) {
            (Some(limit), Some(last)) if rows.len() == limit => Some(cursor(last)?),
            _ => None,
        };
        let items = rows.into_iter().map(convert).collect::<Result<Vec<_>>>()?;
        Ok(Page { items, next })
    }
}

/// Opaque pagination token encoding the sort key of the last returned row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    pub(crate) fn encode<K: Serialize>(key: &K) -> Result<Self> {
        Ok(Cursor(serde_json::to_string(key)?))
    }

    pub(crate) fn decode<K: for<'de> Deserialize<'de>>(&self) -> Result<K> {
        serde_json::from_str(&self.0)
            .map_err(|_| ReaderError::InvalidArgument(format!("invalid cursor: {}", self.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Cursor {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Cursor(s.to_owned()))
    }
}

/// Sort key of the recent order: all components descending.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RecentKey(pub i64, pub i64, pub i64, pub String, pub String);

/// Sort key of the title order: all components ascending.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TitleKey(pub String, pub String);

/// Sort key of the added order: all components descending.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AddedKey(pub i64, pub String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub total: u64,
    pub read: u64,
    pub important: u64,
    pub has_enclosures: u64,
}

/// A taggable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource<'a> {
    Feed(&'a str),
    Entry(&'a str, &'a str),
}

impl Resource<'_> {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Resource::Feed(_) => "feed",
            Resource::Entry(..) => "entry",
        }
    }

    pub(crate) fn feed_url(&self) -> &str {
        match self {
            Resource::Feed(url) | Resource::Entry(url, _) => url,
        }
    }

    pub(crate) fn entry_id(&self) -> &str {
        match self {
            Resource::Feed(_) => "",
            Resource::Entry(_, id) => id,
        }
    }

    pub(crate) fn not_found(&self) -> ReaderError {
        match self {
            Resource::Feed(url) => ReaderError::FeedNotFound((*url).to_owned()),
            Resource::Entry(url, id) => ReaderError::EntryNotFound {
                feed_url: (*url).to_owned(),
                entry_id: (*id).to_owned(),
            },
        }
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Feed columns plus the computed title sort key.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub url: String,
    pub updated: Option<i64>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub user_title: Option<String>,
    pub added: i64,
    pub sort_title: String,
}

impl FeedDbRow {
    pub(crate) fn cursor(&self, sort: FeedSort) -> Result<Cursor> {
        match sort {
            FeedSort::Title => Cursor::encode(&TitleKey(self.sort_title.clone(), self.url.clone())),
            FeedSort::Added => Cursor::encode(&AddedKey(self.added, self.url.clone())),
        }
    }

    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            url: self.url,
            updated: self.updated.and_then(from_micros),
            title: self.title,
            link: self.link,
            author: self.author,
            user_title: self.user_title,
        }
    }
}

/// Entry columns joined with the owning feed's columns.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub feed_url: String,
    pub id: String,
    pub updated: i64,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub enclosures: Option<String>,
    pub read: bool,
    pub important: bool,
    pub first_updated_epoch: i64,
    pub feed_order: i64,
    pub feed_updated: Option<i64>,
    pub feed_title: Option<String>,
    pub feed_link: Option<String>,
    pub feed_author: Option<String>,
    pub feed_user_title: Option<String>,
}

impl EntryDbRow {
    pub(crate) fn cursor(&self) -> Result<Cursor> {
        Cursor::encode(&RecentKey(
            self.updated,
            self.first_updated_epoch,
            -self.feed_order,
            self.feed_url.clone(),
            self.id.clone(),
        ))
    }

    pub(crate) fn into_entry(self) -> Result<Entry> {
        let content: Vec<Content> = match self.content {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        let enclosures: Vec<Enclosure> = match self.enclosures {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        let feed = Feed {
            url: self.feed_url,
            updated: self.feed_updated.and_then(from_micros),
            title: self.feed_title,
            link: self.feed_link,
            author: self.feed_author,
            user_title: self.feed_user_title,
        };
        Ok(Entry {
            id: self.id,
            updated: from_micros(self.updated),
            title: self.title,
            link: self.link,
            author: self.author,
            published: self.published.and_then(from_micros),
            summary: self.summary,
            content,
            enclosures,
            read: self.read,
            important: self.important,
            feed: Some(feed),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedForUpdateRow {
    pub url: String,
    pub updated: Option<i64>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub stale: bool,
    pub last_updated: Option<i64>,
}

impl From<FeedForUpdateRow> for FeedForUpdate {
    fn from(row: FeedForUpdateRow) -> Self {
        FeedForUpdate {
            url: row.url,
            updated: row.updated.and_then(from_micros),
            http_etag: row.http_etag,
            http_last_modified: row.http_last_modified,
            stale: row.stale,
            last_updated: row.last_updated.and_then(from_micros),
        }
    }
}
