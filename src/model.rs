//! Record types shared by storage, the updater and callers.
//!
//! Records are plain values: "changing" one means building a new value with
//! struct update syntax or one of the `with_*` helpers. Every record can also
//! be taken apart into, and rebuilt from, a positional list of JSON values
//! (see [`Positional`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{ReaderError, Result};

// ============================================================================
// Positional reconstruction
// ============================================================================

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Expected {expected} fields, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("Invalid value for field {field}: {message}")]
    Field {
        field: &'static str,
        message: String,
    },
}

/// Conversion to and from a positional field list, in declaration order.
pub trait Positional: Sized {
    /// Field names, in declaration order.
    const FIELDS: &'static [&'static str];

    fn to_fields(&self) -> Result<Vec<Value>, RecordError>;

    /// Rebuild a record. Fails with [`RecordError::Arity`] unless exactly
    /// `FIELDS.len()` values are given.
    fn from_fields(fields: Vec<Value>) -> Result<Self, RecordError>;
}

macro_rules! positional {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl Positional for $ty {
            const FIELDS: &'static [&'static str] = &[$(stringify!($field)),+];

            fn to_fields(&self) -> Result<Vec<Value>, RecordError> {
                Ok(vec![$(
                    serde_json::to_value(&self.$field).map_err(|e| RecordError::Field {
                        field: stringify!($field),
                        message: e.to_string(),
                    })?
                ),+])
            }

            fn from_fields(fields: Vec<Value>) -> Result<Self, RecordError> {
                if fields.len() != Self::FIELDS.len() {
                    return Err(RecordError::Arity {
                        expected: Self::FIELDS.len(),
                        got: fields.len(),
                    });
                }
                let mut values = fields.into_iter();
                Ok(Self {$(
                    $field: serde_json::from_value(values.next().unwrap_or(Value::Null))
                        .map_err(|e| RecordError::Field {
                            field: stringify!($field),
                            message: e.to_string(),
                        })?,
                )+})
            }
        }
    };
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub url: String,
    /// When the feed was last updated, according to the feed.
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    /// User-defined title; takes precedence over `title` for display and sorting.
    pub user_title: Option<String>,
}

impl Feed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            updated: None,
            title: None,
            link: None,
            author: None,
            user_title: None,
        }
    }

    pub fn display_title(&self) -> Option<&str> {
        self.user_title.as_deref().or(self.title.as_deref())
    }

    pub fn with_user_title(self, user_title: Option<String>) -> Self {
        Self { user_title, ..self }
    }
}

positional!(Feed {
    url,
    updated,
    title,
    link,
    author,
    user_title
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Identifier assigned by the source; unique within its feed only.
    pub id: String,
    /// Always set for stored entries. Parsed entries may lack it.
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
    pub read: bool,
    pub important: bool,
    /// Snapshot of the owning feed, filled in by storage on reads.
    pub feed: Option<Feed>,
}

impl Entry {
    pub fn new(id: impl Into<String>, updated: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            updated,
            title: None,
            link: None,
            author: None,
            published: None,
            summary: None,
            content: Vec::new(),
            enclosures: Vec::new(),
            read: false,
            important: false,
            feed: None,
        }
    }

    pub fn feed_url(&self) -> Option<&str> {
        self.feed.as_ref().map(|f| f.url.as_str())
    }

    pub fn with_feed(self, feed: Feed) -> Self {
        Self {
            feed: Some(feed),
            ..self
        }
    }

    pub fn with_updated(self, updated: Option<DateTime<Utc>>) -> Self {
        Self { updated, ..self }
    }
}

positional!(Entry {
    id,
    updated,
    title,
    link,
    author,
    published,
    summary,
    content,
    enclosures,
    read,
    important,
    feed
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub value: String,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub language: Option<String>,
}

positional!(Content {
    value,
    content_type,
    language
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub length: Option<u64>,
}

positional!(Enclosure {
    href,
    content_type,
    length
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySearchResult {
    pub feed_url: String,
    pub id: String,
    pub title: Option<String>,
}

positional!(EntrySearchResult { feed_url, id, title });

// ============================================================================
// References
// ============================================================================

/// Anything that identifies a feed by URL.
pub trait FeedRef {
    fn url(&self) -> &str;
}

impl FeedRef for str {
    fn url(&self) -> &str {
        self
    }
}

impl FeedRef for String {
    fn url(&self) -> &str {
        self
    }
}

impl FeedRef for Feed {
    fn url(&self) -> &str {
        &self.url
    }
}

impl<T: FeedRef + ?Sized> FeedRef for &T {
    fn url(&self) -> &str {
        (**self).url()
    }
}

/// Anything that identifies an entry by (feed URL, entry id).
pub trait EntryRef {
    /// `None` when the value carries no feed reference.
    fn feed_url(&self) -> Option<&str>;
    fn entry_id(&self) -> &str;
}

impl<A: AsRef<str>, B: AsRef<str>> EntryRef for (A, B) {
    fn feed_url(&self) -> Option<&str> {
        Some(self.0.as_ref())
    }

    fn entry_id(&self) -> &str {
        self.1.as_ref()
    }
}

impl EntryRef for Entry {
    fn feed_url(&self) -> Option<&str> {
        Entry::feed_url(self)
    }

    fn entry_id(&self) -> &str {
        &self.id
    }
}

/// Normalize a feed reference, rejecting empty URLs.
pub fn feed_argument<F: FeedRef + ?Sized>(feed: &F) -> Result<&str> {
    let url = feed.url();
    if url.is_empty() {
        return Err(ReaderError::InvalidArgument("feed URL is empty".into()));
    }
    Ok(url)
}

/// Normalize an entry reference into `(feed_url, entry_id)`.
pub fn entry_argument<E: EntryRef + ?Sized>(entry: &E) -> Result<(&str, &str)> {
    let feed_url = entry
        .feed_url()
        .ok_or_else(|| ReaderError::InvalidArgument("entry has no feed".into()))?;
    if feed_url.is_empty() {
        return Err(ReaderError::InvalidArgument("feed URL is empty".into()));
    }
    let id = entry.entry_id();
    if id.is_empty() {
        return Err(ReaderError::InvalidArgument("entry id is empty".into()));
    }
    Ok((feed_url, id))
}
