//! Library-wide error type.
//!
//! Single-feed operations return these directly; batch updates collect one
//! `Result` per feed instead of failing the whole batch.

use thiserror::Error;

use crate::feed::{FetchError, ParseError};
use crate::storage::DatabaseError;
use crate::tags::TagFilterError;

pub type Result<T, E = ReaderError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Entry not found: {entry_id} (feed {feed_url})")]
    EntryNotFound { feed_url: String, entry_id: String },

    /// `add_feed` on a URL that is already stored.
    #[error("Feed already exists: {0}")]
    FeedExists(String),

    #[error("Metadata not found: {key} (feed {feed_url})")]
    MetadataNotFound { feed_url: String, key: String },

    #[error(transparent)]
    InvalidTagFilter(#[from] TagFilterError),

    /// Malformed feed/entry reference, cursor, or option combination.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Storage(#[from] DatabaseError),

    #[error("Error while fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("Error while parsing {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },

    #[error("Search error: {0}")]
    Search(String),

    #[error("Search is not enabled")]
    SearchNotEnabled,

    /// The batch was shut down before this feed's changes were committed.
    #[error("Update cancelled: {0}")]
    Cancelled(String),
}

impl ReaderError {
    /// Whether the coordinator may record this error and move on to other feeds.
    pub fn is_per_feed(&self) -> bool {
        matches!(
            self,
            ReaderError::Fetch { .. }
                | ReaderError::Parse { .. }
                | ReaderError::FeedNotFound(_)
                | ReaderError::Cancelled(_)
        )
    }
}

impl From<sqlx::Error> for ReaderError {
    fn from(err: sqlx::Error) -> Self {
        ReaderError::Storage(DatabaseError::from_sqlx(err))
    }
}

impl From<serde_json::Error> for ReaderError {
    fn from(err: serde_json::Error) -> Self {
        ReaderError::Storage(DatabaseError::Serialization(err.to_string()))
    }
}
