mod entries;
mod feeds;
mod metadata;
mod schema;
mod search;
mod tags;
mod types;

pub use schema::Database;
pub use types::{
    Cursor, DatabaseError, EntryCounts, EntryFilter, EntryForUpdate, EntryQuery, EntrySort,
    EntryUpdateIntent, FeedFilter, FeedForUpdate, FeedQuery, FeedSort, FeedUpdateIntent, Page,
    Resource,
};
pub(crate) use types::truncate_to_storage;
