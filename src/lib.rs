//! Local feed aggregation: update reconciliation, tag-expression filters and
//! SQLite-backed storage.
//!
//! [`Reader`] is the usual entry point. The pieces it combines are public too:
//! [`storage::Database`] for direct storage access and [`feed::Coordinator`]
//! for driving updates with custom [`feed::Fetcher`] / [`feed::Parser`]
//! implementations.

pub mod config;
pub mod error;
pub mod feed;
pub mod model;
pub mod reader;
pub mod storage;
pub mod tags;

pub use config::Config;
pub use error::{ReaderError, Result};
pub use model::{Content, Enclosure, Entry, EntryRef, EntrySearchResult, Feed, FeedRef};
pub use reader::Reader;
pub use tags::{evaluate, TagAtom, TagFilter, TagFilterError};
