//! Feed retrieval and update.
//!
//! - [`fetcher`]: conditional HTTP retrieval behind the [`Fetcher`] trait
//! - [`parser`]: RSS/Atom/JSON Feed parsing behind the [`Parser`] trait
//! - [`updater`]: pure reconciliation of a parse result against stored state
//! - [`coordinator`]: per-feed update cycles, batches and locking

mod coordinator;
mod fetcher;
mod parser;
mod updater;

use async_trait::async_trait;

use crate::error::Result;

pub use coordinator::{Clock, Coordinator};
pub use fetcher::{FetchConfig, FetchError, FetchOutcome, FetchedFeed, Fetcher, HttpFetcher};
pub use parser::{FeedRsParser, ParseError, ParsedFeed, Parser};
pub use updater::{UpdatePlan, UpdateResult, UpdatedEntry, Updater};

/// Receives the entries of each committed update.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index(&self, feed_url: &str, result: &UpdateResult) -> Result<()>;
}
