//! The public entry point: storage, update coordination and search behind
//! one handle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, Stream, TryStreamExt};
use serde_json::Value;

use crate::config::Config;
use crate::error::{ReaderError, Result};
use crate::feed::{Coordinator, FeedRsParser, Fetcher, HttpFetcher, Parser, UpdateResult};
use crate::model::{entry_argument, feed_argument, Entry, EntryRef, EntrySearchResult, Feed, FeedRef};
use crate::storage::{Database, EntryCounts, EntryFilter, EntryQuery, FeedQuery, Page, Resource};

/// Called with the feed URL and entry for every entry an update created.
pub type NewEntryHook = Box<dyn Fn(&str, &Entry) + Send + Sync>;

pub struct Reader {
    db: Database,
    coordinator: Coordinator,
    page_size: usize,
    new_entry_hooks: Vec<NewEntryHook>,
}

impl Reader {
    /// Open (creating if needed) the database at `path`, fetching over HTTP.
    pub async fn open(path: &str, config: &Config) -> Result<Self> {
        let db = Database::open(path).await?;
        let fetcher = HttpFetcher::new(&config.user_agent, config.fetch_config()).map_err(|e| {
            ReaderError::InvalidArgument(format!("could not build HTTP client: {}", e))
        })?;
        let reader = Self::new(db, Arc::new(fetcher), Arc::new(FeedRsParser))
            .with_workers(config.workers)
            .with_page_size(config.page_size);
        Ok(reader)
    }

    /// Build a reader over explicit collaborators. Search indexing uses `db`.
    pub fn new(db: Database, fetcher: Arc<dyn Fetcher>, parser: Arc<dyn Parser>) -> Self {
        let coordinator =
            Coordinator::new(db.clone(), fetcher, parser).with_search(Arc::new(db.clone()));
        Self {
            db,
            coordinator,
            page_size: 256,
            new_entry_hooks: Vec::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.coordinator = self.coordinator.with_workers(workers);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Replace the coordinator, e.g. to install a fixed clock.
    pub fn with_coordinator(mut self, coordinator: Coordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn on_new_entry(&mut self, hook: NewEntryHook) {
        self.new_entry_hooks.push(hook);
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Stop the coordinator from starting or committing further cycles.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }

    // ------------------------------------------------------------------------
    // Feeds
    // ------------------------------------------------------------------------

    pub async fn add_feed<F: FeedRef + ?Sized>(&self, feed: &F) -> Result<()> {
        let url = feed_argument(feed)?;
        self.db.add_feed(url, Utc::now()).await?;
        tracing::info!(feed = %url, "Added feed");
        Ok(())
    }

    /// Delete a feed with its entries, tags and metadata.
    pub async fn delete_feed<F: FeedRef + ?Sized>(&self, feed: &F) -> Result<()> {
        let url = feed_argument(feed)?;
        self.db.delete_feed(url).await?;
        tracing::info!(feed = %url, "Deleted feed");
        Ok(())
    }

    pub async fn remove_feed<F: FeedRef + ?Sized>(&self, feed: &F) -> Result<()> {
        self.delete_feed(feed).await
    }

    pub async fn get_feed<F: FeedRef + ?Sized>(&self, feed: &F) -> Result<Option<Feed>> {
        self.db.get_feed(feed_argument(feed)?).await
    }

    pub async fn get_feeds(&self, query: &FeedQuery) -> Result<Page<Feed>> {
        self.db.get_feeds(query).await
    }

    pub async fn set_feed_user_title<F: FeedRef + ?Sized>(
        &self,
        feed: &F,
        title: Option<&str>,
    ) -> Result<()> {
        self.db.set_feed_user_title(feed_argument(feed)?, title).await
    }

    /// Force the next update to re-diff every entry of the feed.
    pub async fn mark_feed_stale<F: FeedRef + ?Sized>(&self, feed: &F, stale: bool) -> Result<()> {
        self.db.mark_feed_stale(feed_argument(feed)?, stale).await
    }

    /// Message of the feed's last failed update, cleared by the next success.
    pub async fn get_feed_last_error<F: FeedRef + ?Sized>(&self, feed: &F) -> Result<Option<String>> {
        self.db.get_feed_error(feed_argument(feed)?).await
    }

    // ------------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------------

    pub async fn update_feed<F: FeedRef + ?Sized>(&self, feed: &F) -> Result<UpdateResult> {
        let url = feed_argument(feed)?;
        let result = self.coordinator.update_feed(url).await?;
        self.run_hooks(&result);
        Ok(result)
    }

    /// Update several feeds; one outcome per distinct URL.
    pub async fn update_feeds<I, F>(&self, feeds: I) -> Result<BTreeMap<String, Result<UpdateResult>>>
    where
        I: IntoIterator<Item = F>,
        F: FeedRef,
    {
        let urls = feeds
            .into_iter()
            .map(|f| feed_argument(&f).map(str::to_owned))
            .collect::<Result<Vec<_>>>()?;
        let results = self.coordinator.update_feeds(urls).await;
        self.run_batch_hooks(&results);
        Ok(results)
    }

    /// Update every feed, or with `new_only` just those never updated.
    pub async fn update_all_feeds(
        &self,
        new_only: bool,
    ) -> Result<BTreeMap<String, Result<UpdateResult>>> {
        let results = self.coordinator.update_all_feeds(new_only).await?;
        self.run_batch_hooks(&results);
        Ok(results)
    }

    fn run_batch_hooks(&self, results: &BTreeMap<String, Result<UpdateResult>>) {
        for result in results.values().flatten() {
            self.run_hooks(result);
        }
    }

    fn run_hooks(&self, result: &UpdateResult) {
        if self.new_entry_hooks.is_empty() {
            return;
        }
        for updated in result.entries.iter().filter(|u| u.new) {
            for hook in &self.new_entry_hooks {
                hook(&result.feed_url, &updated.entry);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------------

    pub async fn get_entry<E: EntryRef + ?Sized>(&self, entry: &E) -> Result<Option<Entry>> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.get_entry(feed_url, id).await
    }

    /// Lazily stream matching entries, fetching `page_size` rows at a time.
    ///
    /// `query.limit` caps the total; `query.cursor` resumes after an earlier
    /// row. The random sort yields a single page.
    pub fn get_entries(&self, query: EntryQuery) -> impl Stream<Item = Result<Entry>> + '_ {
        let remaining = query.limit;
        stream::try_unfold(
            (query, remaining, false),
            move |(mut query, remaining, done)| async move {
                if done || remaining == Some(0) {
                    return Ok::<_, ReaderError>(None);
                }
                let limit = remaining.map_or(self.page_size, |r| r.min(self.page_size));
                let page = self
                    .db
                    .get_entries(&EntryQuery {
                        limit: Some(limit),
                        ..query.clone()
                    })
                    .await?;

                let remaining = remaining.map(|r| r - page.items.len());
                let done = page.next.is_none();
                query.cursor = page.next;
                let items = stream::iter(page.items.into_iter().map(Ok::<_, ReaderError>));
                Ok(Some((items, (query, remaining, done))))
            },
        )
        .try_flatten()
    }

    /// One page of matching entries; pass `next` back as the cursor to continue.
    pub async fn get_entries_page(&self, query: &EntryQuery) -> Result<Page<Entry>> {
        self.db.get_entries(query).await
    }

    pub async fn get_entry_counts(&self, filter: &EntryFilter) -> Result<EntryCounts> {
        self.db.get_entry_counts(filter).await
    }

    pub async fn mark_as_read<E: EntryRef + ?Sized>(&self, entry: &E) -> Result<()> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.set_entry_read(feed_url, id, true).await
    }

    pub async fn mark_as_unread<E: EntryRef + ?Sized>(&self, entry: &E) -> Result<()> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.set_entry_read(feed_url, id, false).await
    }

    pub async fn mark_as_important<E: EntryRef + ?Sized>(&self, entry: &E) -> Result<()> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.set_entry_important(feed_url, id, true).await
    }

    pub async fn mark_as_unimportant<E: EntryRef + ?Sized>(&self, entry: &E) -> Result<()> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.set_entry_important(feed_url, id, false).await
    }

    // ------------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------------

    pub async fn set_feed_tag<F: FeedRef + ?Sized>(&self, feed: &F, name: &str) -> Result<()> {
        self.db.set_tag(Resource::Feed(feed_argument(feed)?), name).await
    }

    pub async fn remove_feed_tag<F: FeedRef + ?Sized>(&self, feed: &F, name: &str) -> Result<()> {
        self.db.remove_tag(Resource::Feed(feed_argument(feed)?), name).await
    }

    pub async fn get_feed_tags<F: FeedRef + ?Sized>(&self, feed: &F) -> Result<BTreeSet<String>> {
        self.db.get_tags(Resource::Feed(feed_argument(feed)?)).await
    }

    pub async fn set_entry_tag<E: EntryRef + ?Sized>(&self, entry: &E, name: &str) -> Result<()> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.set_tag(Resource::Entry(feed_url, id), name).await
    }

    pub async fn remove_entry_tag<E: EntryRef + ?Sized>(&self, entry: &E, name: &str) -> Result<()> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.remove_tag(Resource::Entry(feed_url, id), name).await
    }

    pub async fn get_entry_tags<E: EntryRef + ?Sized>(&self, entry: &E) -> Result<BTreeSet<String>> {
        let (feed_url, id) = entry_argument(entry)?;
        self.db.get_tags(Resource::Entry(feed_url, id)).await
    }

    // ------------------------------------------------------------------------
    // Feed metadata
    // ------------------------------------------------------------------------

    pub async fn get_feed_metadata<F: FeedRef + ?Sized>(
        &self,
        feed: &F,
        key: &str,
    ) -> Result<Option<Value>> {
        self.db.get_feed_metadata(feed_argument(feed)?, key).await
    }

    /// All pairs for the feed ordered by key, or just the one for `key`.
    pub async fn iter_feed_metadata<F: FeedRef + ?Sized>(
        &self,
        feed: &F,
        key: Option<&str>,
    ) -> Result<Vec<(String, Value)>> {
        self.db.iter_feed_metadata(feed_argument(feed)?, key).await
    }

    pub async fn set_feed_metadata<F: FeedRef + ?Sized>(
        &self,
        feed: &F,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        self.db.set_feed_metadata(feed_argument(feed)?, key, value).await
    }

    pub async fn delete_feed_metadata<F: FeedRef + ?Sized>(&self, feed: &F, key: &str) -> Result<()> {
        self.db.delete_feed_metadata(feed_argument(feed)?, key).await
    }

    // ------------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------------

    pub async fn enable_search(&self) -> Result<()> {
        self.db.enable_search().await
    }

    pub async fn disable_search(&self) -> Result<()> {
        self.db.disable_search().await
    }

    pub async fn is_search_enabled(&self) -> Result<bool> {
        self.db.is_search_enabled().await
    }

    pub async fn search_entries(
        &self,
        query: &str,
        filter: &EntryFilter,
        limit: usize,
    ) -> Result<Vec<EntrySearchResult>> {
        self.db.search_entries(query, filter, limit).await
    }
}
