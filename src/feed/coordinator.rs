use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::OwnedMutexGuard;

use super::fetcher::{FetchOutcome, Fetcher};
use super::parser::Parser;
use super::updater::{UpdateResult, Updater};
use super::SearchIndex;
use crate::error::{ReaderError, Result};
use crate::storage::Database;

/// Source of cycle start times.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// ============================================================================
// Per-feed locks
// ============================================================================

/// One async mutex per feed URL being updated; entries are dropped when unused.
#[derive(Default)]
struct FeedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FeedLocks {
    async fn acquire(&self, url: &str) -> FeedLockGuard<'_> {
        // Created before waiting so an abandoned wait still cleans up the entry
        let mut handle = FeedLockGuard {
            locks: self,
            url: url.to_owned(),
            guard: None,
        };
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(url.to_owned()).or_default())
        };
        handle.guard = Some(lock.lock_owned().await);
        handle
    }

    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct FeedLockGuard<'a> {
    locks: &'a FeedLocks,
    url: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FeedLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map's reference left: nobody holds or waits for this lock
        if map
            .get(&self.url)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.url);
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives update cycles: fetch, parse, reconcile, commit.
///
/// At most one cycle per feed URL runs at a time; different feeds run
/// concurrently, bounded by the worker count.
pub struct Coordinator {
    db: Database,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn Parser>,
    search: Option<Arc<dyn SearchIndex>>,
    workers: usize,
    clock: Clock,
    locks: FeedLocks,
    shutdown: AtomicBool,
}

impl Coordinator {
    pub fn new(db: Database, fetcher: Arc<dyn Fetcher>, parser: Arc<dyn Parser>) -> Self {
        Self {
            db,
            fetcher,
            parser,
            search: None,
            workers: 4,
            clock: Arc::new(Utc::now),
            locks: FeedLocks::default(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Index every committed update's entries. Indexing failures are logged only.
    pub fn with_search(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Stop starting new work. Cycles that have not committed yet end with
    /// `Cancelled` and write nothing.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn check_shutdown(&self, url: &str) -> Result<()> {
        if self.is_shut_down() {
            return Err(ReaderError::Cancelled(url.to_owned()));
        }
        Ok(())
    }

    /// Update one feed. Errors are returned directly.
    pub async fn update_feed(&self, url: &str) -> Result<UpdateResult> {
        let now = (self.clock)();
        self.update_one(url, now).await
    }

    /// Update several feeds concurrently, one outcome per distinct URL.
    ///
    /// A failing feed never aborts the others.
    pub async fn update_feeds<I>(&self, urls: I) -> BTreeMap<String, Result<UpdateResult>>
    where
        I: IntoIterator<Item = String>,
    {
        let urls: BTreeSet<String> = urls.into_iter().collect();
        let global_now = (self.clock)();
        tracing::info!(feeds = urls.len(), workers = self.workers, "Updating feeds");

        stream::iter(urls)
            .map(|url| async move {
                let result = self.update_one(&url, global_now).await;
                (url, result)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await
    }

    /// Update every stored feed, or only those never updated.
    pub async fn update_all_feeds(
        &self,
        new_only: bool,
    ) -> Result<BTreeMap<String, Result<UpdateResult>>> {
        let feeds = self.db.get_feeds_for_update(new_only).await?;
        Ok(self.update_feeds(feeds.into_iter().map(|f| f.url)).await)
    }

    async fn update_one(&self, url: &str, global_now: DateTime<Utc>) -> Result<UpdateResult> {
        let result = self.run_cycle(url, global_now).await;

        match &result {
            Ok(update) => {
                tracing::info!(
                    feed = %url,
                    new = update.new_count(),
                    modified = update.modified_count(),
                    "Updated feed"
                );
            }
            Err(e @ (ReaderError::Fetch { .. } | ReaderError::Parse { .. })) => {
                tracing::warn!(feed = %url, error = %e, "Update failed");
                if let Err(record_err) = self.db.set_feed_error(url, Some(&e.to_string())).await {
                    tracing::warn!(feed = %url, error = %record_err, "Failed to record feed error");
                }
            }
            Err(e) if e.is_per_feed() => {
                tracing::info!(feed = %url, error = %e, "Update skipped");
            }
            Err(e) => {
                tracing::error!(feed = %url, error = %e, "Update failed");
            }
        }

        result
    }

    async fn run_cycle(&self, url: &str, global_now: DateTime<Utc>) -> Result<UpdateResult> {
        let _guard = self.locks.acquire(url).await;
        self.check_shutdown(url)?;

        let now = (self.clock)();
        let old = self
            .db
            .get_feed_for_update(url)
            .await?
            .ok_or_else(|| ReaderError::FeedNotFound(url.to_owned()))?;

        // A stale feed is fetched unconditionally so every entry can be rewritten
        let (etag, last_modified) = if old.stale {
            (None, None)
        } else {
            (old.http_etag.as_deref(), old.http_last_modified.as_deref())
        };
        let outcome = self
            .fetcher
            .fetch(url, etag, last_modified)
            .await
            .map_err(|source| ReaderError::Fetch {
                url: url.to_owned(),
                source,
            })?;

        let fetched = match outcome {
            FetchOutcome::NotModified => {
                tracing::debug!(feed = %url, stale = old.stale, "Not modified, skipping");
                return Ok(UpdateResult::empty(url));
            }
            FetchOutcome::Fetched(fetched) => fetched,
        };

        let parsed = self
            .parser
            .parse(url, &fetched.payload)
            .map_err(|source| ReaderError::Parse {
                url: url.to_owned(),
                source,
            })?;

        let ids: Vec<&str> = parsed.entries.iter().map(|e| e.id.as_str()).collect();
        let prior = self.db.get_entries_for_update(url, &ids).await?;

        let plan = Updater::new(&old, now, global_now).plan(
            parsed,
            fetched.http_etag,
            fetched.http_last_modified,
            &prior,
        );

        self.check_shutdown(url)?;
        self.db.apply_update(&plan.feed, &plan.entries).await?;

        if let Some(search) = &self.search {
            if !plan.result.is_empty() {
                if let Err(e) = search.index(url, &plan.result).await {
                    tracing::warn!(feed = %url, error = %e, "Failed to index updated entries");
                }
            }
        }

        Ok(plan.result)
    }
}
