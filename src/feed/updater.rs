//! Reconciliation of a parsed feed against its stored state.
//!
//! Pure: given the prior state and a parse result, [`Updater::plan`] decides
//! what must be written, and produces the intents plus the caller-facing
//! [`UpdateResult`]. Nothing here touches storage.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::parser::ParsedFeed;
use crate::model::{Entry, Feed};
use crate::storage::{
    truncate_to_storage, EntryForUpdate, EntryUpdateIntent, FeedForUpdate, FeedUpdateIntent,
};

/// An entry written by an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedEntry {
    pub entry: Entry,
    /// `true` if the entry did not exist before this update.
    pub new: bool,
}

/// Entries written by one feed's update; empty when nothing changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub feed_url: String,
    pub entries: Vec<UpdatedEntry>,
}

impl UpdateResult {
    pub fn empty(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn new_count(&self) -> usize {
        self.entries.iter().filter(|e| e.new).count()
    }

    pub fn modified_count(&self) -> usize {
        self.entries.len() - self.new_count()
    }
}

/// Everything one update cycle will commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    pub feed: FeedUpdateIntent,
    pub entries: Vec<EntryUpdateIntent>,
    pub result: UpdateResult,
}

pub struct Updater<'a> {
    old: &'a FeedForUpdate,
    /// Start of this feed's cycle
    now: DateTime<Utc>,
    /// Start of the whole batch; shared by all feeds updated together
    global_now: DateTime<Utc>,
}

impl<'a> Updater<'a> {
    pub fn new(old: &'a FeedForUpdate, now: DateTime<Utc>, global_now: DateTime<Utc>) -> Self {
        Self {
            old,
            now: truncate_to_storage(now),
            global_now: truncate_to_storage(global_now),
        }
    }

    /// Whether the parsed feed metadata should replace the stored one.
    pub fn should_update_feed(&self, parsed: &Feed) -> bool {
        if self.old.stale || self.old.last_updated.is_none() {
            return true;
        }
        match (parsed.updated.map(truncate_to_storage), self.old.updated) {
            (None, _) | (Some(_), None) => true,
            (Some(new), Some(old)) => new > old,
        }
    }

    /// Whether a re-seen entry must be rewritten.
    ///
    /// A missing `updated` differs from any stored value, so such entries
    /// are rewritten every cycle.
    pub fn entry_changed(&self, parsed: &Entry, prior: &EntryForUpdate) -> bool {
        self.old.stale || parsed.updated.map(truncate_to_storage) != prior.updated
    }

    /// Build the intents for one parsed feed.
    ///
    /// `prior` holds the stored state of the parsed entries that already
    /// exist. Unchanged entries produce no intent. Repeated ids keep their
    /// first occurrence.
    pub fn plan(
        &self,
        parsed: ParsedFeed,
        http_etag: Option<String>,
        http_last_modified: Option<String>,
        prior: &HashMap<String, EntryForUpdate>,
    ) -> UpdatePlan {
        let url = self.old.url.clone();

        let feed = if self.should_update_feed(&parsed.feed) {
            Some(Feed {
                url: url.clone(),
                updated: parsed.feed.updated.map(truncate_to_storage),
                ..parsed.feed
            })
        } else {
            tracing::debug!(feed = %url, "Feed not newer, keeping stored metadata");
            None
        };

        let mut seen = HashSet::new();
        let mut intents = Vec::new();
        let mut updated_entries = Vec::new();

        for (feed_order, entry) in parsed.entries.into_iter().enumerate() {
            if !seen.insert(entry.id.clone()) {
                tracing::debug!(feed = %url, entry = %entry.id, "Skipping repeated entry id");
                continue;
            }

            let entry = Entry {
                published: entry.published.map(truncate_to_storage),
                read: false,
                important: false,
                feed: None,
                ..entry
            };

            let (updated, first_updated_epoch, new) = match prior.get(&entry.id) {
                None => (
                    entry.updated.map(truncate_to_storage).unwrap_or(self.now),
                    self.global_now,
                    true,
                ),
                Some(prior) if self.entry_changed(&entry, prior) => (
                    entry
                        .updated
                        .map(truncate_to_storage)
                        .or(prior.updated)
                        .unwrap_or(self.now),
                    prior.first_updated_epoch,
                    false,
                ),
                Some(_) => continue,
            };

            let entry = entry.with_updated(Some(updated));
            intents.push(EntryUpdateIntent {
                feed_url: url.clone(),
                entry: entry.clone(),
                last_updated: self.now,
                first_updated_epoch,
                feed_order: feed_order as i64,
            });
            updated_entries.push(UpdatedEntry { entry, new });
        }

        UpdatePlan {
            feed: FeedUpdateIntent {
                url: url.clone(),
                last_updated: self.now,
                feed,
                http_etag,
                http_last_modified,
            },
            entries: intents,
            result: UpdateResult {
                feed_url: url,
                entries: updated_entries,
            },
        }
    }
}
