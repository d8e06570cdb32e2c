use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use feedkeep::storage::{EntryFilter, EntryQuery, FeedFilter, FeedQuery, FeedSort};
use feedkeep::{Config, Reader, TagFilter};

/// Get the config directory path (~/.config/feedkeep/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedkeep"))
}

/// Create the config directory, user-only on Unix.
fn ensure_config_dir(dir: &std::path::Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "feedkeep", about = "Keep a local, tagged archive of RSS/Atom feeds")]
struct Args {
    /// Config file (default: ~/.config/feedkeep/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Database file; overrides the config file
    #[arg(long, value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start following a feed
    Add { url: String },
    /// Delete a feed with its entries and tags
    Remove { url: String },
    /// Fetch feeds and store new or changed entries (all feeds when none given)
    Update { urls: Vec<String> },
    /// List feeds
    Feeds {
        /// "title" or "added"
        #[arg(long, default_value = "title")]
        sort: FeedSort,
        /// Tag expression as JSON, e.g. '[["a","b"],"-c"]'
        #[arg(long, value_name = "EXPR")]
        tags: Option<TagFilter>,
    },
    /// List entries, most recent first
    Entries {
        #[arg(long, value_name = "URL")]
        feed: Option<String>,
        #[arg(long)]
        unread: bool,
        #[arg(long)]
        important: bool,
        /// Tag expression over the entry's tags
        #[arg(long, value_name = "EXPR")]
        tags: Option<TagFilter>,
        /// Tag expression over the feed's tags
        #[arg(long, value_name = "EXPR")]
        feed_tags: Option<TagFilter>,
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Tag a feed
    Tag { url: String, name: String },
    /// Remove a tag from a feed
    Untag { url: String, name: String },
    /// Re-diff every entry of a feed on its next update
    Stale { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.database.clone().or_else(|| config.database.clone()) {
        Some(path) => path,
        None => {
            ensure_config_dir(&config_dir)?;
            config_dir.join("feedkeep.db")
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let reader = Reader::open(db_path_str, &config)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    run(&reader, args.command).await
}

async fn run(reader: &Reader, command: Command) -> Result<()> {
    match command {
        Command::Add { url } => {
            reader.add_feed(&url).await?;
            println!("Added {}", url);
        }
        Command::Remove { url } => {
            reader.remove_feed(&url).await?;
            println!("Removed {}", url);
        }
        Command::Update { urls } => update(reader, urls).await?,
        Command::Feeds { sort, tags } => {
            let query = FeedQuery {
                filter: FeedFilter {
                    url: None,
                    tags: tags.unwrap_or_default(),
                },
                sort,
                ..FeedQuery::default()
            };
            for feed in reader.get_feeds(&query).await?.items {
                println!("{}\t{}", feed.url, feed.display_title().unwrap_or(""));
            }
        }
        Command::Entries {
            feed,
            unread,
            important,
            tags,
            feed_tags,
            limit,
        } => {
            let query = EntryQuery {
                filter: EntryFilter {
                    feed_url: feed,
                    read: unread.then_some(false),
                    important: important.then_some(true),
                    tags: tags.unwrap_or_default(),
                    feed_tags: feed_tags.unwrap_or_default(),
                    ..EntryFilter::default()
                },
                limit,
                ..EntryQuery::default()
            };
            let entries = reader.get_entries(query);
            tokio::pin!(entries);
            while let Some(entry) = entries.try_next().await? {
                let updated = entry
                    .updated
                    .map(|u| u.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}",
                    updated,
                    entry.feed_url().unwrap_or(""),
                    entry.id,
                    entry.title.as_deref().unwrap_or("")
                );
            }
        }
        Command::Tag { url, name } => reader.set_feed_tag(&url, &name).await?,
        Command::Untag { url, name } => reader.remove_feed_tag(&url, &name).await?,
        Command::Stale { url } => reader.mark_feed_stale(&url, true).await?,
    }
    Ok(())
}

/// Update feeds, stopping cleanly on Ctrl-C: cycles that have not committed
/// yet are abandoned.
async fn update(reader: &Reader, urls: Vec<String>) -> Result<()> {
    let update = async {
        if urls.is_empty() {
            reader.update_all_feeds(false).await
        } else {
            reader.update_feeds(&urls).await
        }
    };
    tokio::pin!(update);

    let results = tokio::select! {
        results = &mut update => results?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, abandoning pending updates...");
            reader.shutdown();
            update.await?
        }
    };

    let mut failed = 0;
    for (url, result) in &results {
        match result {
            Ok(outcome) => println!(
                "{}: {} new, {} modified",
                url,
                outcome.new_count(),
                outcome.modified_count()
            ),
            Err(e) => {
                failed += 1;
                println!("{}: {}", url, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} feeds failed to update", failed, results.len());
    }
    Ok(())
}
