use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{Content, Enclosure, Entry, Feed};

#[derive(Debug, Error)]
pub enum ParseError {
    /// Neither RSS, Atom nor JSON Feed, or malformed
    #[error("Invalid feed document: {0}")]
    Invalid(String),
}

/// A parsed document: the feed record and its entries, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFeed {
    pub feed: Feed,
    pub entries: Vec<Entry>,
}

/// Turns a fetched payload into records.
pub trait Parser: Send + Sync {
    fn parse(&self, url: &str, payload: &[u8]) -> Result<ParsedFeed, ParseError>;
}

/// [`Parser`] for RSS, Atom and JSON Feed documents, backed by `feed-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRsParser;

impl Parser for FeedRsParser {
    fn parse(&self, url: &str, payload: &[u8]) -> Result<ParsedFeed, ParseError> {
        let parsed = parser::parse(payload).map_err(|e| ParseError::Invalid(e.to_string()))?;

        let feed = Feed {
            url: url.to_owned(),
            updated: parsed.updated,
            title: parsed.title.map(|t| t.content),
            link: preferred_link(&parsed.links),
            author: parsed.authors.first().map(|p| p.name.clone()),
            user_title: None,
        };

        let entries = parsed
            .entries
            .into_iter()
            .map(|entry| {
                let link = preferred_link(&entry.links);
                let title = entry.title.map(|t| t.content);
                let published = entry.published;
                let id = generate_id(&entry.id, link.as_deref(), title.as_deref(), published);

                let content = entry
                    .content
                    .and_then(|c| {
                        let content_type = c.content_type.to_string();
                        c.body.map(|value| Content {
                            value,
                            content_type: Some(content_type),
                            language: None,
                        })
                    })
                    .into_iter()
                    .collect();

                let enclosures = entry
                    .media
                    .iter()
                    .flat_map(|m| m.content.iter())
                    .filter_map(|c| {
                        Some(Enclosure {
                            href: c.url.as_ref()?.to_string(),
                            content_type: c.content_type.as_ref().map(|t| t.to_string()),
                            length: c.size,
                        })
                    })
                    .collect();

                Entry {
                    title,
                    link,
                    author: entry.authors.first().map(|p| p.name.clone()),
                    published,
                    summary: entry.summary.map(|s| s.content),
                    content,
                    enclosures,
                    ..Entry::new(id, entry.updated.or(published))
                }
            })
            .collect();

        Ok(ParsedFeed { feed, entries })
    }
}

/// The alternate link if there is one, else the first.
fn preferred_link(links: &[feed_rs::model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

fn generate_id(
    existing: &str,
    link: Option<&str>,
    title: Option<&str>,
    published: Option<chrono::DateTime<chrono::Utc>>,
) -> String {
    let trimmed = existing.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    let input = format!(
        "{}|{}|{}",
        link.unwrap_or(""),
        title.unwrap_or(""),
        published.map(|p| p.timestamp().to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
