//! Scripted collaborators for driving updates without a network.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use feedkeep::feed::{
    Clock, Coordinator, FetchError, FetchOutcome, FetchedFeed, Fetcher, ParseError, ParsedFeed,
    Parser,
};
use feedkeep::storage::Database;
use feedkeep::{Entry, Feed, Reader};

/// What the fake server answers for one URL.
#[derive(Clone)]
enum Response {
    Document {
        feed: Feed,
        entries: Vec<Entry>,
        etag: Option<String>,
    },
    NotModified,
    Status(u16),
    Garbage,
}

/// Conditional tokens received by the fetcher, per request.
pub type Request = (String, Option<String>, Option<String>);

#[derive(Default)]
pub struct Source {
    responses: Mutex<HashMap<String, Response>>,
    requests: Mutex<Vec<Request>>,
}

impl Source {
    pub fn serve(&self, url: &str, feed: Feed, entries: Vec<Entry>) {
        self.serve_with_etag(url, feed, entries, None);
    }

    pub fn serve_with_etag(&self, url: &str, feed: Feed, entries: Vec<Entry>, etag: Option<&str>) {
        self.set(
            url,
            Response::Document {
                feed,
                entries,
                etag: etag.map(str::to_owned),
            },
        );
    }

    pub fn not_modified(&self, url: &str) {
        self.set(url, Response::NotModified);
    }

    pub fn fail(&self, url: &str, status: u16) {
        self.set(url, Response::Status(status));
    }

    pub fn garbage(&self, url: &str) {
        self.set(url, Response::Garbage);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    fn set(&self, url: &str, response: Response) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_owned(), response);
    }
}

#[async_trait]
impl Fetcher for Source {
    async fn fetch(
        &self,
        url: &str,
        http_etag: Option<&str>,
        http_last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        self.requests.lock().unwrap().push((
            url.to_owned(),
            http_etag.map(str::to_owned),
            http_last_modified.map(str::to_owned),
        ));
        let response = self.responses.lock().unwrap().get(url).cloned();
        match response {
            Some(Response::Document {
                feed,
                entries,
                etag,
            }) => Ok(FetchOutcome::Fetched(FetchedFeed {
                payload: serde_json::to_vec(&(feed, entries)).unwrap(),
                http_etag: etag,
                http_last_modified: None,
            })),
            Some(Response::NotModified) => Ok(FetchOutcome::NotModified),
            Some(Response::Status(status)) => Err(FetchError::HttpStatus(status)),
            Some(Response::Garbage) => Ok(FetchOutcome::Fetched(FetchedFeed {
                payload: b"garbage".to_vec(),
                http_etag: None,
                http_last_modified: None,
            })),
            None => Err(FetchError::HttpStatus(404)),
        }
    }
}

/// Reads back what [`Source`] serialized.
pub struct JsonParser;

impl Parser for JsonParser {
    fn parse(&self, _url: &str, payload: &[u8]) -> Result<ParsedFeed, ParseError> {
        let (feed, entries): (Feed, Vec<Entry>) =
            serde_json::from_slice(payload).map_err(|e| ParseError::Invalid(e.to_string()))?;
        Ok(ParsedFeed { feed, entries })
    }
}

/// A clock the test moves by hand.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }

    pub fn clock(&self) -> Clock {
        let inner = Arc::clone(&self.0);
        Arc::new(move || *inner.lock().unwrap())
    }
}

pub struct Harness {
    pub reader: Reader,
    pub db: Database,
    pub source: Arc<Source>,
    pub clock: ManualClock,
}

pub async fn harness() -> Harness {
    let db = Database::open(":memory:").await.unwrap();
    let source = Arc::new(Source::default());
    let clock = ManualClock::new(at(0));
    let coordinator = Coordinator::new(db.clone(), source.clone(), Arc::new(JsonParser))
        .with_clock(clock.clock());
    let reader = Reader::new(db.clone(), source.clone(), Arc::new(JsonParser))
        .with_coordinator(coordinator);
    Harness {
        reader,
        db,
        source,
        clock,
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn entry(id: &str, updated: Option<i64>) -> Entry {
    Entry {
        title: Some(format!("Entry {}", id)),
        ..Entry::new(id, updated.map(at))
    }
}
