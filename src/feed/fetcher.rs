use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while retrieving a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Non-2xx, non-304 response
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length, after max retries
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Invalid feed URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// A retrieved feed document with its fresh conditional-fetch tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFeed {
    pub payload: Vec<u8>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The source reports no change since the given tokens.
    NotModified,
    Fetched(FetchedFeed),
}

/// Retrieves raw feed documents.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, passing the prior tokens so the source may answer "not modified".
    async fn fetch(
        &self,
        url: &str,
        http_etag: Option<&str>,
        http_last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-request timeout
    pub timeout: Duration,
    /// Response bodies larger than this are rejected
    pub max_size: usize,
    /// Retries for 429, 5xx and truncated bodies
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_delay * 2^n`
    pub retry_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_size: 10 * 1024 * 1024,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// [`Fetcher`] over HTTP(S) using conditional GET (ETag / Last-Modified).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: FetchConfig) -> Self {
        Self { client, config }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.config.retry_delay * 2u32.saturating_pow(retry)
    }
}

fn parse_feed_url(url: &str) -> Result<url::Url, FetchError> {
    let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_owned(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::InvalidUrl {
            url: url.to_owned(),
            reason: format!("unsupported scheme {:?}", other),
        }),
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        http_etag: Option<&str>,
        http_last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let target = parse_feed_url(url)?;
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(target.clone());
            if let Some(etag) = http_etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = http_last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }

            // The timeout covers headers and body of one attempt
            let deadline = tokio::time::Instant::now() + self.config.timeout;
            let response = tokio::time::timeout_at(deadline, request.send())
                .await
                .map_err(|_| FetchError::Timeout)??;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                tracing::debug!(feed = %url, "Not modified");
                return Ok(FetchOutcome::NotModified);
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= self.config.max_retries {
                    return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited(self.config.max_retries)
                    } else {
                        FetchError::HttpStatus(status.as_u16())
                    });
                }
                let delay = self.backoff(retry_count);
                tracing::warn!(
                    feed = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let etag = header_value(&response, ETAG);
            let last_modified = header_value(&response, LAST_MODIFIED);

            let body = tokio::time::timeout_at(
                deadline,
                read_limited_bytes(response, self.config.max_size),
            )
            .await
            .map_err(|_| FetchError::Timeout)?;

            match body {
                Ok(payload) => {
                    return Ok(FetchOutcome::Fetched(FetchedFeed {
                        payload,
                        http_etag: etag,
                        http_last_modified: last_modified,
                    }))
                }
                Err(FetchError::IncompleteResponse { expected, received })
                    if retry_count < self.config.max_retries =>
                {
                    let delay = self.backoff(retry_count);
                    tracing::debug!(
                        feed = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(
            "feedkeep-test",
            FetchConfig {
                retry_delay: Duration::from_millis(10),
                ..FetchConfig::default()
            },
        )
        .unwrap()
    }

    fn fetched(outcome: FetchOutcome) -> FetchedFeed {
        match outcome {
            FetchOutcome::Fetched(feed) => feed,
            FetchOutcome::NotModified => panic!("Expected a fetched feed"),
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_payload_and_tokens() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Sat, 01 Jan 2022 00:00:00 GMT"),
            )
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let feed = fetched(fetcher().fetch(&url, None, None).await.unwrap());
        assert_eq!(feed.payload, VALID_RSS.as_bytes());
        assert_eq!(feed.http_etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            feed.http_last_modified.as_deref(),
            Some("Sat, 01 Jan 2022 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_conditional_headers_yield_not_modified() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header_exists("If-Modified-Since"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let outcome = fetcher()
            .fetch(&url, Some("\"v1\""), Some("Sat, 01 Jan 2022 00:00:00 GMT"))
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::NotModified);
    }

    #[tokio::test]
    async fn test_404_fails_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        match fetcher().fetch(&url, None, None).await {
            Err(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        match fetcher().fetch(&url, None, None).await {
            Err(FetchError::HttpStatus(500)) => {}
            other => panic!("Expected HttpStatus(500), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        let feed = fetched(fetcher().fetch(&url, None, None).await.unwrap());
        assert!(!feed.payload.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&mock_server)
            .await;

        let url = format!("{}/feed", mock_server.uri());
        assert!(matches!(
            fetcher().fetch(&url, None, None).await,
            Err(FetchError::RateLimited(3))
        ));
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 1024]))
            .mount(&mock_server)
            .await;

        let fetcher = HttpFetcher::new(
            "feedkeep-test",
            FetchConfig {
                max_size: 100,
                ..FetchConfig::default()
            },
        )
        .unwrap();
        let url = format!("{}/feed", mock_server.uri());
        assert!(matches!(
            fetcher.fetch(&url, None, None).await,
            Err(FetchError::ResponseTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n<rss>")
                .await
                .unwrap();
            // headers sent, body never finishes
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let fetcher = HttpFetcher::new(
            "feedkeep-test",
            FetchConfig {
                timeout: Duration::from_millis(200),
                max_retries: 0,
                ..FetchConfig::default()
            },
        )
        .unwrap();
        let url = format!("http://{}/feed", addr);
        let started = std::time::Instant::now();
        assert!(matches!(
            fetcher.fetch(&url, None, None).await,
            Err(FetchError::Timeout)
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[tokio::test]
    async fn test_rejects_non_http_urls() {
        for url in ["file:///etc/passwd", "not a url"] {
            assert!(matches!(
                fetcher().fetch(url, None, None).await,
                Err(FetchError::InvalidUrl { .. })
            ));
        }
    }
}
