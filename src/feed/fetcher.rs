use futures::stream::{self, StreamExt};
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::feed::parser::{parse_feed, ParseResult};
use crate::resolver::pinned_client;
use crate::storage::{Database, Feed};
use crate::util::{GuardError, PinnedUrl, SsrfGuard, UrlValidationError};

/// Feeds fetched at once by [`refresh_all`]
const CONCURRENT_FETCHES: usize = 10;

/// Redirect hops followed for a feed URL
const MAX_FEED_REDIRECTS: usize = 3;

/// Errors that can occur during feed fetching operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Feed URL rejected by the SSRF guard
    #[error("SSRF violation: {0}")]
    Blocked(#[from] UrlValidationError),
    /// Feed host did not resolve
    #[error("DNS lookup failed for {host}: {reason}")]
    Dns { host: String, reason: String },
    /// Network-level error (connection, TLS, redirect policy, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Database operation failed during article storage
    #[error("Database error: {0}")]
    Database(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Redirect chain was malformed, too long or looped
    #[error("Invalid redirect: {0}")]
    Redirect(String),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl From<GuardError> for FetchError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Violation(violation) => FetchError::Blocked(violation),
            GuardError::Lookup { host, reason } => FetchError::Dns { host, reason },
        }
    }
}

/// Tunables for feed fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub timeout: Duration,
    /// Retries after 429, 5xx or a truncated body
    pub max_retries: u32,
    /// First retry pause; doubles per retry (1s, 2s, 4s by default)
    pub retry_base: Duration,
    pub max_feed_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            max_feed_size: 10 * 1024 * 1024,
        }
    }
}

/// Result of a single feed fetch operation.
#[derive(Debug)]
pub struct FetchResult {
    /// Database ID of the feed that was fetched
    pub feed_id: i64,
    /// Number of new articles inserted, or the error that occurred
    pub result: Result<usize, FetchError>,
}

/// Refreshes all feeds concurrently.
///
/// Each feed's URL, and every redirect hop after it, passes the SSRF guard
/// and is requested on a client pinned to the address the guard resolved.
/// New entries are stored `pending` for the link processor. Errors are
/// recorded on the feed row.
///
/// Results are returned in completion order, not input order.
pub async fn refresh_all(
    db: &Database,
    guard: &SsrfGuard,
    feeds: Vec<Feed>,
    config: &FetchConfig,
) -> Vec<FetchResult> {
    stream::iter(feeds)
        .map(|feed| async move { refresh_one(db, guard, &feed, config).await })
        .buffer_unordered(CONCURRENT_FETCHES)
        .collect()
        .await
}

/// Refreshes a single feed and records the outcome on its row.
pub async fn refresh_one(
    db: &Database,
    guard: &SsrfGuard,
    feed: &Feed,
    config: &FetchConfig,
) -> FetchResult {
    let result = fetch_one(db, guard, feed, config).await;

    // Success already cleared the error inside complete_feed_refresh
    if let Err(e) = &result {
        tracing::warn!(feed = %feed.url, error = %e, "Feed refresh failed");
        if let Err(db_err) = db.set_feed_error(feed.id, Some(&e.to_string())).await {
            tracing::warn!(feed_id = feed.id, error = %db_err, "Failed to record feed error");
        }
    }

    FetchResult {
        feed_id: feed.id,
        result,
    }
}

async fn fetch_one(
    db: &Database,
    guard: &SsrfGuard,
    feed: &Feed,
    config: &FetchConfig,
) -> Result<usize, FetchError> {
    let mut target = guard.validate(&feed.url).await?;
    let mut visited: Vec<Url> = Vec::new();

    let bytes = loop {
        match fetch_hop(&target, feed, config).await? {
            Hop::Body(bytes) => break bytes,
            Hop::Redirect(location) => {
                let next = next_hop(target.url(), &location, &mut visited)?;
                tracing::debug!(
                    from = %target.as_str(),
                    to = %next,
                    hop = visited.len(),
                    "Following feed redirect"
                );
                target = guard.validate(next.as_str()).await?;
            }
        }
    };

    let ParseResult {
        title,
        articles,
        skipped,
    } = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    if skipped > 0 {
        tracing::warn!(
            feed = %feed.url,
            skipped = skipped,
            "Entries without an http(s) link skipped"
        );
    }

    let count = db
        .complete_feed_refresh(feed.id, title.as_deref(), &articles)
        .await
        .map_err(|e| FetchError::Database(e.to_string()))?;

    tracing::info!(feed = %feed.url, new_articles = count, "Feed refreshed");
    Ok(count)
}

/// Outcome of one feed request.
enum Hop {
    Body(Vec<u8>),
    /// Raw `Location` of a 3xx response
    Redirect(String),
}

/// Request one validated URL on a client pinned to its address, retrying
/// 429, 5xx and truncated bodies. Redirects are returned, never followed.
async fn fetch_hop(
    target: &PinnedUrl,
    feed: &Feed,
    config: &FetchConfig,
) -> Result<Hop, FetchError> {
    let client = pinned_client(target, config.timeout, Policy::none())?;
    let mut retry_count = 0;

    loop {
        let request = client.get(target.url().clone()).send();
        let response = tokio::time::timeout(config.timeout, request)
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e)
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            if retry_count >= config.max_retries {
                return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    FetchError::RateLimited(config.max_retries)
                } else {
                    FetchError::HttpStatus(status.as_u16())
                });
            }

            let delay = retry_delay(config, retry_count);
            tracing::warn!(
                feed = %feed.url,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Feed server busy, retrying after delay"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    FetchError::Redirect(format!("{} without Location", status.as_u16()))
                })?;
            return Ok(Hop::Redirect(location.to_owned()));
        }

        // 4xx errors fail immediately
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        match read_limited_bytes(response, config.max_feed_size).await {
            Ok(bytes) => return Ok(Hop::Body(bytes)),
            Err(FetchError::IncompleteResponse { expected, received }) => {
                if retry_count >= config.max_retries {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }

                let delay = retry_delay(config, retry_count);
                tracing::debug!(
                    feed = %feed.url,
                    expected = expected,
                    received = received,
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolve `location` against `current` and enforce the hop limit and loop
/// check. `visited` gains `current`.
fn next_hop(current: &Url, location: &str, visited: &mut Vec<Url>) -> Result<Url, FetchError> {
    let next = current
        .join(location)
        .map_err(|_| FetchError::Redirect(format!("invalid Location {location:?}")))?;

    visited.push(current.clone());
    if visited.len() > MAX_FEED_REDIRECTS {
        return Err(FetchError::Redirect(format!(
            "more than {MAX_FEED_REDIRECTS} redirects"
        )));
    }
    if visited.contains(&next) {
        return Err(FetchError::Redirect(format!("loop back to {next}")));
    }
    Ok(next)
}

fn retry_delay(config: &FetchConfig, retry_count: u32) -> Duration {
    config
        .retry_base
        .saturating_mul(1u32 << retry_count.min(16))
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // Interrupted transfers deliver fewer bytes than Content-Length announced
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
