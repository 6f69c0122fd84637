//! Aggregator link resolution.
//!
//! Turns an aggregator link into the publisher URL it stands for:
//!
//! - **Legacy links** (`.../articles/CBM...`) carry the target inside a
//!   base64 envelope and are decoded locally, see [`envelope`]
//! - **Redirect links** are fetched and their redirect chain followed hop by
//!   hop; every hop passes the SSRF guard and the shared [`RateLimiter`]
//!   before it is contacted
//!
//! Either way the returned [`ResolvedUrl`] has passed
//! [`SsrfGuard::validate`](crate::util::SsrfGuard::validate).
//!
//! # Example
//!
//! ```ignore
//! let resolver = LinkResolver::new(
//!     SsrfGuard::default(),
//!     Arc::new(ReqwestTransport::new(config.fetch_timeout)),
//!     Arc::new(RateLimiter::new(config.rate_limit_spacing)),
//!     config,
//! );
//! let url = resolver.resolve("https://news.example/rss/articles/CBMi...").await?;
//! ```

pub mod envelope;
mod rate_limit;
mod transport;

pub use rate_limit::RateLimiter;
pub use transport::{
    is_transient_status, HopResponse, HttpTransport, ReqwestTransport, TransportError,
};
pub(crate) use transport::pinned_client;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::{GuardError, PinnedUrl, SsrfGuard, UrlValidationError};

// ============================================================================
// Error Types
// ============================================================================

/// The link (or what it decoded/redirected to) is unusable as given.
///
/// Every variant is permanent: the same input fails the same way on retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Invalid URL: {0}")]
    InvalidLink(#[from] url::ParseError),
    #[error("Malformed link payload: not valid base64")]
    InvalidBase64,
    #[error("Malformed link envelope: {0}")]
    Envelope(String),
    #[error("Malformed link envelope: URL bytes are not valid UTF-8")]
    NotUtf8,
    #[error("No parseable content: decoded URL is empty")]
    EmptyUrl,
    #[error("Invalid URL: decoded value {0:?} is not absolute")]
    NotAbsolute(String),
    #[error("Malformed redirect: status {0} without Location header")]
    MissingLocation(u16),
    #[error("Invalid URL in redirect Location: {0:?}")]
    BadLocation(String),
    #[error("Malformed redirect chain: more than {0} redirects")]
    TooManyRedirects(usize),
    #[error("Malformed redirect chain: loop back to {0}")]
    RedirectLoop(String),
}

/// Failure of [`LinkResolver::resolve`].
///
/// `Display` output is what callers hand to the retry queue, so each
/// variant's text classifies the same way as the variant itself:
/// `Security` and `Resolution` are permanent, `Transport` follows its status.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("SSRF violation: {0}")]
    Security(#[from] UrlValidationError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<GuardError> for ResolveError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Violation(violation) => ResolveError::Security(violation),
            GuardError::Lookup { host, reason } => {
                ResolveError::Transport(TransportError::Dns { host, reason })
            }
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Canonical publisher URL that has passed the SSRF boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedUrl(String);

impl ResolvedUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ResolvedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tunables for [`LinkResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Per-attempt budget for one request
    pub fetch_timeout: Duration,
    /// Redirect hops followed before giving up
    pub max_redirects: usize,
    /// Minimum spacing between outbound requests
    pub rate_limit_spacing: Duration,
    /// Local retries of one hop after a transient failure
    pub max_fetch_retries: u32,
    /// First local retry pause; doubles on each further retry
    pub fetch_retry_base: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            max_redirects: 10,
            rate_limit_spacing: Duration::from_millis(500),
            max_fetch_retries: 3,
            fetch_retry_base: Duration::from_millis(200),
        }
    }
}

/// The two aggregator link encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEncoding {
    /// Base64 envelope payload taken from the link's path
    Legacy(String),
    /// Anything else: resolved by following HTTP redirects
    Redirect(Url),
}

impl LinkEncoding {
    /// Detect which encoding `link` uses.
    ///
    /// A link is legacy-encoded when a path segment `articles` is followed by
    /// a segment starting with the envelope marker `CBM`.
    pub fn detect(link: &str) -> Result<Self, ResolutionError> {
        let url = Url::parse(link.trim())?;
        match legacy_payload(&url) {
            Some(payload) => Ok(LinkEncoding::Legacy(payload.to_owned())),
            None => Ok(LinkEncoding::Redirect(url)),
        }
    }
}

fn legacy_payload(url: &Url) -> Option<&str> {
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "articles" {
            return segments
                .next()
                .filter(|payload| payload.starts_with(envelope::LEGACY_MARKER));
        }
    }
    None
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves aggregator links to publisher URLs.
pub struct LinkResolver {
    guard: SsrfGuard,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    config: ResolverConfig,
}

impl LinkResolver {
    pub fn new(
        guard: SsrfGuard,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            guard,
            transport,
            limiter,
            config,
        }
    }

    /// Resolve `link` to its canonical publisher URL.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::Security`] if the link, any redirect hop, or the
    ///   decoded URL is rejected by the SSRF boundary
    /// - [`ResolveError::Resolution`] if the link cannot be decoded or its
    ///   redirect chain is malformed
    /// - [`ResolveError::Transport`] if the network failed after local retries
    pub async fn resolve(&self, link: &str) -> Result<ResolvedUrl, ResolveError> {
        match LinkEncoding::detect(link)? {
            LinkEncoding::Legacy(payload) => {
                let candidate = envelope::decode_payload(&payload)?;
                self.guard.validate(&candidate).await?;
                tracing::debug!(url = %candidate, "Decoded legacy aggregator link");
                Ok(ResolvedUrl(candidate))
            }
            LinkEncoding::Redirect(start) => self.follow_redirects(start).await,
        }
    }

    /// Follow the redirect chain starting at `start`.
    ///
    /// Each hop is validated and pinned before it is requested, so the URL
    /// returned is the last one that passed the guard and answered 2xx.
    async fn follow_redirects(&self, start: Url) -> Result<ResolvedUrl, ResolveError> {
        let mut current = start;
        let mut visited: Vec<Url> = Vec::new();

        loop {
            let hop = self.fetch_with_retry(&current).await?;

            if hop.is_success() {
                return Ok(ResolvedUrl(current.into()));
            }
            if !hop.is_redirect() {
                return Err(TransportError::HttpStatus(hop.status).into());
            }

            let location = hop
                .location
                .ok_or(ResolutionError::MissingLocation(hop.status))?;
            let next = current
                .join(&location)
                .map_err(|_| ResolutionError::BadLocation(location.clone()))?;

            visited.push(current);
            if visited.len() > self.config.max_redirects {
                return Err(ResolutionError::TooManyRedirects(self.config.max_redirects).into());
            }
            if visited.contains(&next) {
                return Err(ResolutionError::RedirectLoop(next.to_string()).into());
            }

            tracing::debug!(
                from = %visited.last().map(Url::as_str).unwrap_or("initial"),
                to = %next,
                hop = visited.len(),
                "Following redirect"
            );
            current = next;
        }
    }

    /// One hop with local retry: DNS failures, timeouts, connection failures
    /// and 429/502/503/504 are retried with exponential pauses (200ms, 400ms,
    /// 800ms by default). Each attempt validates and pins `url` afresh, and
    /// waits for the rate limiter before sending.
    async fn fetch_with_retry(&self, url: &Url) -> Result<HopResponse, ResolveError> {
        let mut retry_count = 0;

        loop {
            let result = match self.guard.validate(url.as_str()).await {
                Ok(target) => self.send_once(&target).await,
                Err(GuardError::Lookup { host, reason }) => {
                    Err(TransportError::Dns { host, reason })
                }
                Err(violation) => return Err(violation.into()),
            };

            match result {
                Err(e) if e.is_transient() && retry_count < self.config.max_fetch_retries => {
                    let delay = self
                        .config
                        .fetch_retry_base
                        .saturating_mul(1u32 << retry_count.min(16));
                    tracing::debug!(
                        url = %url,
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying fetch after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                other => return other.map_err(ResolveError::from),
            }
        }
    }

    /// Send one request to the pinned address. Transient statuses become errors.
    async fn send_once(&self, target: &PinnedUrl) -> Result<HopResponse, TransportError> {
        self.limiter.acquire().await;

        tokio::time::timeout(self.config.fetch_timeout, self.transport.send(target))
            .await
            .unwrap_or(Err(TransportError::Timeout(self.config.fetch_timeout)))
            .and_then(|hop| {
                if is_transient_status(hop.status) {
                    Err(TransportError::HttpStatus(hop.status))
                } else {
                    Ok(hop)
                }
            })
    }
}
