use async_trait::async_trait;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

use crate::util::PinnedUrl;

const USER_AGENT: &str = concat!("feedgate/", env!("CARGO_PKG_VERSION"));

/// Network-level failures while contacting a host.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt exceeded its time budget
    #[error("Network timeout after {0:?}")]
    Timeout(Duration),
    /// TCP/TLS connection could not be established
    #[error("Connection failed: {0}")]
    Connect(String),
    /// Any other request failure (protocol error, body error, etc.)
    #[error("Request failed: {0}")]
    Request(String),
    /// Non-success, non-redirect HTTP status
    #[error("HTTP {0}")]
    HttpStatus(u16),
    /// Hostname did not resolve
    #[error("DNS lookup failed for {host}: {reason}")]
    Dns { host: String, reason: String },
}

impl TransportError {
    /// Returns true if the same request may succeed if repeated shortly.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout(_)
            | TransportError::Connect(_)
            | TransportError::Request(_)
            | TransportError::Dns { .. } => true,
            TransportError::HttpStatus(status) => is_transient_status(*status),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_connect() {
            TransportError::Connect(describe(err))
        } else {
            TransportError::Request(describe(err))
        }
    }
}

/// Statuses worth repeating the request for: 429, 502, 503, 504.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Flatten a reqwest error and its sources into one line, without the URL.
///
/// The root cause (e.g. "Connection refused") lives in the source chain,
/// and the URL is dropped so its path can't be mistaken for a status code.
fn describe(err: reqwest::Error) -> String {
    let err = err.without_url();
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Outcome of a single request, before any redirect is followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopResponse {
    pub status: u16,
    /// Raw `Location` header, if present and valid UTF-8
    pub location: Option<String>,
}

impl HopResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            location: None,
        }
    }

    pub fn redirect(location: impl Into<String>) -> Self {
        Self {
            status: 302,
            location: Some(location.into()),
        }
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound HTTP capability used by the link resolver.
///
/// Implementations send exactly one request to the pinned address and never
/// follow redirects themselves; the caller validates each hop.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, target: &PinnedUrl) -> Result<HopResponse, TransportError>;
}

/// [`HttpTransport`] over `reqwest`, connecting to the address the SSRF
/// guard resolved instead of looking the hostname up again.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, target: &PinnedUrl) -> Result<HopResponse, TransportError> {
        let client = pinned_client(target, self.timeout, Policy::none())
            .map_err(|e| TransportError::from_reqwest(e, self.timeout))?;

        let response = client
            .get(target.url().clone())
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout))?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        Ok(HopResponse {
            status: response.status().as_u16(),
            location,
        })
    }
}

/// Build a client whose DNS for `target`'s host is fixed to the validated address.
pub(crate) fn pinned_client(
    target: &PinnedUrl,
    timeout: Duration,
    redirect: Policy,
) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(redirect)
        .timeout(timeout)
        .user_agent(USER_AGENT);

    if let Some(domain) = target.domain() {
        builder = builder.resolve(domain, target.addr());
    }

    builder.build()
}
