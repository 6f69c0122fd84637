use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use url::{Host, Url};

/// Longest URL accepted at the boundary, in characters.
pub const MAX_URL_LENGTH: usize = 2000;

/// Errors that can occur during URL validation.
///
/// These errors cover both parsing failures and security policy violations
/// designed to prevent SSRF (Server-Side Request Forgery) attacks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlValidationError {
    /// The URL exceeds [`MAX_URL_LENGTH`] characters.
    #[error("URL too long: {0} characters (max {MAX_URL_LENGTH})")]
    TooLong(usize),
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("Invalid URL: missing host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(IpAddr),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
    /// The hostname resolved to a private/internal IP address.
    #[error("Private IP address not allowed: {host} resolves to {ip}")]
    ResolvesToPrivate { host: String, ip: IpAddr },
}

/// Failure of [`SsrfGuard::validate`].
///
/// A lookup failure is kept apart from a policy violation: the name may
/// resolve on a later attempt, while a violation never becomes acceptable.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error(transparent)]
    Violation(#[from] UrlValidationError),
    #[error("DNS lookup failed for {host}: {reason}")]
    Lookup { host: String, reason: String },
}

/// Validates a URL string against the literal SSRF rules.
///
/// Rejects, in order:
/// - URLs longer than [`MAX_URL_LENGTH`] characters
/// - Non-HTTP(S) schemes (e.g., `file://`, `ftp://`, `javascript:`)
/// - Localhost addresses (`localhost`, `127.0.0.1`, `::1`)
/// - Private IP ranges (RFC 1918, link-local, unique local IPv6), including
///   IPv4-mapped IPv6 forms
///
/// Hostnames are not resolved here; use [`SsrfGuard::validate`] before
/// contacting the URL.
///
/// # Errors
///
/// Returns [`UrlValidationError`] describing the first rule that failed.
///
/// # Examples
///
/// ```
/// use feedgate::util::validate_url;
///
/// assert!(validate_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_url("http://localhost/feed").is_err());
/// assert!(validate_url("http://192.168.1.1/feed").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    check_url(url_str, AddressPolicy::PublicOnly)
}

fn check_url(url_str: &str, policy: AddressPolicy) -> Result<Url, UrlValidationError> {
    let length = url_str.chars().count();
    if length > MAX_URL_LENGTH {
        return Err(UrlValidationError::TooLong(length));
    }

    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if policy == AddressPolicy::AllowPrivate {
        return Ok(url);
    }

    // url::Host has already normalized bracketed IPv6 and numeric IPv4 forms
    match url.host() {
        None => return Err(UrlValidationError::MissingHost),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            if domain.eq_ignore_ascii_case("localhost")
                || domain.to_ascii_lowercase().ends_with(".localhost")
            {
                return Err(UrlValidationError::Localhost);
            }
        }
        Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip), policy)?,
        Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip), policy)?,
    }

    Ok(url)
}

fn check_ip(ip: IpAddr, policy: AddressPolicy) -> Result<(), UrlValidationError> {
    if !policy.blocks(&ip) {
        return Ok(());
    }
    if ip.is_loopback() {
        return Err(UrlValidationError::Localhost);
    }
    if is_blocked_ip(&ip) {
        return Err(UrlValidationError::PrivateIp(ip));
    }
    Ok(())
}

/// Returns true for addresses an outbound request must never reach.
///
/// Covers loopback (127/8, ::1), RFC 1918 (10/8, 172.16/12, 192.168/16),
/// link-local (169.254/16, fe80::/10), unique local (fc00::/7), unspecified
/// addresses, and the IPv4-mapped IPv6 form of each IPv4 range.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_blocked_ip(&IpAddr::V4(mapped));
            }
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// DNS capability used by [`SsrfGuard`].
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve `host` to socket addresses on `port`.
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system via `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// A URL that passed the boundary, bound to the address it was checked
/// against.
///
/// Only [`SsrfGuard::validate`] constructs this, so holding one proves the
/// check happened. Connections must go to [`PinnedUrl::addr`] rather than
/// re-resolving the hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedUrl {
    url: Url,
    addr: SocketAddr,
}

impl PinnedUrl {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Hostname to pin, or `None` when the URL already holds a literal IP.
    pub fn domain(&self) -> Option<&str> {
        self.url.domain()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
enum AddressPolicy {
    PublicOnly,
    /// Loopback passes; every other blocked range is still rejected
    AllowLoopback,
    AllowPrivate,
}

impl AddressPolicy {
    fn blocks(self, ip: &IpAddr) -> bool {
        match self {
            AddressPolicy::PublicOnly => is_blocked_ip(ip),
            AddressPolicy::AllowLoopback => !ip.is_loopback() && is_blocked_ip(ip),
            AddressPolicy::AllowPrivate => false,
        }
    }
}

/// The SSRF boundary: literal checks plus resolve-once address checks.
#[derive(Clone)]
pub struct SsrfGuard {
    resolver: Arc<dyn HostResolver>,
    policy: AddressPolicy,
}

impl Default for SsrfGuard {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver))
    }
}

impl SsrfGuard {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            policy: AddressPolicy::PublicOnly,
        }
    }

    /// Guard that skips address checks so tests can reach a local mock server.
    #[cfg(test)]
    pub(crate) fn allowing_private() -> Self {
        Self {
            resolver: Arc::new(SystemResolver),
            policy: AddressPolicy::AllowPrivate,
        }
    }

    /// Guard with the full address checks except loopback, so tests can talk
    /// to a local mock server while names are resolved through `resolver`.
    #[cfg(test)]
    pub(crate) fn allowing_loopback(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            policy: AddressPolicy::AllowLoopback,
        }
    }

    /// Validate `url_str` and resolve its host exactly once.
    ///
    /// Literal rules are applied first (see [`validate_url`]). A hostname is
    /// then resolved and every returned address must be public; the first
    /// address is pinned in the returned [`PinnedUrl`].
    ///
    /// # Errors
    ///
    /// - [`GuardError::Violation`] when any rule rejects the URL
    /// - [`GuardError::Lookup`] when the hostname does not resolve
    pub async fn validate(&self, url_str: &str) -> Result<PinnedUrl, GuardError> {
        let url = check_url(url_str, self.policy).inspect_err(|e| log_violation(url_str, e))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let addr = match url.host() {
            Some(Host::Ipv4(ip)) => SocketAddr::new(IpAddr::V4(ip), port),
            Some(Host::Ipv6(ip)) => SocketAddr::new(IpAddr::V6(ip), port),
            Some(Host::Domain(domain)) => self.resolve_public(domain, port).await?,
            None => return Err(UrlValidationError::MissingHost.into()),
        };

        Ok(PinnedUrl { url, addr })
    }

    async fn resolve_public(&self, host: &str, port: u16) -> Result<SocketAddr, GuardError> {
        let addrs = self
            .resolver
            .lookup(host, port)
            .await
            .map_err(|e| GuardError::Lookup {
                host: host.to_owned(),
                reason: e.to_string(),
            })?;

        let Some(first) = addrs.first() else {
            return Err(GuardError::Lookup {
                host: host.to_owned(),
                reason: "no addresses returned".to_owned(),
            });
        };

        if let Some(blocked) = addrs.iter().find(|a| self.policy.blocks(&a.ip())) {
            let err = UrlValidationError::ResolvesToPrivate {
                host: host.to_owned(),
                ip: blocked.ip(),
            };
            log_violation(host, &err);
            return Err(err.into());
        }

        Ok(SocketAddr::new(first.ip(), port))
    }
}

fn log_violation(target: &str, error: &UrlValidationError) {
    // Cap logged input; rejected URLs may be arbitrarily long
    let shown: String = target.chars().take(200).collect();
    tracing::warn!(category = "ssrf", target = %shown, error = %error, "Rejected URL at SSRF boundary");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticResolver(HashMap<&'static str, Vec<IpAddr>>);

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
            self.0
                .get(host)
                .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unknown host"))
        }
    }

    fn guard_with(entries: &[(&'static str, &[&str])]) -> SsrfGuard {
        let map = entries
            .iter()
            .map(|(host, ips)| (*host, ips.iter().map(|ip| ip.parse().unwrap()).collect()))
            .collect();
        SsrfGuard::new(Arc::new(StaticResolver(map)))
    }

    #[test]
    fn test_valid_urls() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
        assert!(validate_url("http://news.example.org").is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        for url in [
            "file:///etc/passwd",
            "ftp://example.com",
            "gopher://example.com",
            "data:text/plain,hello",
            "javascript:alert(1)",
        ] {
            assert!(
                matches!(
                    validate_url(url),
                    Err(UrlValidationError::UnsupportedScheme(_))
                ),
                "{url} should be rejected by scheme"
            );
        }
    }

    #[test]
    fn test_localhost_rejected() {
        assert_eq!(
            validate_url("http://localhost/feed").unwrap_err(),
            UrlValidationError::Localhost
        );
        assert_eq!(
            validate_url("http://127.0.0.1/feed").unwrap_err(),
            UrlValidationError::Localhost
        );
        assert!(validate_url("http://api.localhost/feed").is_err());
    }

    #[test]
    fn test_private_ips_rejected() {
        assert!(validate_url("http://192.168.1.1/feed").is_err());
        assert!(validate_url("http://10.0.0.1/feed").is_err());
        assert!(validate_url("http://172.16.0.1/feed").is_err());
        assert!(validate_url("http://172.31.255.255/feed").is_err());
    }

    #[test]
    fn test_172_outside_private_block_accepted() {
        assert!(validate_url("http://172.32.0.1/feed").is_ok());
    }

    #[test]
    fn test_ipv6_loopback_rejected() {
        let result = validate_url("http://[::1]/feed");
        assert!(result.is_err());
    }

    #[test]
    fn test_link_local_ipv4_rejected() {
        let result = validate_url("http://169.254.169.254/metadata");
        assert!(matches!(result, Err(UrlValidationError::PrivateIp(_))));
    }

    #[test]
    fn test_link_local_ipv6_rejected() {
        let result = validate_url("http://[fe80::1]/feed");
        assert!(result.is_err());
    }

    #[test]
    fn test_unique_local_ipv6_rejected() {
        assert!(validate_url("http://[fc00::1]/feed").is_err());
        assert!(validate_url("http://[fd12:3456::1]/feed").is_err());
    }

    #[test]
    fn test_ipv4_mapped_ipv6_rejected() {
        assert!(validate_url("http://[::ffff:10.0.0.1]/feed").is_err());
        assert!(validate_url("http://[::ffff:127.0.0.1]/feed").is_err());
    }

    #[test]
    fn test_numeric_ipv4_forms_normalized() {
        // url::Url parses these as 127.0.0.1
        assert!(validate_url("http://2130706433/").is_err());
        assert!(validate_url("http://0x7f.1/").is_err());
    }

    #[test]
    fn test_zero_address_rejected() {
        let result = validate_url("http://0.0.0.0/feed");
        assert!(result.is_err());
    }

    #[test]
    fn test_url_with_port_on_private_ip() {
        let result = validate_url("http://192.168.1.1:8080/feed");
        assert!(result.is_err());

        let result = validate_url("http://10.0.0.1:3000/feed");
        assert!(result.is_err());
    }

    #[test]
    fn test_valid_url_with_port_accepted() {
        let result = validate_url("https://example.com:443/feed.xml");
        assert!(result.is_ok());
    }

    #[test]
    fn test_length_limit() {
        let at_limit = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH - 20));
        assert_eq!(at_limit.len(), MAX_URL_LENGTH);
        assert!(validate_url(&at_limit).is_ok());

        let over = format!("{at_limit}a");
        assert_eq!(
            validate_url(&over).unwrap_err(),
            UrlValidationError::TooLong(MAX_URL_LENGTH + 1)
        );
    }

    #[test]
    fn test_length_checked_before_scheme() {
        let long_file = format!("file:///{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            validate_url(&long_file),
            Err(UrlValidationError::TooLong(_))
        ));
    }

    #[tokio::test]
    async fn test_guard_pins_resolved_address() {
        let guard = guard_with(&[("publisher.example", &["93.184.216.34"])]);
        let pinned = guard
            .validate("https://publisher.example/a")
            .await
            .unwrap();
        assert_eq!(pinned.as_str(), "https://publisher.example/a");
        assert_eq!(pinned.addr(), "93.184.216.34:443".parse().unwrap());
        assert_eq!(pinned.domain(), Some("publisher.example"));
    }

    #[tokio::test]
    async fn test_guard_rejects_name_resolving_to_private() {
        let guard = guard_with(&[("rebind.example", &["10.0.0.5"])]);
        let err = guard.validate("http://rebind.example/").await.unwrap_err();
        assert!(matches!(
            err,
            GuardError::Violation(UrlValidationError::ResolvesToPrivate { .. })
        ));
    }

    #[tokio::test]
    async fn test_guard_rejects_when_any_address_private() {
        let guard = guard_with(&[("mixed.example", &["93.184.216.34", "127.0.0.1"])]);
        assert!(guard.validate("http://mixed.example/").await.is_err());
    }

    #[tokio::test]
    async fn test_guard_literal_ip_skips_lookup() {
        let guard = guard_with(&[]);
        let pinned = guard.validate("http://93.184.216.34:8080/x").await.unwrap();
        assert_eq!(pinned.addr(), "93.184.216.34:8080".parse().unwrap());
        assert_eq!(pinned.domain(), None);
    }

    #[tokio::test]
    async fn test_guard_lookup_failure_is_not_violation() {
        let guard = guard_with(&[]);
        let err = guard.validate("https://nowhere.example/").await.unwrap_err();
        assert!(matches!(err, GuardError::Lookup { .. }));
    }

    #[tokio::test]
    async fn test_guard_metadata_endpoint_rejected() {
        let guard = guard_with(&[]);
        let err = guard
            .validate("http://169.254.169.254/metadata")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Violation(_)));
    }
}
