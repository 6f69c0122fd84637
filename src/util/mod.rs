//! Security boundary for outbound requests.
//!
//! Every URL this crate contacts, and every URL it hands back as trusted,
//! passes through [`SsrfGuard::validate`] first:
//!
//! - **Literal checks** ([`validate_url`]): length, scheme, and literal
//!   loopback/private/link-local hosts
//! - **Resolved checks** ([`SsrfGuard`]): the hostname is resolved once and
//!   every returned address is re-checked; the result pins that address for
//!   the connection that follows
//!
//! # Examples
//!
//! ```
//! use feedgate::util::validate_url;
//!
//! let url = validate_url("https://example.com/feed.xml").unwrap();
//! assert_eq!(url.host_str(), Some("example.com"));
//!
//! assert!(validate_url("http://169.254.169.254/metadata").is_err());
//! ```

mod url_validator;

pub use url_validator::{
    is_blocked_ip, validate_url, GuardError, HostResolver, PinnedUrl, SsrfGuard, SystemResolver,
    UrlValidationError, MAX_URL_LENGTH,
};
