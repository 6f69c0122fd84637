/// Whether a failure is worth retrying later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    Retryable,
    Permanent,
}

/// HTTP statuses that will not change on retry.
const PERMANENT_STATUSES: &[&str] = &["403", "404"];

/// HTTP statuses signalling a temporary upstream condition.
const RETRYABLE_STATUSES: &[&str] = &["429", "502", "503", "504"];

const PERMANENT_MARKERS: &[&str] = &[
    "ssrf",
    "security violation",
    "invalid url",
    "malformed",
    "no parseable content",
    "unsupported scheme",
    "private ip",
    "localhost not allowed",
    "duplicate",
];

const RETRYABLE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection failed",
    "dns",
    "name resolution",
    "too many requests",
    "bad gateway",
    "service unavailable",
];

/// Classify an error description.
///
/// Matching is case-insensitive. Status codes only match as whole tokens,
/// so `"port 4040"` is not a 404. Permanent markers win over retryable ones.
/// Descriptions matching neither list are [`FailureClass::Retryable`].
///
/// # Examples
///
/// ```
/// use feedgate::retry::{classify, FailureClass};
///
/// assert_eq!(classify("Network timeout after 10s"), FailureClass::Retryable);
/// assert_eq!(classify("HTTP 404"), FailureClass::Permanent);
/// assert_eq!(classify("something odd"), FailureClass::Retryable);
/// ```
pub fn classify(description: &str) -> FailureClass {
    matched_rule(description).unwrap_or(FailureClass::Retryable)
}

/// Shorthand for `classify(description) == FailureClass::Retryable`.
pub fn is_retryable(description: &str) -> bool {
    classify(description) == FailureClass::Retryable
}

/// The class an explicit rule assigns, or `None` when the description is
/// unclassified and falls through to the default.
pub(crate) fn matched_rule(description: &str) -> Option<FailureClass> {
    let lowered = description.to_lowercase();
    let has_status = |statuses: &[&str]| {
        lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| statuses.contains(&token))
    };
    let has_marker = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

    if has_status(PERMANENT_STATUSES) || has_marker(PERMANENT_MARKERS) {
        Some(FailureClass::Permanent)
    } else if has_status(RETRYABLE_STATUSES) || has_marker(RETRYABLE_MARKERS) {
        Some(FailureClass::Retryable)
    } else {
        None
    }
}
