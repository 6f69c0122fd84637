//! Persistent retry scheduling for failed resolutions.
//!
//! Retry state lives on the article record. This module decides what that
//! state becomes after a failure:
//!
//! - [`classify`] sorts an error description into retryable or permanent
//! - [`BackoffPolicy`] turns an attempt count into a jittered delay
//! - [`RetryQueue`] applies the resulting transition through an
//!   [`ArticleStore`] and answers "what is due now"
//!
//! Polling cadence is left to the caller (see `feed::LinkProcessor`).

mod backoff;
mod classifier;
mod queue;

pub use backoff::{compute_backoff, BackoffPolicy};
pub use classifier::{classify, is_retryable, FailureClass};
pub use queue::{ArticleStore, RetryConfig, RetryDecision, RetryError, RetryQueue, Transition};

/// Attempts after which an item fails permanently.
pub const MAX_RETRIES: u32 = 3;
