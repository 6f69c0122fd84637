use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::time::Duration;
use thiserror::Error;

use super::backoff::BackoffPolicy;
use super::classifier::{matched_rule, FailureClass};
use super::MAX_RETRIES;
use crate::resolver::ResolvedUrl;
use crate::storage::{DatabaseError, RetryableItem};

/// Longest error text stored on an article, in characters.
const MAX_ERROR_LEN: usize = 1000;

// ============================================================================
// Storage Contract
// ============================================================================

/// A state change for one article, applied atomically by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Failed, with a retry scheduled at `next_retry_at`
    Scheduled {
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    /// Failed with no further retries
    Failed { attempt_count: u32, error: String },
    /// Resolved; records the URL when one is given
    Completed { resolved_url: Option<String> },
}

/// Article storage as seen by the retry queue.
///
/// Implementations must apply each [`Transition`] as one atomic update so
/// no reader sees a retry time next to a stale attempt count, and must never
/// lower a stored attempt count.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Read one article's retry state.
    async fn retry_state(&self, id: i64) -> Result<Option<RetryableItem>, DatabaseError>;

    /// Apply `transition` to article `id`. Returns `false` if no such article.
    async fn apply_transition(&self, id: i64, transition: &Transition)
        -> Result<bool, DatabaseError>;

    /// Articles awaiting retry whose retry time is at or before `now`.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryableItem>, DatabaseError>;

    /// Articles never attempted yet.
    async fn find_pending(&self, limit: usize) -> Result<Vec<RetryableItem>, DatabaseError>;
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Article {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

/// Outcome of [`RetryQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RetryDecision {
    pub scheduled: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryDecision {
    fn not_scheduled() -> Self {
        Self {
            scheduled: false,
            next_retry_at: None,
        }
    }
}

/// Tunables for [`RetryQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Retry state machine over an [`ArticleStore`].
///
/// ```text
/// pending ──ok──────────────▶ success
///    │
///    └─fail─▶ classify ─permanent / attempts exhausted─▶ failed
///                │
///                └─retryable─▶ retrying (next_retry_at = now + backoff)
///                                 │
///                                 └─ due ─▶ re-run with attempt + 1
/// ```
pub struct RetryQueue<S> {
    store: S,
    config: RetryConfig,
}

impl<S: ArticleStore> RetryQueue<S> {
    pub fn new(store: S, config: RetryConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a failed attempt and schedule a retry if one is warranted.
    ///
    /// `current_attempt_count` is 0 for a first failure and `stored + 1` for
    /// a failed retry. Ordinary outcomes are reported through the returned
    /// [`RetryDecision`]; errors mean the store could not be updated.
    ///
    /// # Errors
    ///
    /// - [`RetryError::NotFound`] if the article does not exist
    /// - [`RetryError::Storage`] if the update failed
    pub async fn enqueue(
        &self,
        item_id: i64,
        error: &str,
        current_attempt_count: u32,
    ) -> Result<RetryDecision, RetryError> {
        self.enqueue_at(item_id, error, current_attempt_count, Utc::now())
            .await
    }

    /// [`enqueue`](Self::enqueue) with an explicit notion of "now".
    pub async fn enqueue_at(
        &self,
        item_id: i64,
        error: &str,
        current_attempt_count: u32,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, RetryError> {
        // Classify the whole description; only the stored copy is capped
        let rule = matched_rule(error);
        let error = truncate_error(error);
        let (transition, decision) = self.decide(item_id, error, rule, current_attempt_count, now);

        if !self.store.apply_transition(item_id, &transition).await? {
            return Err(RetryError::NotFound(item_id));
        }
        Ok(decision)
    }

    fn decide(
        &self,
        item_id: i64,
        error: String,
        rule: Option<FailureClass>,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> (Transition, RetryDecision) {
        if attempt_count >= self.config.max_attempts {
            tracing::info!(
                category = "retry",
                item_id = item_id,
                attempt_count = attempt_count,
                max_attempts = self.config.max_attempts,
                error = %error,
                "Retries exhausted, marking failed"
            );
            return (
                Transition::Failed {
                    attempt_count,
                    error,
                },
                RetryDecision::not_scheduled(),
            );
        }

        if rule == Some(FailureClass::Permanent) {
            tracing::info!(
                category = "retry",
                item_id = item_id,
                attempt_count = attempt_count,
                error = %error,
                "Permanent failure, not scheduling retry"
            );
            return (
                Transition::Failed {
                    attempt_count,
                    error,
                },
                RetryDecision::not_scheduled(),
            );
        }

        let delay = self.config.backoff.delay(attempt_count);
        let next_retry_at = add_delay(now, delay);
        tracing::info!(
            category = "retry",
            item_id = item_id,
            attempt_count = attempt_count,
            delay_secs = delay.as_secs(),
            next_retry_at = %next_retry_at,
            unclassified = rule.is_none(),
            error = %error,
            "Scheduled retry"
        );

        (
            Transition::Scheduled {
                attempt_count,
                next_retry_at,
                error,
            },
            RetryDecision {
                scheduled: true,
                next_retry_at: Some(next_retry_at),
            },
        )
    }

    /// Mark an article resolved, clearing any scheduled retry. The attempt
    /// count is left as is.
    pub async fn mark_complete(&self, item_id: i64) -> Result<(), RetryError> {
        self.complete(item_id, None).await
    }

    /// [`mark_complete`](Self::mark_complete), also storing the resolved URL.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::DuplicateUrl`] (wrapped in [`RetryError::Storage`]) if
    /// another article already owns `url`.
    pub async fn mark_resolved(&self, item_id: i64, url: &ResolvedUrl) -> Result<(), RetryError> {
        self.complete(item_id, Some(url.as_str().to_owned())).await
    }

    async fn complete(&self, item_id: i64, resolved_url: Option<String>) -> Result<(), RetryError> {
        let transition = Transition::Completed { resolved_url };
        if !self.store.apply_transition(item_id, &transition).await? {
            return Err(RetryError::NotFound(item_id));
        }
        tracing::debug!(category = "retry", item_id = item_id, "Marked complete");
        Ok(())
    }

    /// Items whose scheduled retry time is at or before `now`, oldest first.
    pub async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryableItem>, RetryError> {
        Ok(self.store.find_due(now, limit).await?)
    }

    pub async fn find_pending(&self, limit: usize) -> Result<Vec<RetryableItem>, RetryError> {
        Ok(self.store.find_pending(limit).await?)
    }

    pub async fn state(&self, item_id: i64) -> Result<Option<RetryableItem>, RetryError> {
        Ok(self.store.retry_state(item_id).await?)
    }
}

/// `now + delay` at the millisecond precision the store keeps.
fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .trunc_subsecs(3)
}

fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => error[..idx].to_owned(),
        None => error.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ResolutionStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store recording every transition it applies.
    #[derive(Default)]
    struct MemoryStore {
        items: Mutex<HashMap<i64, RetryableItem>>,
        applied: Mutex<Vec<(i64, Transition)>>,
    }

    impl MemoryStore {
        fn with_items(ids: &[i64]) -> Self {
            let store = Self::default();
            for id in ids {
                store.items.lock().unwrap().insert(
                    *id,
                    RetryableItem {
                        id: *id,
                        link: format!("https://news.example/r/{id}"),
                        status: ResolutionStatus::Pending,
                        attempt_count: 0,
                        next_retry_at: None,
                        last_error: None,
                    },
                );
            }
            store
        }
    }

    #[async_trait]
    impl ArticleStore for MemoryStore {
        async fn retry_state(&self, id: i64) -> Result<Option<RetryableItem>, DatabaseError> {
            Ok(self.items.lock().unwrap().get(&id).cloned())
        }

        async fn apply_transition(
            &self,
            id: i64,
            transition: &Transition,
        ) -> Result<bool, DatabaseError> {
            let mut items = self.items.lock().unwrap();
            let Some(item) = items.get_mut(&id) else {
                return Ok(false);
            };
            apply(item, transition);
            self.applied.lock().unwrap().push((id, transition.clone()));
            Ok(true)
        }

        async fn find_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<RetryableItem>, DatabaseError> {
            let items = self.items.lock().unwrap();
            Ok(items
                .values()
                .filter(|i| i.is_due(now))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn find_pending(&self, limit: usize) -> Result<Vec<RetryableItem>, DatabaseError> {
            let items = self.items.lock().unwrap();
            Ok(items
                .values()
                .filter(|i| i.status == ResolutionStatus::Pending)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    fn apply(item: &mut RetryableItem, transition: &Transition) {
        match transition {
            Transition::Scheduled {
                attempt_count,
                next_retry_at,
                error,
            } => {
                item.status = ResolutionStatus::Retrying;
                item.attempt_count = item.attempt_count.max(*attempt_count);
                item.next_retry_at = Some(*next_retry_at);
                item.last_error = Some(error.clone());
            }
            Transition::Failed {
                attempt_count,
                error,
            } => {
                item.status = ResolutionStatus::Failed;
                item.attempt_count = item.attempt_count.max(*attempt_count);
                item.next_retry_at = None;
                item.last_error = Some(error.clone());
            }
            Transition::Completed { .. } => {
                item.status = ResolutionStatus::Success;
                item.next_retry_at = None;
            }
        }
    }

    fn queue(ids: &[i64]) -> RetryQueue<MemoryStore> {
        RetryQueue::new(MemoryStore::with_items(ids), RetryConfig::default())
    }

    #[tokio::test]
    async fn test_retryable_error_schedules() {
        let queue = queue(&[5]);
        let now = Utc::now();
        let decision = queue.enqueue_at(5, "Network timeout", 0, now).await.unwrap();

        assert!(decision.scheduled);
        let next = decision.next_retry_at.unwrap();
        let delta = (next - now).num_milliseconds();
        assert!((59_999..70_000).contains(&delta), "delta {delta}ms");

        let state = queue.state(5).await.unwrap().unwrap();
        assert_eq!(state.status, ResolutionStatus::Retrying);
        assert_eq!(state.next_retry_at, Some(next));
        assert_eq!(state.last_error.as_deref(), Some("Network timeout"));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_never_schedule() {
        let queue = queue(&[1]);
        for error in ["Network timeout", "HTTP 503", "", "weird"] {
            let decision = queue.enqueue(1, error, MAX_RETRIES).await.unwrap();
            assert_eq!(decision, RetryDecision::not_scheduled());
        }
        let state = queue.state(1).await.unwrap().unwrap();
        assert_eq!(state.status, ResolutionStatus::Failed);
        assert_eq!(state.attempt_count, MAX_RETRIES);
        assert_eq!(state.next_retry_at, None);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_at_attempt_zero() {
        let queue = queue(&[1]);
        let decision = queue.enqueue(1, "HTTP 404", 0).await.unwrap();
        assert!(!decision.scheduled);
        assert_eq!(decision.next_retry_at, None);

        let applied = queue.store().applied.lock().unwrap();
        assert!(matches!(
            applied[0].1,
            Transition::Failed { attempt_count: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_backoff_grows_with_attempts() {
        let queue = queue(&[1]);
        let now = Utc::now();
        let d1 = queue.enqueue_at(1, "HTTP 503", 1, now).await.unwrap();
        let ms = (d1.next_retry_at.unwrap() - now).num_milliseconds();
        assert!((119_999..130_000).contains(&ms));

        let d2 = queue.enqueue_at(1, "HTTP 503", 2, now).await.unwrap();
        let ms = (d2.next_retry_at.unwrap() - now).num_milliseconds();
        assert!((239_999..250_000).contains(&ms));
    }

    #[tokio::test]
    async fn test_unknown_item_is_error() {
        let queue = queue(&[]);
        assert!(matches!(
            queue.enqueue(42, "Network timeout", 0).await,
            Err(RetryError::NotFound(42))
        ));
        assert!(matches!(
            queue.mark_complete(42).await,
            Err(RetryError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_mark_complete_preserves_attempts() {
        let queue = queue(&[1]);
        queue.enqueue(1, "Network timeout", 2).await.unwrap();
        queue.mark_complete(1).await.unwrap();

        let state = queue.state(1).await.unwrap().unwrap();
        assert_eq!(state.status, ResolutionStatus::Success);
        assert_eq!(state.attempt_count, 2);
        assert_eq!(state.next_retry_at, None);
    }

    #[tokio::test]
    async fn test_long_error_truncated() {
        let queue = queue(&[1]);
        let long = "é".repeat(MAX_ERROR_LEN + 50);
        queue.enqueue(1, &long, 0).await.unwrap();
        let state = queue.state(1).await.unwrap().unwrap();
        assert_eq!(
            state.last_error.unwrap().chars().count(),
            MAX_ERROR_LEN
        );
    }

    #[tokio::test]
    async fn test_permanent_status_past_truncation_still_fails() {
        let queue = queue(&[1]);
        let long = format!("upstream said {} then HTTP 404", "x".repeat(MAX_ERROR_LEN));
        let decision = queue.enqueue(1, &long, 0).await.unwrap();

        assert!(!decision.scheduled);
        let state = queue.state(1).await.unwrap().unwrap();
        assert_eq!(state.status, ResolutionStatus::Failed);
        let stored = state.last_error.unwrap();
        assert_eq!(stored.chars().count(), MAX_ERROR_LEN);
        assert!(!stored.contains("404"));
    }

    #[test]
    fn test_add_delay_saturates() {
        let now = Utc::now();
        assert_eq!(
            add_delay(now, Duration::MAX),
            DateTime::<Utc>::MAX_UTC.trunc_subsecs(3)
        );
    }
}
