use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

use crate::resolver::LinkResolver;
use crate::retry::{ArticleStore, RetryError, RetryQueue};
use crate::storage::{DatabaseError, RetryableItem};

/// Articles resolved at once by default
const DEFAULT_CONCURRENCY: usize = 4;

/// Counts from one processing batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessSummary {
    pub resolved: usize,
    pub scheduled: usize,
    pub failed: usize,
    /// Items whose outcome could not be recorded
    pub errors: usize,
}

impl ProcessSummary {
    fn record(&mut self, outcome: Result<Outcome, RetryError>) {
        match outcome {
            Ok(Outcome::Resolved) => self.resolved += 1,
            Ok(Outcome::Scheduled) => self.scheduled += 1,
            Ok(Outcome::Failed) => self.failed += 1,
            Err(_) => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Resolved,
    Scheduled,
    Failed,
}

/// Resolves stored aggregator links and feeds the result to the retry queue.
///
/// Items in one batch run concurrently but share the resolver's rate
/// limiter, so outbound requests stay spaced.
pub struct LinkProcessor<S> {
    resolver: Arc<LinkResolver>,
    queue: Arc<RetryQueue<S>>,
    concurrency: usize,
}

impl<S: ArticleStore> LinkProcessor<S> {
    pub fn new(resolver: Arc<LinkResolver>, queue: Arc<RetryQueue<S>>) -> Self {
        Self {
            resolver,
            queue,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Items resolved at once; values below 1 are treated as 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn queue(&self) -> &RetryQueue<S> {
        &self.queue
    }

    /// Resolve up to `limit` articles that have never been attempted.
    pub async fn process_pending(&self, limit: usize) -> Result<ProcessSummary, RetryError> {
        let items = self.queue.find_pending(limit).await?;
        tracing::debug!(count = items.len(), "Processing pending articles");
        Ok(self.process(items, |_| 0).await)
    }

    /// Re-run up to `limit` retries due at `now`, each one attempt further
    /// along than its stored count.
    pub async fn process_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ProcessSummary, RetryError> {
        let items = self.queue.find_due(now, limit).await?;
        tracing::debug!(count = items.len(), "Processing due retries");
        Ok(self
            .process(items, |item| item.attempt_count.saturating_add(1))
            .await)
    }

    async fn process(
        &self,
        items: Vec<RetryableItem>,
        attempt_for: impl Fn(&RetryableItem) -> u32,
    ) -> ProcessSummary {
        let outcomes: Vec<_> = stream::iter(items)
            .map(|item| {
                let attempt = attempt_for(&item);
                async move { self.process_one(&item, attempt).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = ProcessSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }
        tracing::info!(
            resolved = summary.resolved,
            scheduled = summary.scheduled,
            failed = summary.failed,
            errors = summary.errors,
            "Batch processed"
        );
        summary
    }

    async fn process_one(&self, item: &RetryableItem, attempt: u32) -> Result<Outcome, RetryError> {
        let error = match self.resolver.resolve(&item.link).await {
            Ok(url) => match self.queue.mark_resolved(item.id, &url).await {
                Ok(()) => {
                    tracing::debug!(item_id = item.id, url = %url, "Resolved article link");
                    return Ok(Outcome::Resolved);
                }
                Err(RetryError::Storage(dup @ DatabaseError::DuplicateUrl(_))) => dup.to_string(),
                Err(e) => {
                    tracing::warn!(item_id = item.id, error = %e, "Failed to record resolution");
                    return Err(e);
                }
            },
            Err(e) => e.to_string(),
        };

        match self.queue.enqueue(item.id, &error, attempt).await {
            Ok(decision) if decision.scheduled => Ok(Outcome::Scheduled),
            Ok(_) => Ok(Outcome::Failed),
            Err(e) => {
                tracing::warn!(item_id = item.id, error = %e, "Failed to record failure");
                Err(e)
            }
        }
    }
}
