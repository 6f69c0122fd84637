use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{Article, ArticleDbRow, DatabaseError, RetryRow, RetryableItem, StatusCounts};
use crate::retry::{ArticleStore, Transition};

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: usize = 2000;

const ARTICLE_COLUMNS: &str = "id, feed_id, guid, title, link, resolved_url, published, \
     resolution_status, attempt_count, next_retry_at, last_error, fetched_at";

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit.min(MAX_ARTICLES)).unwrap_or(0)
}

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Get a single article by its ID.
    pub async fn get_article(&self, article_id: i64) -> Result<Option<Article>, DatabaseError> {
        let row = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?"
        ))
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ArticleDbRow::into_article).transpose()
    }

    /// Articles of one feed, newest first, capped at 2000.
    pub async fn get_articles_for_feed(&self, feed_id: i64) -> Result<Vec<Article>, DatabaseError> {
        let rows = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE feed_id = ? \
             ORDER BY published DESC, fetched_at DESC, id LIMIT ?"
        ))
        .bind(feed_id)
        .bind(clamp_limit(MAX_ARTICLES))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ArticleDbRow::into_article).collect()
    }

    /// Number of articles in each resolution status.
    pub async fn status_counts(&self) -> Result<StatusCounts, DatabaseError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT resolution_status, COUNT(*) FROM articles GROUP BY resolution_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "success" => counts.success = count,
                "retrying" => counts.retrying = count,
                "failed" => counts.failed = count,
                other => return Err(DatabaseError::InvalidStatus(other.to_owned())),
            }
        }
        Ok(counts)
    }

    async fn fetch_retry_rows(
        &self,
        sql: &str,
        now: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RetryableItem>, DatabaseError> {
        let mut query = sqlx::query_as::<_, RetryRow>(sql);
        if let Some(now) = now {
            query = query.bind(now.timestamp_millis());
        }
        let rows = query
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RetryRow::into_item).collect()
    }
}

// ============================================================================
// Retry State
// ============================================================================

/// Each transition is a single UPDATE so status, attempt count and retry
/// time always change together. `attempt_count` only ever grows.
#[async_trait]
impl ArticleStore for Database {
    async fn retry_state(&self, id: i64) -> Result<Option<RetryableItem>, DatabaseError> {
        let row = sqlx::query_as::<_, RetryRow>(
            "SELECT id, link, resolution_status, attempt_count, next_retry_at, last_error \
             FROM articles WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RetryRow::into_item).transpose()
    }

    async fn apply_transition(
        &self,
        id: i64,
        transition: &Transition,
    ) -> Result<bool, DatabaseError> {
        let result = match transition {
            Transition::Scheduled {
                attempt_count,
                next_retry_at,
                error,
            } => {
                sqlx::query(
                    "UPDATE articles SET resolution_status = 'retrying', \
                     attempt_count = MAX(attempt_count, ?), next_retry_at = ?, last_error = ? \
                     WHERE id = ?",
                )
                .bind(i64::from(*attempt_count))
                .bind(next_retry_at.timestamp_millis())
                .bind(error)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            Transition::Failed {
                attempt_count,
                error,
            } => {
                sqlx::query(
                    "UPDATE articles SET resolution_status = 'failed', \
                     attempt_count = MAX(attempt_count, ?), next_retry_at = NULL, last_error = ? \
                     WHERE id = ?",
                )
                .bind(i64::from(*attempt_count))
                .bind(error)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            Transition::Completed { resolved_url } => sqlx::query(
                "UPDATE articles SET resolution_status = 'success', next_retry_at = NULL, \
                 resolved_url = COALESCE(?, resolved_url) WHERE id = ?",
            )
            .bind(resolved_url.as_deref())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| match resolved_url {
                Some(url) if DatabaseError::is_unique_violation(&e) => {
                    DatabaseError::DuplicateUrl(url.clone())
                }
                _ => DatabaseError::from_sqlx(e),
            })?,
        };

        Ok(result.rows_affected() > 0)
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryableItem>, DatabaseError> {
        self.fetch_retry_rows(
            "SELECT id, link, resolution_status, attempt_count, next_retry_at, last_error \
             FROM articles WHERE resolution_status = 'retrying' AND next_retry_at <= ? \
             ORDER BY next_retry_at, id LIMIT ?",
            Some(now),
            limit,
        )
        .await
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<RetryableItem>, DatabaseError> {
        self.fetch_retry_rows(
            "SELECT id, link, resolution_status, attempt_count, next_retry_at, last_error \
             FROM articles WHERE resolution_status = 'pending' ORDER BY id LIMIT ?",
            None,
            limit,
        )
        .await
    }
}
