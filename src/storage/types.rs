use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has the database locked
    #[error("Another feedgate process appears to hold the database lock. Please wait and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The resolved URL already belongs to another article
    #[error("Duplicate article: resolved URL {0} is already stored")]
    DuplicateUrl(String),

    /// A row holds a value this version cannot interpret
    #[error("Database holds an unrecognized resolution status: {0}")]
    InvalidStatus(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }

    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
    }
}

// ============================================================================
// Resolution Status
// ============================================================================

/// Where an article's link is in the resolution lifecycle.
///
/// Stored as lowercase text in `articles.resolution_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    /// Not attempted yet
    Pending,
    /// Resolved to a publisher URL
    Success,
    /// Failed, retry scheduled
    Retrying,
    /// Failed for good
    Failed,
}

impl ResolutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStatus::Pending => "pending",
            ResolutionStatus::Success => "success",
            ResolutionStatus::Retrying => "retrying",
            ResolutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ResolutionStatus::Pending),
            "success" => Ok(ResolutionStatus::Success),
            "retrying" => Ok(ResolutionStatus::Retrying),
            "failed" => Ok(ResolutionStatus::Failed),
            other => Err(DatabaseError::InvalidStatus(other.to_owned())),
        }
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Represents a parsed entry from a feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArticle {
    pub guid: String,
    pub title: String,
    /// Aggregator link to resolve
    pub link: String,
    pub published: Option<i64>,
}

/// Internal row type for retry-state queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RetryRow {
    pub id: i64,
    pub link: String,
    pub resolution_status: String,
    pub attempt_count: i64,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
}

impl RetryRow {
    pub(crate) fn into_item(self) -> Result<RetryableItem, DatabaseError> {
        Ok(RetryableItem {
            id: self.id,
            link: self.link,
            status: self.resolution_status.parse()?,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
            next_retry_at: self.next_retry_at.and_then(DateTime::from_timestamp_millis),
            last_error: self.last_error,
        })
    }
}

/// Internal row type for full article reads
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub resolved_url: Option<String>,
    pub published: Option<i64>,
    pub resolution_status: String,
    pub attempt_count: i64,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub fetched_at: i64,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Result<Article, DatabaseError> {
        Ok(Article {
            id: self.id,
            feed_id: self.feed_id,
            guid: self.guid,
            title: self.title,
            link: self.link,
            resolved_url: self.resolved_url,
            published: self.published,
            status: self.resolution_status.parse()?,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
            next_retry_at: self.next_retry_at.and_then(DateTime::from_timestamp_millis),
            last_error: self.last_error,
            fetched_at: self.fetched_at,
        })
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Feed {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub last_fetched: Option<i64>,
    pub error: Option<String>,
}

/// Article data from database
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub resolved_url: Option<String>,
    pub published: Option<i64>,
    pub status: ResolutionStatus,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub fetched_at: i64,
}

/// Retry-relevant view of an article.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RetryableItem {
    pub id: i64,
    /// Aggregator link
    pub link: String,
    pub status: ResolutionStatus,
    pub attempt_count: u32,
    /// `None` when no retry is scheduled
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RetryableItem {
    /// True if a retry is scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ResolutionStatus::Retrying
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Article counts per [`ResolutionStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub success: i64,
    pub retrying: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.success + self.retrying + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_roundtrip() {
        for status in [
            ResolutionStatus::Pending,
            ResolutionStatus::Success,
            ResolutionStatus::Retrying,
            ResolutionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ResolutionStatus>().unwrap(), status);
        }
        assert!(matches!(
            "done".parse::<ResolutionStatus>(),
            Err(DatabaseError::InvalidStatus(s)) if s == "done"
        ));
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut item = RetryableItem {
            id: 1,
            link: "https://news.example/r/1".into(),
            status: ResolutionStatus::Retrying,
            attempt_count: 0,
            next_retry_at: Some(now),
            last_error: None,
        };
        assert!(item.is_due(now));
        assert!(!item.is_due(now - chrono::Duration::seconds(1)));

        item.status = ResolutionStatus::Failed;
        assert!(!item.is_due(now));

        item.status = ResolutionStatus::Retrying;
        item.next_retry_at = None;
        assert!(!item.is_due(now));
    }

    #[test]
    fn test_duplicate_message_classifies_permanent() {
        let err = DatabaseError::DuplicateUrl("https://publisher.example/a".into());
        assert_eq!(
            crate::retry::classify(&err.to_string()),
            crate::retry::FailureClass::Permanent
        );
    }
}
