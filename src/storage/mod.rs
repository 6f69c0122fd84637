//! SQLite persistence for feeds and articles.
//!
//! [`Database`] implements [`ArticleStore`](crate::retry::ArticleStore), so
//! the retry queue's state transitions land directly on the `articles` table.

mod articles;
mod feeds;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    Article, DatabaseError, Feed, ParsedArticle, ResolutionStatus, RetryableItem, StatusCounts,
};
