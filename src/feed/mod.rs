//! Feed ingestion and link processing.
//!
//! - [`parser`] turns RSS/Atom bytes into article rows using `feed-rs`
//! - [`fetcher`] fetches feeds through the SSRF guard and stores new entries
//!   as `pending`
//! - [`processor`] resolves pending and due articles and drives the retry
//!   queue with the outcome
//!
//! # Example
//!
//! ```ignore
//! let feeds = db.get_feeds().await?;
//! refresh_all(&db, &guard, feeds, &FetchConfig::default()).await;
//!
//! let queue = RetryQueue::new(db, retry_config);
//! let processor = LinkProcessor::new(Arc::new(resolver), Arc::new(queue));
//! let summary = processor.process_pending(100).await?;
//! ```

mod fetcher;
mod parser;
mod processor;

pub use fetcher::{refresh_all, refresh_one, FetchConfig, FetchError, FetchResult};
pub use parser::{parse_feed, ParseResult};
pub use processor::{LinkProcessor, ProcessSummary};
