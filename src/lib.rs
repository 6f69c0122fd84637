//! Aggregator link resolution with an SSRF boundary and persistent,
//! jittered retries.
//!
//! - [`resolver`] turns aggregator links into publisher URLs
//! - [`util`] holds the SSRF guard every outbound URL passes through
//! - [`retry`] classifies failures and schedules retries
//! - [`storage`] persists feeds, articles and their retry state in SQLite
//! - [`feed`] fetches feeds and drives resolution over stored articles

pub mod config;
pub mod feed;
pub mod resolver;
pub mod retry;
pub mod storage;
pub mod util;
