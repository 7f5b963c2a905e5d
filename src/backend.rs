//! Collaborator traits consumed by the polling and sink engines
//!
//! Implementations live in [`crate::elastic`] (query backend and rule store)
//! and [`crate::graphite`] (sink connection). Tests plug in-memory fakes in
//! here.
//!
//! ## Thread Safety
//!
//! Backends and stores are shared across many poll loops and must be
//! `Send + Sync`. A [`SinkConnection`] is owned by exactly one supervisor and
//! only needs `Send`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{QueryError, SinkError, StoreError};

/// Time range a count is restricted to (both ends inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// The window of width `width` ending now
    pub fn trailing(width: Duration) -> Self {
        let to = Utc::now();
        let width = chrono::Duration::from_std(width).unwrap_or(chrono::Duration::zero());
        Self {
            from: to - width,
            to,
        }
    }
}

/// Counts documents matching a query
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Number of documents in `index` matching `query` within `window`
    async fn search(
        &self,
        index: &str,
        query: &str,
        window: TimeWindow,
        deadline: Duration,
    ) -> Result<u64, QueryError>;
}

/// Source of dynamically discovered rules
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All saved searches whose title starts with `title_prefix`, as title → query
    async fn fetch_matching(
        &self,
        title_prefix: &str,
        deadline: Duration,
    ) -> Result<BTreeMap<String, String>, StoreError>;
}

/// A single live connection to the metrics sink
#[async_trait]
pub trait SinkConnection: Send {
    /// Write one complete line (terminator included)
    async fn write(&mut self, line: &str) -> Result<(), SinkError>;

    /// Send the liveness probe and wait for its acknowledgement
    async fn probe(&mut self, deadline: Duration) -> Result<(), SinkError>;

    async fn close(&mut self);
}

/// Opens new sink connections
#[async_trait]
pub trait SinkConnectionFactory: Send + Sync {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Box<dyn SinkConnection>, SinkError>;
}
