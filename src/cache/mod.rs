//! Distributed cache boundary.
//!
//! The cache holds, per query id, the latest merged update and the snapshot
//! last written to the column store. `execute_on_key` is the per-key
//! exclusive execution primitive the update processor relies on: the task
//! sees the current entry and decides what replaces it, and no other task
//! for the same key runs until it finishes.

mod sharded;

pub use sharded::ShardedMetricCache;

use crate::error::{CacheError, MetricError};
use crate::metric::{QueryMetric, QueryMetricUpdate};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Future returned by a per-key task
pub type KeyFuture = Pin<Box<dyn Future<Output = Result<KeyOutcome, MetricError>> + Send>>;

/// Work run with exclusive access to one cache entry
pub type KeyTask = Box<dyn FnOnce(Option<CachedMetric>) -> KeyFuture + Send>;

/// Box an async closure as a `KeyTask`
pub fn key_task<F, Fut>(f: F) -> KeyTask
where
    F: FnOnce(Option<CachedMetric>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<KeyOutcome, MetricError>> + Send + 'static,
{
    Box::new(move |current| -> KeyFuture { Box::pin(f(current)) })
}

/// Cached state of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMetric {
    /// Most recent merged update
    pub latest: QueryMetricUpdate,
    /// Snapshot last written to the column store
    pub persisted: Option<QueryMetric>,
}

/// What a per-key task does with the entry
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    Put(CachedMetric),
    Keep,
}

/// Best-effort local statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub executions: u64,
}

impl CacheStats {
    pub fn merge(self, other: CacheStats) -> CacheStats {
        CacheStats {
            entries: self.entries + other.entries,
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            puts: self.puts + other.puts,
            executions: self.executions + other.executions,
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Cache abstraction
pub trait MetricCache: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<CachedMetric>>;

    fn put<'a>(&'a self, key: &'a str, entry: CachedMetric) -> CacheFuture<'a, ()>;

    fn remove<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<CachedMetric>>;

    /// Run `task` with exclusive access to `key`'s entry.
    ///
    /// Returns the entry as left by the task. Task errors leave the entry
    /// untouched and are returned as-is.
    fn execute_on_key<'a>(
        &'a self,
        key: &'a str,
        task: KeyTask,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CachedMetric>, MetricError>> + Send + 'a>>;

    fn stats(&self) -> CacheFuture<'_, CacheStats>;
}
