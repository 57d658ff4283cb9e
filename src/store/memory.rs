//! In-memory column store.

use super::{ColumnStore, StoreBatch, StoreFuture, StoredRecord};
use crate::delta::FieldValues;
use crate::error::StoreError;
use crate::metric::FieldName;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone)]
struct Cell {
    value: String,
    timestamp: i64,
}

type Row = BTreeMap<FieldName, Vec<Cell>>;

/// Counters for store activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub batches: u64,
    pub writes: u64,
    pub deletes: u64,
    /// Deletes that found no matching value
    pub missed_deletes: u64,
    pub rejected_batches: u64,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<String, Row>,
    stats: StoreStats,
}

/// Column store backed by a process-local map
#[derive(Clone)]
pub struct InMemoryColumnStore {
    inner: Arc<RwLock<Inner>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryColumnStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryColumnStore {
    pub fn new() -> Self {
        InMemoryColumnStore {
            inner: Arc::new(RwLock::new(Inner::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.read().stats.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("column store offline".to_string()))
        }
    }

    fn apply_sync(&self, query_id: &str, batch: StoreBatch) -> Result<(), StoreError> {
        if let Err(e) = self.check_available() {
            self.inner.write().stats.rejected_batches += 1;
            return Err(e);
        }

        let mut inner = self.inner.write();
        let Inner { rows, stats } = &mut *inner;
        let row = rows.entry(query_id.to_string()).or_default();
        stats.batches += 1;

        for delete in batch.deletes {
            let cells = row.entry(delete.field.clone()).or_default();
            let before = cells.len();
            cells.retain(|c| c.value != delete.value);
            if cells.len() == before {
                stats.missed_deletes += 1;
            } else {
                stats.deletes += 1;
            }
            if cells.is_empty() {
                row.remove(&delete.field);
            }
        }

        for write in batch.writes {
            let cells = row.entry(write.field).or_default();
            // Same field and value is the same entry; keep the newest timestamp
            match cells.iter_mut().find(|c| c.value == write.value) {
                Some(cell) => cell.timestamp = cell.timestamp.max(write.timestamp),
                None => cells.push(Cell {
                    value: write.value,
                    timestamp: write.timestamp,
                }),
            }
            stats.writes += 1;
        }

        if row.is_empty() {
            rows.remove(query_id);
        }
        trace!(query_id, "applied store batch");
        Ok(())
    }

    fn read_sync(&self, query_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner.rows.get(query_id).map(|row| {
            let fields: FieldValues = row
                .iter()
                .map(|(name, cells)| {
                    let mut cells = cells.clone();
                    cells.sort_by_key(|c| c.timestamp);
                    (name.clone(), cells.into_iter().map(|c| c.value).collect())
                })
                .collect();
            StoredRecord::new(query_id, fields)
        }))
    }
}

impl ColumnStore for InMemoryColumnStore {
    fn apply<'a>(&'a self, query_id: &'a str, batch: StoreBatch) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.apply_sync(query_id, batch) })
    }

    fn read<'a>(&'a self, query_id: &'a str) -> StoreFuture<'a, Option<StoredRecord>> {
        Box::pin(async move { self.read_sync(query_id) })
    }

    fn query_ids(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            self.check_available()?;
            let mut ids: Vec<String> = self.inner.read().rows.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }
}
