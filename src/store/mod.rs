//! Wide-column storage boundary.
//!
//! The store holds versioned `(field, value)` entries per query id. A
//! changed value is a new entry, so callers delete the exact old value to
//! keep a single live value per field.
//!
//! Implementations:
//! - `InMemoryColumnStore`: tests, DST and the standalone binary

mod memory;
mod record;

pub use memory::{InMemoryColumnStore, StoreStats};
pub use record::StoredRecord;

use crate::delta::{FieldDelta, FieldValues};
use crate::error::StoreError;
use crate::metric::FieldName;
use std::future::Future;
use std::pin::Pin;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// One `(field, value, timestamp)` cell mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMutation {
    pub field: FieldName,
    pub value: String,
    pub timestamp: i64,
}

/// Writes and deletes for a single query id, applied together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreBatch {
    pub writes: Vec<StoreMutation>,
    pub deletes: Vec<StoreMutation>,
}

fn mutations(fields: &FieldValues, timestamp: i64) -> Vec<StoreMutation> {
    fields
        .iter()
        .flat_map(|(field, values)| {
            values.iter().map(move |value| StoreMutation {
                field: field.clone(),
                value: value.clone(),
                timestamp,
            })
        })
        .collect()
}

impl StoreBatch {
    pub fn from_delta(delta: &FieldDelta, timestamp: i64) -> Self {
        StoreBatch {
            writes: mutations(&delta.write_set, timestamp),
            deletes: mutations(&delta.delete_set, timestamp),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }
}

/// Column store abstraction
pub trait ColumnStore: Send + Sync + 'static {
    /// Apply a batch for `query_id`.
    ///
    /// Deletes run before writes, so rewriting a deleted value keeps it.
    /// Deleting a value that is not present is a no-op.
    fn apply<'a>(&'a self, query_id: &'a str, batch: StoreBatch) -> StoreFuture<'a, ()>;

    /// Live field values for `query_id`
    fn read<'a>(&'a self, query_id: &'a str) -> StoreFuture<'a, Option<StoredRecord>>;

    /// Every query id with at least one live value
    fn query_ids(&self) -> StoreFuture<'_, Vec<String>>;
}
