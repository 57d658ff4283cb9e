//! Per-key update processor.

use super::ShutdownGate;
use crate::cache::{key_task, CachedMetric, KeyOutcome, MetricCache};
use crate::combine::Combiner;
use crate::delta::FieldDelta;
use crate::error::{CacheError, MetricError};
use crate::metric::{QueryMetric, QueryMetricUpdate};
use crate::store::{ColumnStore, StoreBatch};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Applies updates to the shared aggregate, one at a time per query id.
///
/// For each update, under the cache's per-key exclusivity:
/// 1. read the cached entry
/// 2. merge the update into the latest cached aggregate
/// 3. diff the merged aggregate against the last persisted snapshot
/// 4. apply the write/delete batch to the column store
/// 5. replace the cached entry with the merged aggregate
///
/// If the store rejects the batch the cached entry is left as it was, so a
/// redelivered update is merged against the same state again.
#[derive(Clone)]
pub struct UpdateProcessor {
    cache: Arc<dyn MetricCache>,
    store: Arc<dyn ColumnStore>,
    combiner: Combiner,
    gate: ShutdownGate,
    max_field_value_length: usize,
}

impl UpdateProcessor {
    pub fn new(
        cache: Arc<dyn MetricCache>,
        store: Arc<dyn ColumnStore>,
        combiner: Combiner,
        gate: ShutdownGate,
        max_field_value_length: usize,
    ) -> Self {
        UpdateProcessor {
            cache,
            store,
            combiner,
            gate,
            max_field_value_length,
        }
    }

    /// Apply one update; returns the merged aggregate
    pub async fn apply(&self, update: QueryMetricUpdate) -> Result<QueryMetric, MetricError> {
        update.validate()?;
        let query_id = update.query_id().to_string();

        let combiner = self.combiner.clone();
        let store = self.store.clone();
        let max_len = self.max_field_value_length;
        let key = query_id.clone();

        let task = key_task(move |current: Option<CachedMetric>| async move {
            let prior = current.as_ref().map(|c| &c.latest.metric);
            let merged = combiner.merge(&update.metric, prior, update.update_type);

            let persisted = current.as_ref().and_then(|c| c.persisted.as_ref());
            let delta = FieldDelta::compute(&merged, persisted, max_len);
            trace!(
                query_id = %key,
                writes = delta.write_count(),
                deletes = delta.delete_count(),
                "computed field delta"
            );

            let batch = StoreBatch::from_delta(&delta, now_millis());
            store.apply(&key, batch).await?;

            Ok::<_, MetricError>(KeyOutcome::Put(CachedMetric {
                latest: QueryMetricUpdate::new(merged.clone(), update.update_type),
                persisted: Some(merged),
            }))
        });

        match self.cache.execute_on_key(&query_id, task).await {
            Ok(Some(entry)) => Ok(entry.latest.metric),
            Ok(None) => Err(self.report(
                &query_id,
                CacheError::Unavailable("entry missing after apply".to_string()).into(),
            )),
            Err(e) => Err(self.report(&query_id, e)),
        }
    }

    fn report(&self, query_id: &str, e: MetricError) -> MetricError {
        if self.gate.is_shutting_down() {
            debug!(query_id, error = %e, "update failed during shutdown");
        } else {
            error!(query_id, error = %e, "failed to apply query metric update");
        }
        e
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
