//! Query metric service: wiring, transport consumer and read paths.

mod processor;
mod reporter;
mod shutdown;
mod summary;

pub use processor::UpdateProcessor;
pub use reporter::{LoggingStatsSink, StatsReporter, StatsSink};
pub use shutdown::{GatePermit, ShutdownGate};
pub use summary::{
    parse_summary_date, resolve_range, summarize, DateBound, QueryMetricsSummary, SummaryBucket,
    DEFAULT_WINDOW_MS,
};

use crate::cache::{CacheStats, MetricCache, ShardedMetricCache};
use crate::combine::{Combiner, SelectorExtractor};
use crate::config::ServiceConfig;
use crate::delivery::{ConfirmationSender, Envelope};
use crate::error::MetricError;
use crate::metric::{QueryMetric, QueryMetricUpdate};
use crate::store::{ColumnStore, InMemoryColumnStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct QueryMetricService {
    processor: UpdateProcessor,
    cache: Arc<dyn MetricCache>,
    store: Arc<dyn ColumnStore>,
    gate: ShutdownGate,
    config: ServiceConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryMetricService {
    pub fn new(
        config: ServiceConfig,
        cache: Arc<dyn MetricCache>,
        store: Arc<dyn ColumnStore>,
    ) -> Self {
        Self::with_combiner(config, cache, store, Combiner::default())
    }

    pub fn with_extractor(
        config: ServiceConfig,
        cache: Arc<dyn MetricCache>,
        store: Arc<dyn ColumnStore>,
        extractor: Arc<dyn SelectorExtractor>,
    ) -> Self {
        Self::with_combiner(config, cache, store, Combiner::new(extractor))
    }

    fn with_combiner(
        config: ServiceConfig,
        cache: Arc<dyn MetricCache>,
        store: Arc<dyn ColumnStore>,
        combiner: Combiner,
    ) -> Self {
        let gate = ShutdownGate::new();
        let processor = UpdateProcessor::new(
            cache.clone(),
            store.clone(),
            combiner,
            gate.clone(),
            config.store.max_field_value_length,
        );
        QueryMetricService {
            processor,
            cache,
            store,
            gate,
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Service over a sharded cache and an in-memory store.
    /// Must be called inside a tokio runtime.
    pub fn in_memory(config: ServiceConfig) -> Self {
        let cache = ShardedMetricCache::from_config(&config.cache);
        Self::new(config, Arc::new(cache), Arc::new(InMemoryColumnStore::new()))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn gate(&self) -> &ShutdownGate {
        &self.gate
    }

    /// Apply one update under a gate permit
    pub async fn apply(&self, update: QueryMetricUpdate) -> Result<QueryMetric, MetricError> {
        let _permit = self.gate.enter()?;
        self.processor.apply(update).await
    }

    /// Process a transport envelope and confirm it on success
    pub async fn handle_event(
        &self,
        envelope: Envelope,
        confirmations: &ConfirmationSender,
    ) -> Result<QueryMetric, MetricError> {
        let Envelope {
            correlation_id,
            update,
        } = envelope;
        let merged = self.apply(update).await?;
        if !confirmations.confirm(correlation_id) {
            debug!(%correlation_id, "no listener for delivery confirmation");
        }
        Ok(merged)
    }

    /// Consume envelopes until the channel closes or the gate closes.
    /// Each envelope is handled on its own task.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        mut envelopes: mpsc::Receiver<Envelope>,
        confirmations: ConfirmationSender,
    ) {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    next = envelopes.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = service.gate.closed() => break,
                };
                let service = service.clone();
                let confirmations = confirmations.clone();
                tokio::spawn(async move {
                    let query_id = envelope.update.query_id().to_string();
                    if let Err(e) = service.handle_event(envelope, &confirmations).await {
                        // Unconfirmed envelopes are retried by the submitter
                        debug!(query_id = %query_id, error = %e, "envelope not confirmed");
                    }
                });
            }
            debug!("update consumer stopped");
        });
        self.tasks.lock().push(handle);
    }

    /// Start periodic statistics reporting if enabled
    pub fn spawn_reporter(&self, sink: Arc<dyn StatsSink>) -> bool {
        if !self.config.reporting.enabled {
            return false;
        }
        let reporter = StatsReporter::new(
            self.cache.clone(),
            sink,
            self.config.reporting.interval,
            self.gate.clone(),
        );
        self.tasks.lock().push(reporter.spawn());
        true
    }

    /// Current aggregate for `query_id`.
    ///
    /// The cached copy is returned unless the store holds a newer one.
    /// Stored dates have second precision, so ties go to the cache.
    pub async fn get_metric(&self, query_id: &str) -> Result<Option<QueryMetric>, MetricError> {
        let cached = self.cache.get(query_id).await?.map(|c| c.latest.metric);
        let stored = self.store.read(query_id).await?.map(|r| r.to_metric());

        Ok(match (cached, stored) {
            (Some(c), Some(s)) if s.last_updated > c.last_updated => Some(s),
            (Some(c), _) => Some(c),
            (None, s) => s,
        })
    }

    /// Summary of the queries created in `[begin, end]`.
    ///
    /// With `only_current_user`, only `user`'s queries are counted.
    pub async fn summary(
        &self,
        begin: Option<i64>,
        end: Option<i64>,
        user: Option<&str>,
        only_current_user: bool,
    ) -> Result<QueryMetricsSummary, MetricError> {
        let (begin, end) = resolve_range(begin, end, chrono::Utc::now().timestamp_millis())?;
        let filter = if only_current_user {
            Some(user.ok_or_else(|| {
                MetricError::Validation("user summary requires a user".to_string())
            })?)
        } else {
            None
        };

        let mut metrics = Vec::new();
        for query_id in self.store.query_ids().await? {
            if let Some(metric) = self.get_metric(&query_id).await? {
                metrics.push(metric);
            }
        }
        Ok(summarize(&metrics, begin, end, filter))
    }

    /// `summary` with `yyyyMMdd[ HHmmss[.SSS]]` date strings
    pub async fn summary_for_dates(
        &self,
        begin: Option<&str>,
        end: Option<&str>,
        user: Option<&str>,
        only_current_user: bool,
    ) -> Result<QueryMetricsSummary, MetricError> {
        let begin = match begin {
            Some(s) => parse_summary_date(s, DateBound::Begin)?,
            None => None,
        };
        let end = match end {
            Some(s) => parse_summary_date(s, DateBound::End)?,
            None => None,
        };
        self.summary(begin, end, user, only_current_user).await
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, MetricError> {
        Ok(self.cache.stats().await?)
    }

    /// Close the gate, waiting for in-flight updates, then stop background tasks
    pub async fn shutdown(&self) {
        info!(in_flight = self.gate.in_flight(), "shutting down query metric service");
        self.gate.close().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{ChannelTransport, DeliveryCoordinator};
    use crate::metric::Lifecycle;

    #[tokio::test]
    async fn test_get_metric_prefers_cache() {
        let service = QueryMetricService::in_memory(ServiceConfig::test());
        assert_eq!(service.get_metric("q1").await.unwrap(), None);

        let update = QueryMetricUpdate::distributed(
            QueryMetric::builder("q1").last_updated(1_709_622_489_123).source_count(3).build(),
        );
        service.apply(update).await.unwrap();

        let metric = service.get_metric("q1").await.unwrap().unwrap();
        // Millisecond precision means it came from the cache
        assert_eq!(metric.last_updated, Some(1_709_622_489_123));
        assert_eq!(metric.source_count, 3);
    }

    #[tokio::test]
    async fn test_apply_rejected_after_shutdown() {
        let service = QueryMetricService::in_memory(ServiceConfig::test());
        service.shutdown().await;
        let err = service
            .apply(QueryMetricUpdate::distributed(QueryMetric::new("q1")))
            .await
            .unwrap_err();
        assert!(matches!(err, MetricError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let service = Arc::new(QueryMetricService::in_memory(ServiceConfig::test()));
        let (transport, envelopes) = ChannelTransport::new(16);
        let (confirm, confirmations) = ConfirmationSender::channel();
        service.spawn_consumer(envelopes, confirm);

        let coordinator = DeliveryCoordinator::new(Arc::new(transport), ServiceConfig::test().delivery);
        coordinator.spawn_ack_listener(confirmations);

        let update = QueryMetricUpdate::distributed(
            QueryMetric::builder("q1").lifecycle(Lifecycle::Closed).source_count(7).build(),
        );
        coordinator.submit(&update).await.unwrap();

        let metric = service.get_metric("q1").await.unwrap().unwrap();
        assert_eq!(metric.lifecycle, Lifecycle::Closed);
        assert_eq!(metric.source_count, 7);
    }

    #[tokio::test]
    async fn test_summary_rejects_inverted_range() {
        let service = QueryMetricService::in_memory(ServiceConfig::test());
        let err = service
            .summary_for_dates(Some("20240310"), Some("20240301"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, MetricError::Validation(_)));
    }

    #[tokio::test]
    async fn test_summary_counts_stored_queries() {
        let service = QueryMetricService::in_memory(ServiceConfig::test());
        let now = chrono::Utc::now().timestamp_millis();
        for (id, user) in [("q1", "alice"), ("q2", "bob")] {
            let metric = QueryMetric::builder(id)
                .create_date(now - 1_000)
                .user(user)
                .num_results(10)
                .build();
            service.apply(QueryMetricUpdate::complete(metric)).await.unwrap();
        }

        let all = service.summary(None, None, None, false).await.unwrap();
        assert_eq!(all.total().unwrap().query_count, 2);
        assert_eq!(all.bucket("1 hour").unwrap().total_results, 20);

        let mine = service.summary(None, None, Some("alice"), true).await.unwrap();
        assert_eq!(mine.total().unwrap().query_count, 1);
    }
}
