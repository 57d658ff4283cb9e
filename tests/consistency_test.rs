//! Aggregate consistency tests
//!
//! Drive the service end to end (cache + column store) and check the merged
//! state a reader would see:
//!
//! - additive counters under DISTRIBUTED updates, replacement under COMPLETE
//! - lifecycle never moves backwards
//! - pages deduplicated by number, in number order
//! - same-numbered pages from different workers are appended
//! - one live value per stored field
//! - selectors extracted once per query
//! - delivery order does not change the result

use query_metrics::combine::SelectorExtractor;
use query_metrics::metric::{MetricField, Selectors};
use query_metrics::{
    ColumnStore, InMemoryColumnStore, Lifecycle, PageMetric, QueryMetric, QueryMetricService,
    QueryMetricUpdate, ServiceConfig, ShardedMetricCache, StoredRecord,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn service_with_store() -> (QueryMetricService, InMemoryColumnStore) {
    let config = ServiceConfig::test();
    let store = InMemoryColumnStore::new();
    let cache = ShardedMetricCache::from_config(&config.cache);
    let service = QueryMetricService::new(config, Arc::new(cache), Arc::new(store.clone()));
    (service, store)
}

async fn stored(store: &InMemoryColumnStore, query_id: &str) -> StoredRecord {
    store.read(query_id).await.unwrap().expect("record stored")
}

fn page(number: u64) -> PageMetric {
    PageMetric::new("web-1", number, 10, 100 + number as i64)
}

#[tokio::test]
async fn test_distributed_counters_sum_then_complete_replaces() {
    let (service, store) = service_with_store();

    for _ in 0..2 {
        let update = QueryMetricUpdate::distributed(
            QueryMetric::builder("q1").last_updated(1_000).source_count(100).build(),
        );
        service.apply(update).await.unwrap();
    }
    let metric = service.get_metric("q1").await.unwrap().unwrap();
    assert_eq!(metric.source_count, 200);

    // Older snapshot is ignored
    let stale = QueryMetricUpdate::complete(
        QueryMetric::builder("q1").last_updated(500).source_count(7).build(),
    );
    service.apply(stale).await.unwrap();
    assert_eq!(service.get_metric("q1").await.unwrap().unwrap().source_count, 200);

    let snapshot = QueryMetricUpdate::complete(
        QueryMetric::builder("q1").last_updated(2_000).source_count(1_000).build(),
    );
    service.apply(snapshot).await.unwrap();
    assert_eq!(service.get_metric("q1").await.unwrap().unwrap().source_count, 1_000);

    let record = stored(&store, "q1").await;
    assert_eq!(record.value(MetricField::SourceCount), Some("1000"));
    assert!(!record.has_duplicates());
}

#[tokio::test]
async fn test_lifecycle_never_regresses() {
    let (service, store) = service_with_store();

    let closed = QueryMetric::builder("q1").lifecycle(Lifecycle::Closed).build();
    service.apply(QueryMetricUpdate::distributed(closed)).await.unwrap();
    let late = QueryMetric::builder("q1").lifecycle(Lifecycle::Initialized).build();
    service.apply(QueryMetricUpdate::distributed(late)).await.unwrap();

    let metric = service.get_metric("q1").await.unwrap().unwrap();
    assert_eq!(metric.lifecycle, Lifecycle::Closed);
    assert_eq!(
        stored(&store, "q1").await.value(MetricField::Lifecycle),
        Some("CLOSED")
    );
}

#[tokio::test]
async fn test_pages_deduplicated_and_ordered() {
    let (service, store) = service_with_store();

    let first = QueryMetric::builder("q1").page(page(3)).page(page(1)).build();
    service.apply(QueryMetricUpdate::distributed(first)).await.unwrap();
    let second = QueryMetric::builder("q1").page(page(1)).page(page(2)).build();
    service.apply(QueryMetricUpdate::distributed(second)).await.unwrap();

    let metric = service.get_metric("q1").await.unwrap().unwrap();
    let numbers: Vec<u64> = metric.page_times.iter().map(|p| p.page_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(metric.num_pages(), 3);

    let persisted = stored(&store, "q1").await.to_metric();
    assert_eq!(persisted.page_times, metric.page_times);
}

#[tokio::test]
async fn test_distributed_pages_from_two_workers_append() {
    let (service, store) = service_with_store();

    for worker in ["worker-a", "worker-b"] {
        let metric = QueryMetric::builder("q1")
            .counters(100)
            .page(PageMetric::new(worker, 1, 10, 100))
            .build();
        service.apply(QueryMetricUpdate::distributed(metric)).await.unwrap();
    }

    let metric = service.get_metric("q1").await.unwrap().unwrap();
    assert_eq!(metric.source_count, 200);
    assert_eq!(metric.last_page_number(), Some(2));
    let hosts: Vec<(u64, &str)> = metric
        .page_times
        .iter()
        .map(|p| (p.page_number, p.host.as_str()))
        .collect();
    assert_eq!(hosts, vec![(1, "worker-a"), (2, "worker-b")]);

    // Redelivery of the second worker's update leaves the pages alone
    let replay = QueryMetric::builder("q1")
        .page(PageMetric::new("worker-b", 1, 10, 100))
        .build();
    service.apply(QueryMetricUpdate::distributed(replay)).await.unwrap();
    let metric = service.get_metric("q1").await.unwrap().unwrap();
    assert_eq!(metric.num_pages(), 2);

    let persisted = stored(&store, "q1").await.to_metric();
    assert_eq!(persisted.page_times, metric.page_times);
}

#[tokio::test]
async fn test_no_duplicate_stored_values() {
    let (service, store) = service_with_store();

    for i in 0..5u64 {
        let metric = QueryMetric::builder("q1")
            .last_updated(1_700_000_000_000 + i as i64 * 1_000)
            .counters(i + 1)
            .num_updates(1)
            .user("alice")
            .num_results(i * 10)
            .build();
        service.apply(QueryMetricUpdate::distributed(metric)).await.unwrap();
    }

    let record = stored(&store, "q1").await;
    assert!(record.duplicate_fields().is_empty(), "{:?}", record.duplicate_fields());
    assert_eq!(record.value(MetricField::SourceCount), Some("15"));
    assert_eq!(record.value(MetricField::NumUpdates), Some("5"));
    assert_eq!(record.value(MetricField::NumResults), Some("40"));
    assert_eq!(record.value(MetricField::User), Some("alice"));
}

struct CountingExtractor(AtomicUsize);

impl SelectorExtractor for CountingExtractor {
    fn extract(&self, _query: &str) -> Selectors {
        self.0.fetch_add(1, Ordering::SeqCst);
        Selectors {
            positive: vec!["FOO:bar".to_string()],
            negative: vec![],
        }
    }
}

#[tokio::test]
async fn test_selectors_extracted_once() {
    let config = ServiceConfig::test();
    let extractor = Arc::new(CountingExtractor(AtomicUsize::new(0)));
    let service = QueryMetricService::with_extractor(
        config.clone(),
        Arc::new(ShardedMetricCache::from_config(&config.cache)),
        Arc::new(InMemoryColumnStore::new()),
        extractor.clone(),
    );

    for _ in 0..3 {
        let metric = QueryMetric::builder("q1")
            .query_type("RunningQuery")
            .query("FOO == 'bar'")
            .build();
        service.apply(QueryMetricUpdate::distributed(metric)).await.unwrap();
    }

    assert_eq!(extractor.0.load(Ordering::SeqCst), 1);
    let metric = service.get_metric("q1").await.unwrap().unwrap();
    assert_eq!(metric.positive_selectors().to_vec(), vec!["FOO:bar".to_string()]);
}

#[tokio::test]
async fn test_delivery_order_does_not_matter() {
    let updates: Vec<QueryMetricUpdate> = (1..=4u64)
        .map(|i| {
            QueryMetricUpdate::distributed(
                QueryMetric::builder("q1")
                    .lifecycle(Lifecycle::ALL[i as usize])
                    .last_updated(i as i64 * 1_000)
                    .counters(i * 10)
                    .num_updates(1)
                    .page(page(i))
                    .build(),
            )
        })
        .collect();

    let orders: [[usize; 4]; 3] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]];
    let mut results = Vec::new();
    for order in orders {
        let (service, _store) = service_with_store();
        for i in order {
            service.apply(updates[i].clone()).await.unwrap();
        }
        results.push(service.get_metric("q1").await.unwrap().unwrap());
    }

    for metric in &results {
        assert_eq!(metric, &results[0]);
    }
    assert_eq!(results[0].source_count, 100);
    assert_eq!(results[0].num_updates, 4);
    assert_eq!(results[0].lifecycle, Lifecycle::ALL[4]);
    assert_eq!(results[0].last_updated, Some(4_000));
}
