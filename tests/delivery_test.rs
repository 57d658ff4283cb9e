//! Acknowledged delivery tests
//!
//! Submit updates through the coordinator and transport into a running
//! service, with and without failures on the way.

use query_metrics::delivery::{
    ChannelTransport, ConfirmationSender, DeliveryCoordinator, Envelope, SendFuture, Transport,
};
use query_metrics::{
    DeliveryError, InMemoryColumnStore, QueryMetric, QueryMetricService, QueryMetricUpdate,
    ServiceConfig, ShardedMetricCache,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Pipeline {
    service: Arc<QueryMetricService>,
    store: InMemoryColumnStore,
    coordinator: DeliveryCoordinator,
}

fn pipeline_with(config: ServiceConfig, wrap: impl FnOnce(ChannelTransport) -> Arc<dyn Transport>) -> Pipeline {
    let store = InMemoryColumnStore::new();
    let cache = ShardedMetricCache::from_config(&config.cache);
    let service = Arc::new(QueryMetricService::new(
        config.clone(),
        Arc::new(cache),
        Arc::new(store.clone()),
    ));

    let (transport, envelopes) = ChannelTransport::new(64);
    let (confirm, confirmations) = ConfirmationSender::channel();
    service.spawn_consumer(envelopes, confirm);

    let coordinator = DeliveryCoordinator::new(wrap(transport), config.delivery.clone());
    coordinator.spawn_ack_listener(confirmations);

    Pipeline {
        service,
        store,
        coordinator,
    }
}

fn pipeline(config: ServiceConfig) -> Pipeline {
    pipeline_with(config, |t| Arc::new(t))
}

fn update(query_id: &str, sources: u64) -> QueryMetricUpdate {
    QueryMetricUpdate::distributed(
        QueryMetric::builder(query_id)
            .source_count(sources)
            .num_updates(1)
            .build(),
    )
}

#[tokio::test]
async fn test_concurrent_submissions_all_counted() {
    let p = pipeline(ServiceConfig::test());

    let updates: Vec<QueryMetricUpdate> = (0..30)
        .map(|i| update(&format!("q{}", i % 3), 10))
        .collect();
    let results = p.coordinator.submit_all(&updates).await;
    assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);

    for id in ["q0", "q1", "q2"] {
        let metric = p.service.get_metric(id).await.unwrap().unwrap();
        assert_eq!(metric.source_count, 100);
        assert_eq!(metric.num_updates, 10);
    }
    assert_eq!(p.coordinator.registry().pending(), 0);
}

#[tokio::test]
async fn test_store_outage_retried_until_applied_once() {
    let mut config = ServiceConfig::test();
    config.delivery.ack_timeout = Duration::from_millis(50);
    config.delivery.max_attempts = 50;
    config.delivery.backoff = Duration::from_millis(10);
    let p = pipeline(config);

    p.store.set_available(false);
    let store = p.store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.set_available(true);
    });

    p.coordinator.submit(&update("q1", 42)).await.unwrap();

    let metric = p.service.get_metric("q1").await.unwrap().unwrap();
    assert_eq!(metric.source_count, 42);
    assert!(p.store.stats().rejected_batches > 0);
}

#[tokio::test]
async fn test_fail_timeout_bounds_retries() {
    let mut config = ServiceConfig::test();
    config.delivery.ack_timeout = Duration::from_millis(100);
    config.delivery.fail_timeout = Duration::from_millis(300);
    config.delivery.max_attempts = 1_000;
    config.delivery.backoff = Duration::from_millis(20);
    let p = pipeline(config);
    // Nothing is ever confirmed
    p.store.set_available(false);

    let start = Instant::now();
    let err = p.coordinator.submit(&update("q1", 1)).await.unwrap_err();
    let elapsed = start.elapsed();

    match err {
        DeliveryError::RetriesExhausted { attempts, .. } => {
            assert!(attempts >= 2 && attempts < 1_000, "attempts = {}", attempts)
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
}

/// Refuses the first `failures` sends
struct FlakyTransport {
    inner: ChannelTransport,
    failures: u32,
    sends: AtomicU32,
}

impl Transport for FlakyTransport {
    fn send(&self, envelope: Envelope) -> SendFuture<'_> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Box::pin(async { Err(DeliveryError::SendFailed("broker unavailable".to_string())) });
        }
        self.inner.send(envelope)
    }
}

#[tokio::test]
async fn test_send_failures_retried() {
    let p = pipeline_with(ServiceConfig::test(), |inner| {
        Arc::new(FlakyTransport {
            inner,
            failures: 2,
            sends: AtomicU32::new(0),
        })
    });

    p.coordinator.submit(&update("q1", 5)).await.unwrap();
    let metric = p.service.get_metric("q1").await.unwrap().unwrap();
    assert_eq!(metric.source_count, 5);
}

#[tokio::test]
async fn test_send_failures_exhaust_attempts() {
    let p = pipeline_with(ServiceConfig::test(), |inner| {
        Arc::new(FlakyTransport {
            inner,
            failures: u32::MAX,
            sends: AtomicU32::new(0),
        })
    });

    let err = p.coordinator.submit(&update("q1", 5)).await.unwrap_err();
    // ServiceConfig::test() allows 3 attempts
    assert!(matches!(err, DeliveryError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(p.service.get_metric("q1").await.unwrap(), None);
}
