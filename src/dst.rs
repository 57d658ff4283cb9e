//! Deterministic simulation testing for the update pipeline
//!
//! Shadow-state harness that drives real `UpdateProcessor` instances with:
//! - seeded random workloads (many workers reporting on a few queries)
//! - shuffled delivery order across and within queries
//! - fault injection at the column store (rejected batches, lost acks)
//! - invariant checking against a shadow model after every run
//!
//! ```text
//! for seed in 0..1000 {
//!     let mut harness = PipelineHarness::new(PipelineDstConfig::chaos(seed));
//!     harness.run().await;
//!     harness.check_invariants().await;
//! }
//! ```

use crate::cache::{MetricCache, ShardedMetricCache};
use crate::combine::Combiner;
use crate::error::StoreError;
use crate::metric::{Lifecycle, PageMetric, QueryMetric, QueryMetricUpdate, UpdateType};
use crate::service::{ShutdownGate, UpdateProcessor};
use crate::store::{ColumnStore, InMemoryColumnStore, StoreBatch, StoreFuture, StoredRecord};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Probabilities of store faults
#[derive(Debug, Clone)]
pub struct StoreFaultConfig {
    /// Batch rejected before anything is written
    pub apply_fail_prob: f64,
    /// Batch written, but the caller is told it failed
    pub lost_ack_prob: f64,
    pub read_fail_prob: f64,
}

impl Default for StoreFaultConfig {
    fn default() -> Self {
        StoreFaultConfig {
            apply_fail_prob: 0.05,
            lost_ack_prob: 0.02,
            read_fail_prob: 0.01,
        }
    }
}

impl StoreFaultConfig {
    pub fn no_faults() -> Self {
        StoreFaultConfig {
            apply_fail_prob: 0.0,
            lost_ack_prob: 0.0,
            read_fail_prob: 0.0,
        }
    }

    pub fn high_chaos() -> Self {
        StoreFaultConfig {
            apply_fail_prob: 0.2,
            lost_ack_prob: 0.1,
            read_fail_prob: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreFaultStats {
    pub apply_attempts: u64,
    pub apply_failures: u64,
    pub lost_acks: u64,
    pub read_failures: u64,
}

struct FaultState {
    rng: ChaCha8Rng,
    stats: StoreFaultStats,
}

/// Column store wrapper that injects seeded faults
#[derive(Clone)]
pub struct FaultyColumnStore {
    inner: InMemoryColumnStore,
    config: StoreFaultConfig,
    state: Arc<Mutex<FaultState>>,
}

impl FaultyColumnStore {
    pub fn new(inner: InMemoryColumnStore, seed: u64, config: StoreFaultConfig) -> Self {
        FaultyColumnStore {
            inner,
            config,
            state: Arc::new(Mutex::new(FaultState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: StoreFaultStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> StoreFaultStats {
        self.state.lock().stats.clone()
    }

    fn roll(&self, prob: f64) -> bool {
        prob > 0.0 && self.state.lock().rng.gen_bool(prob.min(1.0))
    }
}

impl ColumnStore for FaultyColumnStore {
    fn apply<'a>(&'a self, query_id: &'a str, batch: StoreBatch) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().stats.apply_attempts += 1;

            if self.roll(self.config.apply_fail_prob) {
                self.state.lock().stats.apply_failures += 1;
                return Err(StoreError::Unavailable("simulated apply failure".to_string()));
            }

            self.inner.apply(query_id, batch).await?;

            if self.roll(self.config.lost_ack_prob) {
                self.state.lock().stats.lost_acks += 1;
                return Err(StoreError::Unavailable("simulated lost ack".to_string()));
            }
            Ok(())
        })
    }

    fn read<'a>(&'a self, query_id: &'a str) -> StoreFuture<'a, Option<StoredRecord>> {
        Box::pin(async move {
            if self.roll(self.config.read_fail_prob) {
                self.state.lock().stats.read_failures += 1;
                return Err(StoreError::Unavailable("simulated read failure".to_string()));
            }
            self.inner.read(query_id).await
        })
    }

    fn query_ids(&self) -> StoreFuture<'_, Vec<String>> {
        self.inner.query_ids()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineDstConfig {
    pub seed: u64,
    pub store_faults: StoreFaultConfig,
    pub num_queries: usize,
    /// DISTRIBUTED updates generated per query
    pub updates_per_query: usize,
    pub max_page_number: u64,
    /// Chance that a query also gets a final COMPLETE snapshot
    pub complete_probability: f64,
    /// Redelivery attempts before an update counts as abandoned
    pub max_redeliveries: usize,
}

impl Default for PipelineDstConfig {
    fn default() -> Self {
        PipelineDstConfig {
            seed: 0,
            store_faults: StoreFaultConfig::default(),
            num_queries: 4,
            updates_per_query: 12,
            max_page_number: 6,
            complete_probability: 0.5,
            max_redeliveries: 200,
        }
    }
}

impl PipelineDstConfig {
    pub fn new(seed: u64) -> Self {
        PipelineDstConfig {
            seed,
            ..Default::default()
        }
    }

    pub fn calm(seed: u64) -> Self {
        PipelineDstConfig {
            seed,
            store_faults: StoreFaultConfig::no_faults(),
            ..Default::default()
        }
    }

    pub fn chaos(seed: u64) -> Self {
        PipelineDstConfig {
            seed,
            store_faults: StoreFaultConfig::high_chaos(),
            updates_per_query: 20,
            ..Default::default()
        }
    }
}

/// Shadow model of what one query should converge to
#[derive(Debug, Clone, Default)]
struct ExpectedQuery {
    counters: [u64; 6],
    num_updates: u64,
    lifecycle: Lifecycle,
    last_updated: Option<i64>,
    pages: BTreeSet<u64>,
}

impl ExpectedQuery {
    fn observe(&mut self, metric: &QueryMetric, update_type: UpdateType) {
        let incoming = counters(metric);
        match update_type {
            UpdateType::Distributed => {
                for (total, n) in self.counters.iter_mut().zip(incoming) {
                    *total += n;
                }
                self.num_updates += metric.num_updates;
            }
            UpdateType::Complete => {
                let stale = matches!(
                    (metric.last_updated, self.last_updated),
                    (Some(inc), Some(prev)) if inc < prev
                );
                if !stale {
                    self.counters = incoming;
                    self.num_updates = metric.num_updates;
                }
            }
        }
        self.lifecycle = self.lifecycle.advance(metric.lifecycle);
        self.last_updated = self.last_updated.max(metric.last_updated);
        self.pages.extend(metric.page_times.iter().map(|p| p.page_number));
    }
}

fn counters(metric: &QueryMetric) -> [u64; 6] {
    [
        metric.source_count,
        metric.next_count,
        metric.seek_count,
        metric.yield_count,
        metric.doc_ranges,
        metric.fi_ranges,
    ]
}

/// Page content is a function of its number, so any delivery order agrees
fn page(number: u64) -> PageMetric {
    PageMetric::new("worker", number, 10, number as i64 * 7)
}

/// Seeded workload: DISTRIBUTED updates in random order, then the COMPLETE
/// snapshots, then stale COMPLETE replays that must have no effect.
pub struct PipelineWorkload {
    rng: ChaCha8Rng,
    config: PipelineDstConfig,
}

impl PipelineWorkload {
    pub fn new(config: PipelineDstConfig) -> Self {
        PipelineWorkload {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        }
    }

    fn query_id(&self, index: usize) -> String {
        format!("dst-{}-{}", self.config.seed, index)
    }

    fn distributed(&mut self, query_id: &str, base_time: i64) -> QueryMetric {
        let rng = &mut self.rng;
        let mut metric = QueryMetric::builder(query_id)
            .lifecycle(Lifecycle::ALL[rng.gen_range(0..Lifecycle::ALL.len())])
            .last_updated(base_time + rng.gen_range(0..60_000))
            .num_updates(1)
            .user("dst-user")
            .build();
        metric.source_count = rng.gen_range(0..100);
        metric.next_count = rng.gen_range(0..1_000);
        metric.seek_count = rng.gen_range(0..50);
        metric.yield_count = rng.gen_range(0..5);
        metric.doc_ranges = rng.gen_range(0..20);
        metric.fi_ranges = rng.gen_range(0..20);
        if rng.gen_bool(0.5) {
            metric.page_times.push(page(rng.gen_range(1..=self.config.max_page_number)));
        }
        metric
    }

    /// Generate the delivery sequence for this seed
    pub fn generate(&mut self) -> Vec<QueryMetricUpdate> {
        let base_time = 1_700_000_000_000 + self.config.seed as i64 * 1_000;
        let mut distributed = Vec::new();
        let mut complete = Vec::new();
        let mut stale = Vec::new();

        for index in 0..self.config.num_queries {
            let query_id = self.query_id(index);
            for _ in 0..self.config.updates_per_query {
                let metric = self.distributed(&query_id, base_time);
                distributed.push(QueryMetricUpdate::distributed(metric));
            }

            if self.rng.gen_bool(self.config.complete_probability) {
                let n = self.rng.gen_range(0..10_000);
                let snapshot = QueryMetric::builder(&query_id)
                    .lifecycle(Lifecycle::Closed)
                    .last_updated(base_time + 120_000)
                    .counters(n)
                    .num_updates(self.config.updates_per_query as u64 + 1)
                    .page(page(1))
                    .build();
                complete.push(QueryMetricUpdate::complete(snapshot));

                let replay = QueryMetric::builder(&query_id)
                    .last_updated(base_time - 1)
                    .counters(n + 1)
                    .num_updates(1)
                    .build();
                stale.push(QueryMetricUpdate::complete(replay));
            }
        }

        distributed.shuffle(&mut self.rng);
        complete.shuffle(&mut self.rng);
        distributed.extend(complete);
        distributed.extend(stale);
        distributed
    }
}

#[derive(Debug, Clone)]
pub struct PipelineDstResult {
    pub seed: u64,
    pub updates: u64,
    pub deliveries: u64,
    pub redeliveries: u64,
    pub abandoned: u64,
    pub store_stats: StoreFaultStats,
    pub invariant_violations: Vec<String>,
}

impl PipelineDstResult {
    fn new(seed: u64) -> Self {
        PipelineDstResult {
            seed,
            updates: 0,
            deliveries: 0,
            redeliveries: 0,
            abandoned: 0,
            store_stats: StoreFaultStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} updates, {} deliveries ({} redelivered, {} abandoned), {} store faults, {} violations",
            self.seed,
            self.updates,
            self.deliveries,
            self.redeliveries,
            self.abandoned,
            self.store_stats.apply_failures + self.store_stats.lost_acks,
            self.invariant_violations.len()
        )
    }
}

/// Drives one workload through a real processor over a faulty store
pub struct PipelineHarness {
    config: PipelineDstConfig,
    backing: InMemoryColumnStore,
    store: FaultyColumnStore,
    cache: Arc<ShardedMetricCache>,
    processor: UpdateProcessor,
    expected: BTreeMap<String, ExpectedQuery>,
    result: PipelineDstResult,
}

impl PipelineHarness {
    /// Must be called inside a tokio runtime
    pub fn new(config: PipelineDstConfig) -> Self {
        let backing = InMemoryColumnStore::new();
        // Different stream from the workload
        let store = FaultyColumnStore::new(
            backing.clone(),
            config.seed.wrapping_add(1),
            config.store_faults.clone(),
        );
        let cache = Arc::new(ShardedMetricCache::new(4, Duration::from_secs(5)));
        let processor = UpdateProcessor::new(
            cache.clone(),
            Arc::new(store.clone()),
            Combiner::default(),
            ShutdownGate::new(),
            500_000,
        );
        let result = PipelineDstResult::new(config.seed);

        PipelineHarness {
            config,
            backing,
            store,
            cache,
            processor,
            expected: BTreeMap::new(),
            result,
        }
    }

    /// Deliver the whole workload, redelivering each update until it applies
    pub async fn run(&mut self) {
        let updates = PipelineWorkload::new(self.config.clone()).generate();

        for update in updates {
            self.result.updates += 1;
            let mut delivered = false;
            for attempt in 0..self.config.max_redeliveries {
                self.result.deliveries += 1;
                if attempt > 0 {
                    self.result.redeliveries += 1;
                }
                if self.processor.apply(update.clone()).await.is_ok() {
                    delivered = true;
                    break;
                }
            }

            if delivered {
                self.expected
                    .entry(update.query_id().to_string())
                    .or_default()
                    .observe(&update.metric, update.update_type);
            } else {
                self.result.abandoned += 1;
                self.result.invariant_violations.push(format!(
                    "update for {} abandoned after {} deliveries",
                    update.query_id(),
                    self.config.max_redeliveries
                ));
            }
        }
        self.result.store_stats = self.store.stats();
    }

    /// Compare cache and store contents against the shadow model
    pub async fn check_invariants(&mut self) {
        let mut violations = Vec::new();

        for (query_id, expected) in &self.expected {
            let cached = match self.cache.get(query_id).await {
                Ok(Some(entry)) => entry.latest.metric,
                Ok(None) => {
                    violations.push(format!("{}: missing from cache", query_id));
                    continue;
                }
                Err(e) => {
                    violations.push(format!("{}: cache read failed: {}", query_id, e));
                    continue;
                }
            };
            check_metric(&mut violations, "cache", &cached, expected);

            let record = match self.backing.read(query_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    violations.push(format!("{}: missing from store", query_id));
                    continue;
                }
                Err(e) => {
                    violations.push(format!("{}: store read failed: {}", query_id, e));
                    continue;
                }
            };
            if record.has_duplicates() {
                violations.push(format!(
                    "{}: duplicate stored fields {:?}",
                    query_id,
                    record.duplicate_fields()
                ));
            }
            let stored = record.to_metric();
            let mut stored_expected = expected.clone();
            // Stored dates keep whole seconds
            stored_expected.last_updated = expected.last_updated.map(|t| t - t.rem_euclid(1_000));
            check_metric(&mut violations, "store", &stored, &stored_expected);
        }

        self.result.invariant_violations.extend(violations);
    }

    pub fn result(&self) -> &PipelineDstResult {
        &self.result
    }

    pub fn into_result(self) -> PipelineDstResult {
        self.result
    }
}

fn check_metric(
    violations: &mut Vec<String>,
    source: &str,
    actual: &QueryMetric,
    expected: &ExpectedQuery,
) {
    let id = &actual.query_id;
    if counters(actual) != expected.counters {
        violations.push(format!(
            "{} {}: counters {:?}, expected {:?}",
            source,
            id,
            counters(actual),
            expected.counters
        ));
    }
    if actual.num_updates != expected.num_updates {
        violations.push(format!(
            "{} {}: num_updates {}, expected {}",
            source, id, actual.num_updates, expected.num_updates
        ));
    }
    if actual.lifecycle != expected.lifecycle {
        violations.push(format!(
            "{} {}: lifecycle {}, expected {}",
            source, id, actual.lifecycle, expected.lifecycle
        ));
    }
    if actual.last_updated != expected.last_updated {
        violations.push(format!(
            "{} {}: last_updated {:?}, expected {:?}",
            source, id, actual.last_updated, expected.last_updated
        ));
    }
    let numbers: Vec<u64> = actual.page_times.iter().map(|p| p.page_number).collect();
    let expected_numbers: Vec<u64> = expected.pages.iter().copied().collect();
    if numbers != expected_numbers {
        violations.push(format!(
            "{} {}: pages {:?}, expected {:?}",
            source, id, numbers, expected_numbers
        ));
    }
    for p in &actual.page_times {
        if *p != page(p.page_number) {
            violations.push(format!("{} {}: page {} content changed", source, id, p.page_number));
        }
    }
}

/// Run `count` seeds starting at `base_seed`
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> PipelineDstConfig,
) -> Vec<PipelineDstResult> {
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let mut harness = PipelineHarness::new(config_fn(base_seed + i as u64));
        harness.run().await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }
    results
}

pub fn summarize_batch(results: &[PipelineDstResult]) -> String {
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();
    let deliveries: u64 = results.iter().map(|r| r.deliveries).sum();
    let redeliveries: u64 = results.iter().map(|r| r.redeliveries).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} deliveries, {} redeliveries",
        passed,
        results.len(),
        deliveries,
        redeliveries
    );
    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }
    summary
}
