//! Periodic cache statistics reporting.

use super::ShutdownGate;
use crate::cache::{CacheStats, MetricCache};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Destination for periodic statistics snapshots
pub trait StatsSink: Send + Sync + 'static {
    fn record(&self, stats: &CacheStats);
}

/// Writes snapshots to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStatsSink;

impl StatsSink for LoggingStatsSink {
    fn record(&self, stats: &CacheStats) {
        info!(
            entries = stats.entries,
            hits = stats.hits,
            misses = stats.misses,
            puts = stats.puts,
            executions = stats.executions,
            hit_ratio = stats.hit_ratio(),
            "cache statistics"
        );
    }
}

/// Fixed-rate task that snapshots cache statistics until the gate closes
pub struct StatsReporter {
    cache: Arc<dyn MetricCache>,
    sink: Arc<dyn StatsSink>,
    period: Duration,
    gate: ShutdownGate,
}

impl StatsReporter {
    pub fn new(
        cache: Arc<dyn MetricCache>,
        sink: Arc<dyn StatsSink>,
        period: Duration,
        gate: ShutdownGate,
    ) -> Self {
        StatsReporter {
            cache,
            sink,
            period,
            gate,
        }
    }

    pub async fn run(self) {
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.cache.stats().await {
                        Ok(stats) => self.sink.record(&stats),
                        Err(e) => warn!(error = %e, "cache statistics unavailable"),
                    }
                }
                _ = self.gate.closed() => break,
            }
        }
        debug!("stats reporter stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ShardedMetricCache;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<CacheStats>>);

    impl StatsSink for CollectingSink {
        fn record(&self, stats: &CacheStats) {
            self.0.lock().push(*stats);
        }
    }

    #[tokio::test]
    async fn test_reports_until_gate_closes() {
        let cache = ShardedMetricCache::new(2, Duration::from_secs(1));
        let sink = Arc::new(CollectingSink::default());
        let gate = ShutdownGate::new();
        let handle = StatsReporter::new(
            Arc::new(cache),
            sink.clone(),
            Duration::from_millis(10),
            gate.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(60)).await;
        gate.close().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let reports = sink.0.lock().len();
        assert!(reports >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.0.lock().len(), reports);
    }
}
