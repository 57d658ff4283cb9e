//! Sharded actor cache.
//!
//! Each shard is a tokio task that owns its entries and handles one message
//! at a time, so every per-key task on a shard runs alone. Keys are routed
//! to shards by hash. Entries are held as bincode bytes, the way a remote
//! cache node would hold them.

use super::{CacheFuture, CacheStats, CachedMetric, KeyOutcome, KeyTask, MetricCache};
use crate::config::CacheConfig;
use crate::error::{CacheError, MetricError};
use ahash::AHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type ExecuteResult = Result<Option<CachedMetric>, MetricError>;

enum ShardMessage {
    Get {
        key: String,
        response_tx: oneshot::Sender<Option<Vec<u8>>>,
    },
    Put {
        key: String,
        bytes: Vec<u8>,
        response_tx: oneshot::Sender<()>,
    },
    Remove {
        key: String,
        response_tx: oneshot::Sender<Option<Vec<u8>>>,
    },
    Execute {
        key: String,
        task: KeyTask,
        response_tx: oneshot::Sender<ExecuteResult>,
    },
    Stats {
        response_tx: oneshot::Sender<CacheStats>,
    },
}

fn encode(entry: &CachedMetric) -> Result<Vec<u8>, CacheError> {
    bincode::serialize(entry).map_err(|e| CacheError::Codec(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<CachedMetric, CacheError> {
    bincode::deserialize(bytes).map_err(|e| CacheError::Codec(e.to_string()))
}

struct ShardActor {
    entries: HashMap<String, Vec<u8>>,
    stats: CacheStats,
    rx: mpsc::UnboundedReceiver<ShardMessage>,
    shard_id: usize,
}

impl ShardActor {
    fn new(rx: mpsc::UnboundedReceiver<ShardMessage>, shard_id: usize) -> Self {
        ShardActor {
            entries: HashMap::new(),
            stats: CacheStats::default(),
            rx,
            shard_id,
        }
    }

    fn lookup(&mut self, key: &str) -> Option<Vec<u8>> {
        let found = self.entries.get(key).cloned();
        if found.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        found
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ShardMessage::Get { key, response_tx } => {
                    let found = self.lookup(&key);
                    let _ = response_tx.send(found);
                }
                ShardMessage::Put {
                    key,
                    bytes,
                    response_tx,
                } => {
                    self.entries.insert(key, bytes);
                    self.stats.puts += 1;
                    let _ = response_tx.send(());
                }
                ShardMessage::Remove { key, response_tx } => {
                    let _ = response_tx.send(self.entries.remove(&key));
                }
                ShardMessage::Execute {
                    key,
                    task,
                    response_tx,
                } => {
                    let result = self.execute(key, task).await;
                    let _ = response_tx.send(result);
                }
                ShardMessage::Stats { response_tx } => {
                    let mut stats = self.stats;
                    stats.entries = self.entries.len() as u64;
                    let _ = response_tx.send(stats);
                }
            }
        }
        debug!(shard_id = self.shard_id, "cache shard stopped");
    }

    async fn execute(&mut self, key: String, task: KeyTask) -> ExecuteResult {
        self.stats.executions += 1;
        let current = match self.lookup(&key) {
            Some(bytes) => Some(decode(&bytes)?),
            None => None,
        };

        match task(current.clone()).await? {
            KeyOutcome::Put(entry) => {
                let bytes = encode(&entry)?;
                self.entries.insert(key, bytes);
                self.stats.puts += 1;
                Ok(Some(entry))
            }
            KeyOutcome::Keep => Ok(current),
        }
    }
}

#[derive(Clone)]
struct ShardHandle {
    tx: mpsc::UnboundedSender<ShardMessage>,
    shard_id: usize,
}

impl ShardHandle {
    fn send(&self, msg: ShardMessage) -> Result<(), CacheError> {
        self.tx.send(msg).map_err(|_| {
            warn!(shard_id = self.shard_id, "cache shard channel closed");
            CacheError::Unavailable(format!("shard {} stopped", self.shard_id))
        })
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, CacheError> {
        rx.await
            .map_err(|_| CacheError::Unavailable(format!("shard {} dropped response", self.shard_id)))
    }
}

/// Cache client handle; clones share the same shards
#[derive(Clone)]
pub struct ShardedMetricCache {
    shards: Arc<[ShardHandle]>,
    execute_timeout: Duration,
}

impl ShardedMetricCache {
    /// Spawn `num_shards` shard tasks. Must be called inside a tokio runtime.
    pub fn new(num_shards: usize, execute_timeout: Duration) -> Self {
        let num_shards = num_shards.max(1);
        let shards: Vec<ShardHandle> = (0..num_shards)
            .map(|shard_id| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(ShardActor::new(rx, shard_id).run());
                ShardHandle { tx, shard_id }
            })
            .collect();

        ShardedMetricCache {
            shards: shards.into(),
            execute_timeout,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.num_shards, config.execute_timeout)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_for(&self, key: &str) -> &ShardHandle {
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }
}

impl MetricCache for ShardedMetricCache {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<CachedMetric>> {
        Box::pin(async move {
            let shard = self.shard_for(key);
            let (response_tx, response_rx) = oneshot::channel();
            shard.send(ShardMessage::Get {
                key: key.to_string(),
                response_tx,
            })?;
            match shard.recv(response_rx).await? {
                Some(bytes) => Ok(Some(decode(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, entry: CachedMetric) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let shard = self.shard_for(key);
            let bytes = encode(&entry)?;
            let (response_tx, response_rx) = oneshot::channel();
            shard.send(ShardMessage::Put {
                key: key.to_string(),
                bytes,
                response_tx,
            })?;
            shard.recv(response_rx).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<CachedMetric>> {
        Box::pin(async move {
            let shard = self.shard_for(key);
            let (response_tx, response_rx) = oneshot::channel();
            shard.send(ShardMessage::Remove {
                key: key.to_string(),
                response_tx,
            })?;
            match shard.recv(response_rx).await? {
                Some(bytes) => Ok(Some(decode(&bytes)?)),
                None => Ok(None),
            }
        })
    }

    fn execute_on_key<'a>(
        &'a self,
        key: &'a str,
        task: KeyTask,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CachedMetric>, MetricError>> + Send + 'a>> {
        Box::pin(async move {
            let shard = self.shard_for(key);
            let (response_tx, response_rx) = oneshot::channel();
            shard.send(ShardMessage::Execute {
                key: key.to_string(),
                task,
                response_tx,
            })?;
            match tokio::time::timeout(self.execute_timeout, shard.recv(response_rx)).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(query_id = key, "per-key execution timed out");
                    Err(CacheError::Timeout.into())
                }
            }
        })
    }

    fn stats(&self) -> CacheFuture<'_, CacheStats> {
        Box::pin(async move {
            let mut pending = Vec::with_capacity(self.shards.len());
            for shard in self.shards.iter() {
                let (response_tx, response_rx) = oneshot::channel();
                shard.send(ShardMessage::Stats { response_tx })?;
                pending.push((shard, response_rx));
            }
            let mut total = CacheStats::default();
            for (shard, rx) in pending {
                total = total.merge(shard.recv(rx).await?);
            }
            Ok(total)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key_task;
    use crate::metric::{QueryMetric, QueryMetricUpdate};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn entry(query_id: &str, source_count: u64) -> CachedMetric {
        CachedMetric {
            latest: QueryMetricUpdate::distributed(
                QueryMetric::builder(query_id).source_count(source_count).build(),
            ),
            persisted: None,
        }
    }

    fn add_one(key: &'static str) -> KeyTask {
        key_task(move |current: Option<CachedMetric>| async move {
            let count = current.map_or(0, |c| c.latest.metric.source_count);
            tokio::task::yield_now().await;
            Ok(KeyOutcome::Put(entry(key, count + 1)))
        })
    }

    #[tokio::test]
    async fn test_get_put_remove() {
        let cache = ShardedMetricCache::new(4, Duration::from_secs(1));
        assert_eq!(cache.get("q1").await.unwrap(), None);

        cache.put("q1", entry("q1", 5)).await.unwrap();
        assert_eq!(cache.get("q1").await.unwrap(), Some(entry("q1", 5)));

        assert_eq!(cache.remove("q1").await.unwrap(), Some(entry("q1", 5)));
        assert_eq!(cache.get("q1").await.unwrap(), None);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.puts, 1);
    }

    #[tokio::test]
    async fn test_execute_on_key_is_exclusive() {
        let cache = ShardedMetricCache::new(4, Duration::from_secs(5));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.execute_on_key("q1", add_one("q1")).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let stored = cache.get("q1").await.unwrap().unwrap();
        assert_eq!(stored.latest.metric.source_count, 50);
        assert_eq!(cache.stats().await.unwrap().executions, 50);
    }

    #[tokio::test]
    async fn test_task_error_leaves_entry() {
        let cache = ShardedMetricCache::new(2, Duration::from_secs(1));
        cache.put("q1", entry("q1", 1)).await.unwrap();

        let failing = key_task(|_| async { Err(MetricError::Validation("boom".to_string())) });
        let err = cache.execute_on_key("q1", failing).await.unwrap_err();
        assert!(matches!(err, MetricError::Validation(_)));
        assert_eq!(cache.get("q1").await.unwrap(), Some(entry("q1", 1)));
    }

    #[tokio::test]
    async fn test_keep_returns_current() {
        let cache = ShardedMetricCache::new(2, Duration::from_secs(1));
        cache.put("q1", entry("q1", 3)).await.unwrap();
        let keep = key_task(|_| async { Ok(KeyOutcome::Keep) });
        let current = cache.execute_on_key("q1", keep).await.unwrap();
        assert_eq!(current, Some(entry("q1", 3)));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let cache = ShardedMetricCache::new(1, Duration::from_millis(20));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow = key_task(move |_| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(KeyOutcome::Keep)
        });
        let err = cache.execute_on_key("q1", slow).await.unwrap_err();
        assert!(matches!(err, MetricError::Cache(CacheError::Timeout)));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_clones_share_shards() {
        let a = ShardedMetricCache::new(8, Duration::from_secs(1));
        let b = a.clone();
        a.put("shared", entry("shared", 9)).await.unwrap();
        assert_eq!(b.get("shared").await.unwrap(), Some(entry("shared", 9)));
        assert_eq!(b.num_shards(), 8);
    }
}
