//! Correlation id to completion-signal registry.
//!
//! Sharded so concurrent submitters only contend on their own shard. Every
//! entry is inserted before send and removed once the submitter stops
//! waiting, whatever the outcome.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

const NUM_SHARDS: usize = 16;

/// Pending acknowledgment latches; clones share the same registry
#[derive(Clone)]
pub struct AckRegistry {
    shards: Arc<[Mutex<AHashMap<Uuid, oneshot::Sender<()>>>]>,
    hasher: ahash::RandomState,
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AckRegistry {
    pub fn new() -> Self {
        let shards: Vec<_> = (0..NUM_SHARDS).map(|_| Mutex::new(AHashMap::new())).collect();
        AckRegistry {
            shards: shards.into(),
            hasher: ahash::RandomState::new(),
        }
    }

    #[inline]
    fn shard(&self, id: &Uuid) -> &Mutex<AHashMap<Uuid, oneshot::Sender<()>>> {
        let mut hasher = self.hasher.build_hasher();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Register a latch for `id`; the receiver resolves when it is completed
    pub fn register(&self, id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.shard(&id).lock().insert(id, tx);
        rx
    }

    /// Fire the latch for `id`. Returns false if `id` is not registered.
    pub fn complete(&self, id: &Uuid) -> bool {
        match self.shard(id).lock().remove(id) {
            Some(tx) => {
                // The waiter may have just given up; the latch still counts as fired
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Drop the latch for `id`. Returns true if it was still registered.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.shard(id).lock().remove(id).is_some()
    }

    /// Number of registered latches
    pub fn pending(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}
