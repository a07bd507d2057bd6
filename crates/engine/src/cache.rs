//! Sharded LRU cache for evaluation results.
//!
//! Reads and writes contend only within a shard, keeping cache operations
//! well under the hot-path budget even with many concurrent evaluators.

use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::result::EvaluationResult;

const SHARD_COUNT: usize = 16;

/// Fixed-capacity sharded LRU keyed by the evaluation cache key.
pub struct ShardedCache {
    shards: Vec<Mutex<LruCache<String, Arc<EvaluationResult>>>>,
}

impl ShardedCache {
    /// Create a cache with `capacity` total entries spread across shards.
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity / SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT)
            .map(|_| {
                Mutex::new(LruCache::new(
                    std::num::NonZeroUsize::new(per_shard).expect("per-shard capacity is nonzero"),
                ))
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, Arc<EvaluationResult>>> {
        // Keys are hex digests with uniformly distributed bytes, so the
        // first byte is an adequate shard selector.
        let idx = key.as_bytes().first().copied().unwrap_or(0) as usize % SHARD_COUNT;
        &self.shards[idx]
    }

    pub fn get(&self, key: &str) -> Option<Arc<EvaluationResult>> {
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.get(key).cloned()
    }

    pub fn put(&self, key: String, value: Arc<EvaluationResult>) {
        let mut shard = self.shard(&key).lock().expect("cache shard poisoned");
        shard.put(key, value);
    }

    /// Drop every entry (used when a new registry snapshot is published).
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().expect("cache shard poisoned").clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("cache shard poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
