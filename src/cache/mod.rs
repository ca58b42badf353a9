//! Capacity-bounded cache absorbing cross-shard node fetches.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::model::{NodeData, NodeId};

mod lfu;

use lfu::LfuCache;

/// Operations between frequency halvings under [`EvictionPolicy::LfuDecay`].
pub const LFU_DECAY_INTERVAL: u64 = 8192;

/// Capacities below this run a single eviction store; larger caches split
/// across [`CACHE_SHARDS`] lock shards so the resident bound stays exact.
const SHARDED_MIN_CAPACITY: usize = 64;
const CACHE_SHARDS: usize = 8;

/// Which resident entry gives way when the cache is full.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the least recently accessed entry.
    Lru,
    /// Evict the least frequently accessed entry, oldest first on ties.
    Lfu,
    /// LFU whose counters are periodically halved, so entries that were hot
    /// in an earlier training epoch age out.
    LfuDecay,
}

/// Cache size, given either relative to the local shard or absolutely.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCapacity {
    /// Fraction of the local shard's node count, in `[0, 1]`.
    Fraction(f64),
    /// Absolute number of resident nodes.
    Nodes(usize),
}

impl CacheCapacity {
    /// Resolves to an entry count for a shard holding `shard_len` nodes.
    pub fn resolve(&self, shard_len: usize) -> Result<usize> {
        match *self {
            CacheCapacity::Fraction(f) => {
                if !(0.0..=1.0).contains(&f) {
                    return Err(TesseraError::Config(format!(
                        "cache fraction {f} outside [0, 1]"
                    )));
                }
                Ok((f * shard_len as f64) as usize)
            }
            CacheCapacity::Nodes(n) => Ok(n),
        }
    }
}

/// Monotone counters over the cache's lifetime.
///
/// `requests` counts every lookup routed at the cache, `misses` counts the
/// loader invocations those triggered, and `hits` is their difference.
/// Shard-local reads never touch the cache and are not counted.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups served from a resident entry.
    pub hits: u64,
    /// Lookups that invoked the loader.
    pub misses: u64,
    /// Total lookups.
    pub requests: u64,
}

enum EvictStore {
    Lru(LruCache<NodeId, Arc<NodeData>>),
    Lfu(LfuCache),
}

impl EvictStore {
    fn new(policy: EvictionPolicy, capacity: usize) -> EvictStore {
        match policy {
            EvictionPolicy::Lru => {
                let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
                EvictStore::Lru(LruCache::new(cap))
            }
            EvictionPolicy::Lfu => EvictStore::Lfu(LfuCache::new(capacity)),
            EvictionPolicy::LfuDecay => {
                EvictStore::Lfu(LfuCache::with_decay(capacity, Some(LFU_DECAY_INTERVAL)))
            }
        }
    }

    fn get(&mut self, id: NodeId) -> Option<Arc<NodeData>> {
        match self {
            EvictStore::Lru(inner) => inner.get(&id).map(Arc::clone),
            EvictStore::Lfu(inner) => inner.get(id),
        }
    }

    fn peek(&self, id: NodeId) -> Option<Arc<NodeData>> {
        match self {
            EvictStore::Lru(inner) => inner.peek(&id).map(Arc::clone),
            EvictStore::Lfu(inner) => inner.peek(id),
        }
    }

    fn insert(&mut self, id: NodeId, value: Arc<NodeData>) {
        match self {
            EvictStore::Lru(inner) => {
                inner.put(id, value);
            }
            EvictStore::Lfu(inner) => inner.insert(id, value),
        }
    }

    fn len(&self) -> usize {
        match self {
            EvictStore::Lru(inner) => inner.len(),
            EvictStore::Lfu(inner) => inner.len(),
        }
    }
}

/// Thread-safe node cache with a hard resident bound.
///
/// Lookups route to a lock shard by id; each shard owns an exact slice of
/// the total capacity, so the sum of residents never exceeds the configured
/// bound. Loader calls run outside any lock, which means two threads racing
/// on the same absent id may both load it; the later insert wins and both
/// callers get an authoritative value.
///
/// A capacity of zero disables residency entirely: every lookup invokes the
/// loader and nothing is retained.
pub struct NodeCache {
    shards: Vec<Mutex<EvictStore>>,
    capacity: usize,
    policy: EvictionPolicy,
    requests: AtomicU64,
    misses: AtomicU64,
}

impl NodeCache {
    /// Creates a cache holding at most `capacity` nodes under `policy`.
    pub fn new(capacity: usize, policy: EvictionPolicy) -> NodeCache {
        let shards = if capacity == 0 {
            Vec::new()
        } else {
            let count = if capacity < SHARDED_MIN_CAPACITY {
                1
            } else {
                CACHE_SHARDS
            };
            let base = capacity / count;
            let extra = capacity % count;
            (0..count)
                .map(|i| {
                    let cap = base + usize::from(i < extra);
                    Mutex::new(EvictStore::new(policy, cap))
                })
                .collect()
        };
        NodeCache {
            shards,
            capacity,
            policy,
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Pass-through cache: nothing resident, every lookup loads.
    pub fn disabled() -> NodeCache {
        NodeCache::new(0, EvictionPolicy::Lru)
    }

    fn route(&self, id: NodeId) -> usize {
        (id.0 % self.shards.len() as u64) as usize
    }

    /// Returns `id`'s data, invoking `fetch` on a miss and retaining the
    /// result subject to capacity. Exactly one entry is evicted when an
    /// insertion overflows a full shard.
    pub fn get_or_fetch<F>(&self, id: NodeId, fetch: F) -> Result<Arc<NodeData>>
    where
        F: FnOnce() -> Result<Arc<NodeData>>,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.shards.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return fetch();
        }
        let slot = &self.shards[self.route(id)];
        if let Some(hit) = slot.lock().get(id) {
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        // Load outside the lock; the fetch may block on another shard.
        let value = fetch()?;
        slot.lock().insert(id, Arc::clone(&value));
        Ok(value)
    }

    /// Looks `id` up without counting or touching eviction state.
    pub fn peek(&self, id: NodeId) -> Option<Arc<NodeData>> {
        if self.shards.is_empty() {
            return None;
        }
        self.shards[self.route(id)].lock().peek(id)
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// True when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured resident bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured eviction policy.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Counter snapshot. Reads are unsynchronized with in-flight lookups,
    /// so totals are exact only while the cache is quiescent.
    pub fn stats(&self) -> CacheStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits: requests.saturating_sub(misses),
            misses,
            requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(tag: i32) -> Arc<NodeData> {
        Arc::new(NodeData {
            features: vec![tag as f32, tag as f32 + 0.5],
            ints: vec![tag, 1],
            neighbors: vec![NodeId(tag as u64 + 1)],
        })
    }

    #[test]
    fn hit_after_miss() -> Result<()> {
        let cache = NodeCache::new(4, EvictionPolicy::Lru);
        let a = cache.get_or_fetch(NodeId(7), || Ok(data(7)))?;
        let b = cache.get_or_fetch(NodeId(7), || panic!("must be resident"))?;
        assert_eq!(a, b);
        let stats = cache.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        Ok(())
    }

    #[test]
    fn capacity_bound_holds_for_each_policy() -> Result<()> {
        for policy in [
            EvictionPolicy::Lru,
            EvictionPolicy::Lfu,
            EvictionPolicy::LfuDecay,
        ] {
            let cache = NodeCache::new(5, policy);
            for i in 0..40u64 {
                cache.get_or_fetch(NodeId(i), || Ok(data(i as i32)))?;
                assert!(cache.len() <= 5, "{policy:?} exceeded capacity");
            }
            assert_eq!(cache.len(), 5);
        }
        Ok(())
    }

    #[test]
    fn lru_eviction_follows_recency() -> Result<()> {
        let cache = NodeCache::new(2, EvictionPolicy::Lru);
        cache.get_or_fetch(NodeId(1), || Ok(data(1)))?;
        cache.get_or_fetch(NodeId(2), || Ok(data(2)))?;
        cache.get_or_fetch(NodeId(1), || panic!("resident"))?;
        cache.get_or_fetch(NodeId(3), || Ok(data(3)))?;
        assert!(cache.peek(NodeId(1)).is_some());
        assert!(cache.peek(NodeId(2)).is_none());
        assert!(cache.peek(NodeId(3)).is_some());
        Ok(())
    }

    #[test]
    fn zero_capacity_is_pass_through() -> Result<()> {
        let cache = NodeCache::disabled();
        for _ in 0..3 {
            cache.get_or_fetch(NodeId(9), || Ok(data(9)))?;
        }
        assert_eq!(cache.len(), 0);
        let stats = cache.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.hits, 0);
        Ok(())
    }

    #[test]
    fn fraction_capacity_resolves_against_shard() -> Result<()> {
        assert_eq!(CacheCapacity::Fraction(0.3).resolve(1000)?, 300);
        assert_eq!(CacheCapacity::Fraction(0.0).resolve(1000)?, 0);
        assert_eq!(CacheCapacity::Fraction(1.0).resolve(677)?, 677);
        assert_eq!(CacheCapacity::Nodes(42).resolve(1000)?, 42);
        assert!(CacheCapacity::Fraction(1.5).resolve(10).is_err());
        assert!(CacheCapacity::Fraction(-0.1).resolve(10).is_err());
        Ok(())
    }

    #[test]
    fn fetch_error_is_not_retained() {
        let cache = NodeCache::new(4, EvictionPolicy::Lru);
        let err = cache
            .get_or_fetch(NodeId(1), || {
                Err(TesseraError::Config("loader failed".into()))
            })
            .unwrap_err();
        assert!(matches!(err, TesseraError::Config(_)));
        assert_eq!(cache.len(), 0);
        // The failed lookup still counted as a request and a miss.
        let stats = cache.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn sharded_capacity_splits_exactly() -> Result<()> {
        // 67 = 8*8 + 3: three shards get 9, five get 8.
        let cache = NodeCache::new(67, EvictionPolicy::Lru);
        for i in 0..500u64 {
            cache.get_or_fetch(NodeId(i), || Ok(data(i as i32)))?;
        }
        assert!(cache.len() <= 67);
        Ok(())
    }
}
